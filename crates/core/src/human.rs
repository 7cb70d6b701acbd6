use crate::types::parse_duration;
use serde_json::Value;
use std::time::Duration;

/// How the runtime answers a human-in-the-loop node without a human present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HumanMode {
    /// Any human request fails the run with an explanatory error
    #[default]
    Strict,
    AutoApprove,
    AutoReject,
}

impl HumanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HumanMode::Strict => "strict",
            HumanMode::AutoApprove => "auto_approve",
            HumanMode::AutoReject => "auto_reject",
        }
    }
}

/// Policy applied when a node requests human input.
#[derive(Debug, Clone, Default)]
pub struct HumanPolicy {
    pub mode: HumanMode,
    pub choice: Option<String>,
    pub notes: Option<String>,
    pub responded_by: Option<String>,
    pub delay: Option<Duration>,
}

/// The synthetic answer handed back to a node under a non-strict policy.
#[derive(Debug, Clone)]
pub struct HumanResponse {
    pub approved: bool,
    pub choice: Option<String>,
    pub notes: Option<String>,
    pub responded_by: String,
}

impl HumanPolicy {
    /// Build a policy from the `human` object of a run's options. Absent
    /// options mean strict mode.
    pub fn from_options(options: Option<&Value>) -> Result<Self, String> {
        let Some(value) = options else {
            return Ok(Self::default());
        };

        let obj = value
            .as_object()
            .ok_or_else(|| "human options must be an object".to_string())?;

        let mode = match obj.get("mode").and_then(Value::as_str) {
            None | Some("strict") => HumanMode::Strict,
            Some("auto_approve") => HumanMode::AutoApprove,
            Some("auto_reject") => HumanMode::AutoReject,
            Some(other) => return Err(format!("unknown human handling mode {:?}", other)),
        };

        let delay = match obj.get("delay").and_then(Value::as_str) {
            Some(s) => Some(parse_duration(s).map_err(|e| format!("invalid human delay: {}", e))?),
            None => None,
        };

        Ok(Self {
            mode,
            choice: obj.get("choice").and_then(Value::as_str).map(String::from),
            notes: obj.get("notes").and_then(Value::as_str).map(String::from),
            responded_by: obj
                .get("responded_by")
                .and_then(Value::as_str)
                .map(String::from),
            delay,
        })
    }

    /// Resolve a request under this policy. `None` means the run must fail
    /// (strict mode).
    pub fn resolve(&self) -> Option<HumanResponse> {
        let approved = match self.mode {
            HumanMode::Strict => return None,
            HumanMode::AutoApprove => true,
            HumanMode::AutoReject => false,
        };

        Some(HumanResponse {
            approved,
            choice: self.choice.clone(),
            notes: self.notes.clone(),
            responded_by: self
                .responded_by
                .clone()
                .unwrap_or_else(|| self.mode.as_str().to_string()),
        })
    }
}
