use chrono::{DateTime, Utc};
use std::str::FromStr;

/// Errors from parsing a schedule expression.
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("cron expressions are evaluated in UTC; timezone prefixes are not supported")]
    Timezone,

    #[error("cron expression must have 5 fields (minute hour day month weekday), got {0}")]
    FieldCount(usize),

    #[error("invalid cron expression: {0}")]
    Parse(String),
}

/// A five-field cron expression, evaluated in UTC only.
#[derive(Debug, Clone)]
pub struct CronExpr {
    expr: String,
    schedule: cron::Schedule,
}

impl CronExpr {
    /// Parse a standard five-field expression. Expressions carrying a
    /// `CRON_TZ=` or `TZ=` prefix are rejected outright rather than silently
    /// evaluated in the wrong zone.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let trimmed = expr.trim();
        if trimmed.starts_with("CRON_TZ=") || trimmed.starts_with("TZ=") {
            return Err(CronError::Timezone);
        }

        let fields = trimmed.split_whitespace().count();
        if fields != 5 {
            return Err(CronError::FieldCount(fields));
        }

        // The parser wants a seconds field; pin it to zero.
        let schedule = cron::Schedule::from_str(&format!("0 {}", trimmed))
            .map_err(|e| CronError::Parse(e.to_string()))?;

        Ok(Self {
            expr: trimmed.to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// Next fire instant strictly after the reference time, in UTC. `None`
    /// when the expression never fires again.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&reference).next()
    }
}
