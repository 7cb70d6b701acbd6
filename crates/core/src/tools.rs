use crate::workflow::WorkflowRecord;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A callable tool exposed to nodes during a run. Implementations live
/// outside this crate; the runtime only invokes them and records the call
/// and result events.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, args: Value) -> anyhow::Result<Value>;
}

/// The live set of tools available to one run.
#[derive(Default, Clone)]
pub struct ToolSet {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Builds the live tool set for a workflow. External collaborator; the
/// orchestrator only calls `build` during planning.
pub trait ToolRegistry: Send + Sync {
    fn build(&self, workflow: &WorkflowRecord) -> anyhow::Result<ToolSet>;
}

/// Registry that exposes no tools. Default for deployments without a tool
/// catalogue.
pub struct EmptyToolRegistry;

impl ToolRegistry for EmptyToolRegistry {
    fn build(&self, _workflow: &WorkflowRecord) -> anyhow::Result<ToolSet> {
        Ok(ToolSet::new())
    }
}
