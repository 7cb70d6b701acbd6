use serde_json::Value;
use std::sync::Arc;
use trellis_core::envelope::Envelope;
use trellis_core::graph::NodeDef;
use trellis_core::providers::ProviderSnapshot;
use trellis_core::runtime::{Node, NodeContext, NodeFactory, NodeOutput};

/// Node registry for deployments without an external one. Covers the
/// structural kinds the substrate itself needs (trigger entry points and
/// simple variable plumbing); richer kinds come from a custom factory.
pub struct BuiltinNodeFactory;

impl NodeFactory for BuiltinNodeFactory {
    fn hydrate(
        &self,
        def: &NodeDef,
        _providers: &ProviderSnapshot,
    ) -> anyhow::Result<Arc<dyn Node>> {
        match def.kind.as_str() {
            "noop" => Ok(Arc::new(PassthroughNode)),
            kind if kind.starts_with("trigger") => Ok(Arc::new(PassthroughNode)),
            "set" => {
                let vars = def
                    .config
                    .get("vars")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                Ok(Arc::new(SetNode { vars }))
            }
            other => anyhow::bail!("unknown node kind {:?}", other),
        }
    }
}

/// Forwards the envelope unchanged. Trigger nodes hydrate to this: their
/// payload was already projected into the envelope at dispatch time.
struct PassthroughNode;

#[async_trait::async_trait]
impl Node for PassthroughNode {
    async fn execute(&self, _ctx: &NodeContext, envelope: Envelope) -> anyhow::Result<NodeOutput> {
        Ok(NodeOutput::advance(envelope))
    }
}

/// Merges a configured object into the envelope's variable bag.
struct SetNode {
    vars: serde_json::Map<String, Value>,
}

#[async_trait::async_trait]
impl Node for SetNode {
    async fn execute(
        &self,
        _ctx: &NodeContext,
        mut envelope: Envelope,
    ) -> anyhow::Result<NodeOutput> {
        for (key, value) in &self.vars {
            envelope.set_var(key.clone(), value.clone());
        }
        Ok(NodeOutput::advance(envelope))
    }
}
