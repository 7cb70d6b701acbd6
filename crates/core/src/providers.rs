use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Connection settings for one upstream provider (model endpoint, secret
/// reference, etc.). Opaque to the execution substrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub config: Value,
}

/// Immutable copy of the provider map taken at plan time, so a run hydrates
/// against one consistent view even while providers are being edited.
#[derive(Debug, Clone, Default)]
pub struct ProviderSnapshot {
    providers: HashMap<String, ProviderConfig>,
}

impl ProviderSnapshot {
    pub fn get(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.get(id)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Process-shared provider map. Readers snapshot under the shared role;
/// mutations take the exclusive role.
#[derive(Default)]
pub struct ProviderMap {
    inner: RwLock<HashMap<String, ProviderConfig>>,
}

impl ProviderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, provider: ProviderConfig) {
        self.inner
            .write()
            .unwrap()
            .insert(provider.id.clone(), provider);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.inner.write().unwrap().remove(id).is_some()
    }

    pub fn snapshot(&self) -> ProviderSnapshot {
        ProviderSnapshot {
            providers: self.inner.read().unwrap().clone(),
        }
    }
}
