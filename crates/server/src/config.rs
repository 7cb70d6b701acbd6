use crate::nodes::BuiltinNodeFactory;
use anyhow::{Context, Result};
use redb::Database;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use trellis_core::bus::EventBus;
use trellis_core::history::RunHistory;
use trellis_core::providers::ProviderMap;
use trellis_core::runner::{Runner, RunnerConfig};
use trellis_core::schedule::{RedbScheduleStore, ScheduleStore};
use trellis_core::scheduler::{Scheduler, SchedulerConfig};
use trellis_core::store::{EventStore, RedbEventStore, RetentionConfig};
use trellis_core::tracker::ActiveRuns;
use trellis_core::types::parse_duration;
use trellis_core::webhook::WebhookDispatcher;
use trellis_core::workflow::{RedbWorkflowStore, WorkflowStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub retention: RetentionSettings,

    #[serde(default)]
    pub runner: RunnerSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub bus: BusSettings,

    #[serde(default)]
    pub limits: LimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Workflow and schedule records
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// The append-only event log
    #[serde(default = "default_events_file")]
    pub events_file: String,
}

fn default_state_file() -> String {
    "state.redb".to_string()
}

fn default_events_file() -> String {
    "events.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            events_file: default_events_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    /// Duration string; events older than this are pruned
    #[serde(default)]
    pub age: Option<String>,

    /// Keep at most this many events per run
    #[serde(default)]
    pub count: Option<u64>,

    #[serde(default = "default_prune_interval")]
    pub prune_interval: String,
}

fn default_prune_interval() -> String {
    "1h".to_string()
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            age: None,
            count: None,
            prune_interval: default_prune_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    #[serde(default = "default_run_timeout")]
    pub default_timeout: String,

    #[serde(default = "default_coalesce_interval")]
    pub coalesce_interval: String,

    #[serde(default = "default_drain_window")]
    pub stream_drain_window: String,
}

fn default_run_timeout() -> String {
    "5m".to_string()
}

fn default_coalesce_interval() -> String {
    "100ms".to_string()
}

fn default_drain_window() -> String {
    "100ms".to_string()
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            default_timeout: default_run_timeout(),
            coalesce_interval: default_coalesce_interval(),
            stream_drain_window: default_drain_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

fn default_poll_interval() -> String {
    "5s".to_string()
}

fn default_batch_limit() -> usize {
    100
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            batch_limit: default_batch_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    #[serde(default = "default_subscription_capacity")]
    pub subscription_capacity: usize,
}

fn default_subscription_capacity() -> usize {
    256
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            subscription_capacity: default_subscription_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &PathBuf, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("failed to read configuration file")?;
            toml::from_str(&content).context("failed to parse configuration file")?
        } else {
            tracing::info!("configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                retention: Default::default(),
                runner: Default::default(),
                scheduler: Default::default(),
                bus: Default::default(),
                limits: Default::default(),
            }
        };

        config.data_dir = data_dir;
        Ok(config)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.state_file)
    }

    pub fn events_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.events_file)
    }

    fn retention_config(&self) -> Result<RetentionConfig> {
        let age = match &self.retention.age {
            Some(s) => Some(parse_duration(s).map_err(anyhow::Error::msg)?),
            None => None,
        };
        Ok(RetentionConfig {
            retention_age: age,
            retention_count: self.retention.count,
            prune_interval: parse_duration(&self.retention.prune_interval)
                .map_err(anyhow::Error::msg)?,
        })
    }

    fn runner_config(&self) -> Result<RunnerConfig> {
        Ok(RunnerConfig {
            default_timeout: parse_duration(&self.runner.default_timeout)
                .map_err(anyhow::Error::msg)?,
            coalesce_interval: parse_duration(&self.runner.coalesce_interval)
                .map_err(anyhow::Error::msg)?,
            stream_drain_window: parse_duration(&self.runner.stream_drain_window)
                .map_err(anyhow::Error::msg)?,
        })
    }

    fn scheduler_config(&self) -> Result<SchedulerConfig> {
        Ok(SchedulerConfig {
            poll_interval: parse_duration(&self.scheduler.poll_interval)
                .map_err(anyhow::Error::msg)?,
            batch_limit: self.scheduler.batch_limit,
        })
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub event_store: Arc<dyn EventStore>,
    pub workflow_store: Arc<dyn WorkflowStore>,
    pub schedule_store: Arc<dyn ScheduleStore>,
    pub providers: Arc<ProviderMap>,
    pub tracker: Arc<ActiveRuns>,
    pub runner: Arc<Runner>,
    pub history: Arc<RunHistory>,
    pub scheduler: Arc<Scheduler>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let state_db = Arc::new(
            Database::create(config.state_path()).context("failed to open state database")?,
        );

        let workflow_store: Arc<dyn WorkflowStore> = Arc::new(
            RedbWorkflowStore::new(state_db.clone())
                .context("failed to create workflow store")?,
        );
        let schedule_store: Arc<dyn ScheduleStore> = Arc::new(
            RedbScheduleStore::new(state_db).context("failed to create schedule store")?,
        );

        let event_store: Arc<dyn EventStore> = Arc::new(
            RedbEventStore::open(config.events_path(), config.retention_config()?)
                .context("failed to create event store")?,
        );

        let bus = Arc::new(EventBus::with_capacity(config.bus.subscription_capacity));
        let providers = Arc::new(ProviderMap::new());
        let tracker = Arc::new(ActiveRuns::new());

        let runner = Arc::new(
            Runner::new(workflow_store.clone(), Arc::new(BuiltinNodeFactory))
                .with_bus(bus.clone())
                .with_store(event_store.clone())
                .with_providers(providers.clone())
                .with_tracker(tracker.clone())
                .with_config(config.runner_config()?),
        );

        let history = Arc::new(RunHistory::new(event_store.clone(), tracker.clone()));
        let scheduler = Arc::new(Scheduler::new(
            schedule_store.clone(),
            runner.clone(),
            config.scheduler_config()?,
        ));
        let webhooks = Arc::new(WebhookDispatcher::new(workflow_store.clone(), runner.clone()));

        Ok(Self {
            bus,
            event_store,
            workflow_store,
            schedule_store,
            providers,
            tracker,
            runner,
            history,
            scheduler,
            webhooks,
            max_body_bytes: config.limits.max_body_bytes,
        })
    }
}
