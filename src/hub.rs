//! Hub assembly
//!
//! Wires storage, the event bus, the queue, the agent state machine, the
//! scheduler, and the session registry into one running hub with ordered
//! startup and graceful shutdown. Components never call each other
//! directly in both directions; all back edges go over the bus.

use crate::agents::{AgentFsm, AgentFsmHandle, AgentRecord, FsmError};
use crate::config::{ConfigError, HubConfig};
use crate::events::{EventBus, event, topic};
use crate::queue::{QueueError, QueueStats, TaskQueue, TaskQueueHandle};
use crate::scheduler::{Scheduler, SchedulerDeps, SchedulerHandle};
use crate::session::{
    AllowAllAuth, AuthValidator, LogMetricsSink, MetricsSink, SessionContext, SessionRegistry,
    ViolationBackoff, spawn_push_relay,
};
use crate::storage::{Database, StorageError, table};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Hub startup/runtime errors
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Fsm(#[from] FsmError),
}

/// Where the hub keeps its durable tables
#[derive(Debug, Clone)]
pub enum HubStorage {
    /// On-disk SQLite file
    Path(PathBuf),
    /// Ephemeral in-memory store (tests, scratch hubs)
    InMemory,
}

/// External collaborators injected at startup
pub struct HubDeps {
    pub scheduler: SchedulerDeps,
    pub auth: Arc<dyn AuthValidator>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Default for HubDeps {
    fn default() -> Self {
        Self {
            scheduler: SchedulerDeps::default(),
            auth: Arc::new(AllowAllAuth),
            metrics: Arc::new(LogMetricsSink),
        }
    }
}

/// One running coordination hub
pub struct Hub {
    config: HubConfig,
    bus: EventBus,
    queue: TaskQueueHandle,
    fsm: AgentFsmHandle,
    scheduler: SchedulerHandle,
    sessions: SessionRegistry,
    session_ctx: SessionContext,
    db: Database,
    relay: JoinHandle<()>,
}

impl Hub {
    /// Opens storage, applies runtime config overrides, and starts every
    /// component in dependency order.
    ///
    /// # Errors
    /// `HubError` when validation or storage bring-up fails.
    pub async fn start(
        mut config: HubConfig,
        storage: HubStorage,
        deps: HubDeps,
    ) -> Result<Self, HubError> {
        config.validate()?;

        let db = match storage {
            HubStorage::Path(path) => Database::open(&path).await?,
            HubStorage::InMemory => Database::open_in_memory().await?,
        };

        // Runtime overrides persisted by the config collaborator win over
        // compiled defaults.
        let overrides = db.table(table::CONFIG);
        let mut pending: Vec<(String, String)> = Vec::new();
        overrides
            .for_each::<String, _>(|key, value| pending.push((key, value)))
            .await?;
        for (key, value) in pending {
            if let Err(e) = config.apply_override(&key, &value) {
                warn!(key, value, %e, "ignoring bad config override");
            }
        }
        config.validate()?;

        let bus = EventBus::new(config.bus_capacity);
        let queue = TaskQueue::spawn(&db, bus.clone(), &config).await?;
        let fsm = AgentFsm::spawn(bus.clone(), queue.clone(), &config);
        let scheduler = Scheduler::spawn(
            bus.clone(),
            queue.clone(),
            fsm.clone(),
            deps.scheduler,
            &config,
        );

        let sessions = SessionRegistry::new();
        let relay = spawn_push_relay(&bus, sessions.clone());
        let backoff = ViolationBackoff::new(
            db.table(table::SESSION_BACKOFF),
            config.backoff_ladder_ms.clone(),
        );

        let session_ctx = SessionContext {
            queue: queue.clone(),
            fsm: fsm.clone(),
            bus: bus.clone(),
            registry: sessions.clone(),
            backoff,
            auth: deps.auth,
            metrics: deps.metrics,
            config: config.clone(),
        };

        // Anything left queued from a previous run gets a first look.
        scheduler.kick();
        info!("hub started");

        Ok(Self {
            config,
            bus,
            queue,
            fsm,
            scheduler,
            sessions,
            session_ctx,
            db,
            relay,
        })
    }

    /// The effective configuration after overrides
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The shared event bus
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Queue handle for submitters
    #[must_use]
    pub fn queue(&self) -> &TaskQueueHandle {
        &self.queue
    }

    /// Agent state machine handle
    #[must_use]
    pub fn fsm(&self) -> &AgentFsmHandle {
        &self.fsm
    }

    /// Session registry (live connections)
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Everything a new session needs
    #[must_use]
    pub fn session_context(&self) -> SessionContext {
        self.session_ctx.clone()
    }

    /// Persists a runtime config override and announces the change.
    /// Applied at the next startup; collaborators reacting live subscribe
    /// to `config_changed`.
    ///
    /// # Errors
    /// `HubError` when the key/value is invalid or the write fails.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), HubError> {
        // Validate against a scratch copy before persisting.
        let mut scratch = self.config.clone();
        scratch.apply_override(key, value)?;
        scratch.validate()?;

        self.db
            .table(table::CONFIG)
            .insert(key, &value.to_string())
            .await?;
        self.bus.publish(
            topic::BUS,
            event::CONFIG_CHANGED,
            json!({ "key": key, "value": value }),
        );
        Ok(())
    }

    /// Operator snapshot: queue stats plus all agent records
    ///
    /// # Errors
    /// `HubError` when a component is unreachable.
    pub async fn snapshot(&self) -> Result<(QueueStats, Vec<AgentRecord>), HubError> {
        let stats = self.queue.stats().await?;
        let agents = self.fsm.list_all().await?;
        Ok((stats, agents))
    }

    /// Graceful shutdown: stop matching, close sessions, flush storage
    pub async fn shutdown(self) {
        info!("hub shutting down");
        self.scheduler.shutdown().await;
        self.sessions.close_all();
        self.relay.abort();
        self.db.close().await;
    }
}
