//! Process wiring: builds the backend, services and background tasks from
//! settings, and tears them down again.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use duet_settings::{DuetSettings, StoreBackend};
use duet_store::{
    spawn_sweeper, CacheConfig, KvBackend, MemoryKv, MessageStoreConfig, PresenceConfig, SqliteKv,
    StoreError,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::live::{AdmissionConfig, ConnectionManager, SessionConfig};
use crate::service::{ChatService, RoomDirectory};
use crate::shutdown::ShutdownCoordinator;

/// The concrete key/value backend, kept so expired entries can be purged.
#[derive(Clone)]
pub enum Backend {
    Memory(Arc<MemoryKv>),
    Sqlite(Arc<SqliteKv>),
}

impl Backend {
    pub fn open(settings: &DuetSettings) -> Result<Self, StoreError> {
        match settings.store.backend {
            StoreBackend::Memory => Ok(Self::Memory(Arc::new(MemoryKv::new()))),
            StoreBackend::Sqlite => {
                let kv = SqliteKv::open(Path::new(&settings.store.sqlite_path))?;
                info!(path = %settings.store.sqlite_path, "sqlite store opened");
                Ok(Self::Sqlite(Arc::new(kv)))
            }
        }
    }

    pub fn kv(&self) -> Arc<dyn KvBackend> {
        match self {
            Self::Memory(kv) => Arc::clone(kv) as Arc<dyn KvBackend>,
            Self::Sqlite(kv) => Arc::clone(kv) as Arc<dyn KvBackend>,
        }
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        match self {
            Self::Memory(kv) => Ok(kv.purge_expired()),
            Self::Sqlite(kv) => kv.purge_expired().await,
        }
    }
}

fn spawn_purger(backend: Backend, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => match backend.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "expired entries purged"),
                    Err(e) => warn!(error = %e, "purge failed"),
                },
            }
        }
    })
}

/// Everything a running server shares.
pub struct DuetApp {
    pub settings: DuetSettings,
    pub service: Arc<ChatService>,
    pub sessions: Arc<ConnectionManager>,
    pub shutdown: Arc<ShutdownCoordinator>,
    background: Vec<JoinHandle<()>>,
}

impl DuetApp {
    /// Open the configured backend and start the background tasks.
    pub fn from_settings(settings: DuetSettings) -> Result<Self, StoreError> {
        let backend = Backend::open(&settings)?;
        Ok(Self::with_backend(settings, backend))
    }

    pub fn with_backend(settings: DuetSettings, backend: Backend) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let store = &settings.store;
        let service = Arc::new(ChatService::new(
            backend.kv(),
            MessageStoreConfig {
                max_messages: store.max_messages,
                dedupe_window: store.dedupe_window(),
            },
            CacheConfig {
                ttl: store.cache_ttl(),
                max_messages: store.cache_max_messages,
            },
            PresenceConfig {
                presence_ttl: store.presence_ttl(),
                typing_ttl: store.typing_ttl(),
            },
            RoomDirectory::from_settings(&settings.room),
            Arc::new(Broadcaster::new()),
        ));
        let sessions = ConnectionManager::new(
            Arc::clone(&service),
            AdmissionConfig::from_settings(&settings.delivery),
            SessionConfig::from_settings(&settings.delivery),
            shutdown.token(),
        );

        let sweep_every = store.cache_sweep_interval();
        let background = vec![
            spawn_sweeper(Arc::clone(service.cache()), sweep_every, shutdown.token()),
            spawn_purger(backend, sweep_every, shutdown.token()),
        ];

        Self {
            settings,
            service,
            sessions,
            shutdown,
            background,
        }
    }

    /// Cancel every session and background task and wait for them, up to
    /// the configured shutdown timeout. `extra` is awaited alongside.
    pub async fn shutdown(mut self, extra: Vec<JoinHandle<()>>) {
        let mut handles = std::mem::take(&mut self.background);
        handles.extend(extra);
        // Session tasks are collected after cancelling, so none is missed.
        self.shutdown.shutdown();
        handles.extend(self.sessions.take_tasks());
        let timeout = self.settings.server.shutdown_timeout();
        self.shutdown.graceful_shutdown(handles, Some(timeout)).await;
        info!("duet stopped");
    }
}
