//! CoordinatorBuilder - wiring and start-up validation.
//!
//! Configuration is checked before anything touches storage; a bad value
//! stops the build with `BuildError::Config`.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::app::Coordinator;
use crate::config::EngineConfig;
use crate::dispatch::EventDispatcher;
use crate::error::CoordError;
use crate::impls::FileBoardStore;
use crate::mailbox::Mailbox;
use crate::ports::{BoardStore, Clock, EventSink, IdGenerator, SystemClock, UlidGenerator};
use crate::registry::TaskRegistry;
use crate::store::{LockedStore, RetryExecutor};

/// # Example
/// ```ignore
/// let coordinator = CoordinatorBuilder::new()
///     .config(EngineConfig::load(path)?)
///     .build()
///     .await?;
/// ```
pub struct CoordinatorBuilder {
    config: EngineConfig,
    backend: Option<Arc<dyn BoardStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    start_dispatcher: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot open data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot open boards: {0}")]
    Open(#[from] CoordError),
}

impl From<BuildError> for CoordError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Config(msg) => CoordError::Config(msg),
            BuildError::DataDir { path, source } => CoordError::Storage {
                board: path.display().to_string(),
                source,
            },
            BuildError::Open(err) => err,
        }
    }
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            backend: None,
            clock: None,
            ids: None,
            start_dispatcher: true,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this backend instead of a `FileBoardStore` under `data_dir`.
    pub fn store(mut self, backend: Arc<dyn BoardStore>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn in_memory(self, backend: Arc<crate::impls::MemoryBoardStore>) -> Self {
        self.store(backend)
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Leave the event loop stopped; events queue until
    /// `Coordinator::start_events`.
    pub fn paused_events(mut self) -> Self {
        self.start_dispatcher = false;
        self
    }

    /// Validate, open the boards, and start the event loop.
    ///
    /// Must be awaited inside a tokio runtime.
    pub async fn build(self) -> Result<Coordinator, BuildError> {
        self.config.validate().map_err(|e| match e {
            CoordError::Config(msg) => BuildError::Config(msg),
            other => BuildError::Config(other.to_string()),
        })?;

        let backend: Arc<dyn BoardStore> = match self.backend {
            Some(backend) => backend,
            None => {
                let path = self.config.data_dir.clone();
                let store = FileBoardStore::open(&path)
                    .map_err(|source| BuildError::DataDir { path, source })?;
                Arc::new(store)
            }
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(Arc::clone(&clock))),
        };

        let store = Arc::new(LockedStore::new(
            backend,
            RetryExecutor::new(self.config.retry.policy()),
            self.config.lock_timeout(),
            self.config.checkpoint_interval,
        ));
        let dispatcher = Arc::new(EventDispatcher::new());
        let events: Arc<dyn EventSink> = dispatcher.clone();

        let registry = TaskRegistry::open(
            Arc::clone(&store),
            Arc::clone(&events),
            Arc::clone(&clock),
            ids,
            self.config.max_reclaims,
        )
        .await?;
        let mailbox = Mailbox::new(
            Arc::clone(&store),
            events,
            clock,
            self.config.max_message_bytes,
        );

        if self.start_dispatcher {
            dispatcher.start();
        }
        info!(
            data_dir = %self.config.data_dir.display(),
            max_reclaims = self.config.max_reclaims,
            "coordinator ready"
        );
        Ok(Coordinator::new(self.config, store, registry, mailbox, dispatcher))
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
