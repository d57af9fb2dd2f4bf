//! Node wiring: opens the store, builds the dispatch table, starts the block
//! stream and sweepers, and stops them on shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use saga_collab::{
    ChainNode, FieldExtractor, PeerDelivery, ScopeLookup, SearchIndex, TransactionSubmitter,
};
use saga_store::SagaStore;
use saga_store_lmdb::{check_data_dir, check_integrity, LmdbEnvironment};
use saga_stream::{EventStreamConsumer, StreamState};
use saga_types::{Clock, SystemClock};

use crate::checkpointer::Checkpointer;
use crate::config::SagaConfig;
use crate::dispatcher::EventDispatcher;
use crate::lifecycle::EnvelopeLifecycle;
use crate::metrics::SagaMetrics;
use crate::reaper::{
    dispatch_table, ChaincodeReaper, ErrorReaper, FragmentReaper, IndexReaper, ReaperContext,
};
use crate::scope_gate::ScopeGate;
use crate::shutdown::ShutdownController;
use crate::stream_task::StreamScheduler;
use crate::sweeper::{spawn_sweepers, DispatchSweeper, PendingTxSweeper};
use crate::NodeError;

/// Timeout for waiting on background tasks during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the saga talks to but does not implement.
#[derive(Clone)]
pub struct Collaborators {
    pub peer: Arc<dyn PeerDelivery>,
    pub submitter: Arc<dyn TransactionSubmitter>,
    pub lookup: Arc<dyn ScopeLookup>,
    pub extractor: Arc<dyn FieldExtractor>,
    pub search: Arc<dyn SearchIndex>,
    pub chain: Arc<dyn ChainNode>,
}

pub struct SagaNode {
    pub config: SagaConfig,
    store: Arc<dyn SagaStore>,
    dispatcher: Arc<EventDispatcher>,
    lifecycle: Arc<EnvelopeLifecycle>,
    checkpointer: Arc<Checkpointer>,
    gate: Arc<ScopeGate>,
    metrics: Arc<SagaMetrics>,
    scheduler: Arc<StreamScheduler>,
    dispatch_sweeper: Arc<DispatchSweeper>,
    pending_sweeper: Arc<PendingTxSweeper>,
    pub shutdown: Arc<ShutdownController>,
    /// Handles for spawned background tasks (joined during shutdown).
    task_handles: Vec<JoinHandle<()>>,
}

impl SagaNode {
    /// Open the LMDB store under `config.data_dir` and wire the node.
    pub fn open(config: SagaConfig, collaborators: Collaborators) -> Result<Self, NodeError> {
        let path = Path::new(&config.data_dir);
        check_data_dir(path).map_err(NodeError::DataDir)?;
        let store = Arc::new(LmdbEnvironment::open(path, config.map_size)?);
        let report = check_integrity(store.env())?;
        if report.is_healthy() {
            tracing::info!(
                databases = report.databases_checked,
                entries = report.total_entries,
                "store integrity ok"
            );
        } else {
            tracing::warn!(errors = ?report.errors, "store integrity check found problems");
        }
        Self::with_store(config, store, collaborators, Arc::new(SystemClock))
    }

    /// Wire the node over an already opened store.
    pub fn with_store(
        config: SagaConfig,
        store: Arc<dyn SagaStore>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, NodeError> {
        let metrics = Arc::new(SagaMetrics::new()?);
        let gate = Arc::new(ScopeGate::new());
        let ctx = ReaperContext::new(Arc::clone(&store), Arc::clone(&clock), Arc::clone(&metrics));
        let timeouts = &config.timeouts;
        let pools = &config.reapers;

        let table = dispatch_table(
            Arc::new(FragmentReaper::new(
                ctx.clone(),
                Arc::clone(&collaborators.peer),
                timeouts.delivery(),
                pools.fragment_workers,
            )),
            Arc::new(ChaincodeReaper::new(
                ctx.clone(),
                Arc::clone(&collaborators.lookup),
                Arc::clone(&collaborators.submitter),
                Arc::clone(&collaborators.peer),
                Arc::clone(&gate),
                timeouts.clone(),
                pools.chaincode_workers,
            )),
            Arc::new(IndexReaper::new(
                ctx.clone(),
                Arc::clone(&collaborators.extractor),
                Arc::clone(&collaborators.search),
                config.search.clone(),
                timeouts.search(),
                pools.index_workers,
            )),
            Arc::new(ErrorReaper::new(
                ctx,
                Arc::clone(&collaborators.peer),
                timeouts.delivery(),
                pools.error_workers,
            )),
        );
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&store),
            table,
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));

        let lifecycle = Arc::new(EnvelopeLifecycle::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));
        let checkpointer = Arc::new(Checkpointer::new(
            config.stream.consumer_id.clone(),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&collaborators.lookup),
            Arc::clone(&gate),
            Arc::clone(&clock),
            Arc::clone(&metrics),
            timeouts.lookup(),
        ));
        let scheduler = Arc::new(StreamScheduler::new(
            EventStreamConsumer::new(
                Arc::clone(&collaborators.chain),
                config.stream.consumer_config(),
            ),
            Arc::clone(&checkpointer),
            Arc::clone(&metrics),
            config.stream.reconnect_delay(),
        ));
        let dispatch_sweeper = Arc::new(DispatchSweeper::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&clock),
            Arc::clone(&metrics),
            config.sweeper.clone(),
        ));
        let pending_sweeper = Arc::new(PendingTxSweeper::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&gate),
            clock,
            config.sweeper.clone(),
        ));

        Ok(Self {
            config,
            store,
            dispatcher,
            lifecycle,
            checkpointer,
            gate,
            metrics,
            scheduler,
            dispatch_sweeper,
            pending_sweeper,
            shutdown: Arc::new(ShutdownController::new()),
            task_handles: Vec::new(),
        })
    }

    /// Spawn the block stream and the sweepers.
    pub fn start(&mut self) {
        tracing::info!(
            consumer = %self.config.stream.consumer_id,
            data_dir = %self.config.data_dir.display(),
            "saga node starting"
        );

        let stream = Arc::clone(&self.scheduler).spawn(self.shutdown.subscribe());
        self.task_handles.push(stream);

        let sweepers = spawn_sweepers(
            Arc::clone(&self.dispatch_sweeper),
            Arc::clone(&self.pending_sweeper),
            &self.config.sweeper,
            self.shutdown.subscribe(),
        );
        self.task_handles.push(sweepers);
    }

    /// Start, then run until SIGINT/SIGTERM.
    pub async fn run_until_signal(&mut self) -> Result<(), NodeError> {
        self.start();
        self.shutdown.wait_for_signal().await;
        self.stop().await
    }

    /// Signal every task and wait for them, bounded by a timeout.
    ///
    /// Reaper work already admitted to a worker pool is not cancelled.
    pub async fn stop(&mut self) -> Result<(), NodeError> {
        tracing::info!("saga node stopping");
        self.shutdown.shutdown();

        let handles: Vec<JoinHandle<()>> = self.task_handles.drain(..).collect();
        let wait_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, wait_all).await.is_err() {
            tracing::warn!(timeout = ?SHUTDOWN_TIMEOUT, "shutdown timeout; some tasks may still be running");
            return Err(NodeError::ShutdownTimeout);
        }
        tracing::info!("saga node stopped");
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn lifecycle(&self) -> &Arc<EnvelopeLifecycle> {
        &self.lifecycle
    }

    pub fn checkpointer(&self) -> &Arc<Checkpointer> {
        &self.checkpointer
    }

    pub fn gate(&self) -> &Arc<ScopeGate> {
        &self.gate
    }

    pub fn metrics(&self) -> &Arc<SagaMetrics> {
        &self.metrics
    }

    pub fn dispatch_sweeper(&self) -> &Arc<DispatchSweeper> {
        &self.dispatch_sweeper
    }

    pub fn pending_sweeper(&self) -> &Arc<PendingTxSweeper> {
        &self.pending_sweeper
    }

    /// The metrics registry in text form, when metrics are enabled.
    pub fn metrics_text(&self) -> Result<Option<String>, NodeError> {
        if !self.config.enable_metrics {
            return Ok(None);
        }
        Ok(Some(self.metrics.encode_text()?))
    }

    pub fn stream_state(&self) -> watch::Receiver<StreamState> {
        self.scheduler.state()
    }
}
