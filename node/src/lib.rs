//! Envelope saga node.
//!
//! Drives multi-party envelopes through their lifecycle: the state machine,
//! the durable event dispatcher and its reaper handlers, the checkpointer
//! fed by the block stream, background sweepers, and the wiring that runs
//! them together with config, logging, metrics and shutdown.

pub mod checkpointer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod reaper;
pub mod scope_gate;
pub mod shutdown;
pub mod state_machine;
pub mod stream_task;
pub mod sweeper;
pub mod tracing_spans;
pub mod worker_pool;

pub use checkpointer::{BatchReport, Checkpointer, ScopeMutation};
pub use config::SagaConfig;
pub use dispatcher::{DispatchError, DispatchTable, EventDispatcher, EventHandler, HandlerOutcome};
pub use error::NodeError;
pub use lifecycle::{EnvelopeLifecycle, LifecycleError};
pub use logging::{init_logging, LogFormat};
pub use metrics::SagaMetrics;
pub use node::{Collaborators, SagaNode};
pub use reaper::{ReaperContext, ReaperError};
pub use scope_gate::ScopeGate;
pub use shutdown::ShutdownController;
pub use state_machine::{CommitExtra, StateMachineError, Step};
pub use stream_task::StreamScheduler;
pub use sweeper::{DispatchSweeper, PendingTxSweeper};
pub use worker_pool::WorkerPool;
