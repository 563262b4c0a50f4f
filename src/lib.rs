pub mod blocks;
pub mod dispatch;
mod queues;
pub mod runtime;
pub mod services;
mod workers;

pub use blocks::{BlockHash, FetchedBlock, HasHeader, Header, ProcessResult, QueueEntry};
pub use dispatch::factory::create_dispatcher;
pub use dispatch::inprocess::InProcessDispatcher;
pub use dispatch::worker_pool::WorkerPoolDispatcher;
pub use dispatch::{Dispatcher, DynamicDsCallback};
pub use runtime::config::{DispatcherConfig, DispatcherConfigBuilder, DispatcherConfigParams};
pub use runtime::fatal::{DispatchError, DispatchStage};
pub use runtime::telemetry::{
    init_tracing, QueueDepths, Telemetry, TelemetrySnapshot, WorkerLoad,
};
pub use services::{
    BlockExecutor, ChainSource, Checkpoint, FetchError, FetchFuture, Poi, Project,
    ServiceFuture, Services, Store,
};
