use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("store error: {0}")]
    Store(#[from] saga_store::StoreError),

    #[error("LMDB error: {0}")]
    Lmdb(#[from] saga_store_lmdb::LmdbError),

    #[error("stream error: {0}")]
    Stream(#[from] saga_stream::StreamError),

    #[error("config error: {0}")]
    Config(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("data directory check failed: {0}")]
    DataDir(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shutdown timeout")]
    ShutdownTimeout,
}
