use thiserror::Error;

#[derive(Debug, Error)]
pub enum LmdbError {
    #[error("LMDB error: {0}")]
    Heed(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted key in {table}: {detail}")]
    CorruptKey { table: &'static str, detail: String },
}

impl From<heed::Error> for LmdbError {
    fn from(e: heed::Error) -> Self {
        LmdbError::Heed(e.to_string())
    }
}

impl From<bincode::Error> for LmdbError {
    fn from(e: bincode::Error) -> Self {
        LmdbError::Serialization(e.to_string())
    }
}

impl From<LmdbError> for saga_store::StoreError {
    fn from(e: LmdbError) -> Self {
        match e {
            LmdbError::NotFound(what) => saga_store::StoreError::NotFound(what),
            LmdbError::Serialization(msg) => saga_store::StoreError::Serialization(msg),
            LmdbError::CorruptKey { table, detail } => {
                saga_store::StoreError::Corruption(format!("{table}: {detail}"))
            }
            LmdbError::Heed(msg) => saga_store::StoreError::Backend(msg),
        }
    }
}
