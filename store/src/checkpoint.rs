use saga_types::StreamCheckpoint;

use crate::StoreError;

pub trait CheckpointReader {
    fn get_checkpoint(&self, consumer: &str) -> Result<Option<StreamCheckpoint>, StoreError>;
}

pub trait CheckpointWriter {
    fn put_checkpoint(&mut self, checkpoint: &StreamCheckpoint) -> Result<(), StoreError>;
}
