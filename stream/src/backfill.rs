//! Windowed parallel range fetching.
//!
//! A range is cut into chunks no larger than the node's per-call limit. Up to
//! `concurrency` chunks form a window; the window's chunks are fetched in
//! parallel and the window is delivered in height order before the next one
//! starts.

use std::sync::Arc;

use saga_collab::{BlockRange, ChainNode, StreamBlock};
use tokio::task::JoinSet;

use crate::consumer::{BatchSink, ConsumerConfig};
use crate::filter::filter_block;
use crate::StreamError;

/// Fetch and deliver `range`. Returns the last delivered height.
pub(crate) async fn fetch_and_deliver(
    chain: &Arc<dyn ChainNode>,
    config: &ConsumerConfig,
    range: BlockRange,
    sink: &dyn BatchSink,
) -> Result<Option<u64>, StreamError> {
    let chunk_size = config.chunk_size.min(config.query_limit).max(1);
    let chunks = range.chunks(chunk_size);
    let mut last = None;

    for window in chunks.chunks(config.fetch_concurrency.max(1)) {
        let mut tasks = JoinSet::new();
        for chunk in window {
            let chain = Arc::clone(chain);
            let chunk = *chunk;
            tasks.spawn(async move {
                let blocks = chain.block_results(chunk).await?;
                if blocks.len() as u64 != chunk.len() {
                    return Err(StreamError::IncompleteRange {
                        min: chunk.min,
                        max: chunk.max,
                        got: blocks.len(),
                    });
                }
                Ok(blocks)
            });
        }

        let mut blocks: Vec<StreamBlock> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let fetched = joined.map_err(|e| StreamError::Task(e.to_string()))??;
            blocks.extend(fetched);
        }
        blocks.sort_by_key(|b| b.height);

        let batch: Vec<StreamBlock> = blocks
            .into_iter()
            .map(|b| filter_block(&config.watch_list, b))
            .collect();
        let window_last = batch.last().map(|b| b.height);
        tracing::debug!(
            from = batch.first().map(|b| b.height),
            to = window_last,
            "delivering block window"
        );
        sink.deliver(batch)
            .await
            .map_err(|e| StreamError::Sink(e.to_string()))?;
        last = window_last.or(last);
    }

    Ok(last)
}
