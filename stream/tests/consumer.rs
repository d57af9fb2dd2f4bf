use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use saga_collab::{BlockRange, ChainEvent, StreamBlock, TxResult};
use saga_nullables::NullChainNode;
use saga_stream::{
    BatchSink, ConsumerConfig, EventStreamConsumer, SinkError, StreamError, StreamState,
};
use saga_types::{Timestamp, TxHash};
use tokio::sync::{broadcast, mpsc};

struct RecordingSink {
    batches: Mutex<Vec<Vec<u64>>>,
    notify: mpsc::UnboundedSender<Vec<u64>>,
    fail: bool,
}

impl RecordingSink {
    fn new(fail: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u64>>) {
        let (notify, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            batches: Mutex::new(Vec::new()),
            notify,
            fail,
        });
        (sink, rx)
    }

    fn heights(&self) -> Vec<u64> {
        self.batches.lock().unwrap().iter().flatten().copied().collect()
    }
}

#[async_trait]
impl BatchSink for RecordingSink {
    async fn deliver(&self, batch: Vec<StreamBlock>) -> Result<(), SinkError> {
        if self.fail {
            return Err("sink refused".into());
        }
        let heights: Vec<u64> = batch.iter().map(|b| b.height).collect();
        self.batches.lock().unwrap().push(heights.clone());
        let _ = self.notify.send(heights);
        Ok(())
    }
}

fn config(liveness: Duration) -> ConsumerConfig {
    ConsumerConfig {
        watch_list: vec!["scope_created".into()],
        chunk_size: 20,
        fetch_concurrency: 2,
        query_limit: 20,
        liveness_interval: liveness,
    }
}

fn spawn_consumer(
    consumer: Arc<EventStreamConsumer>,
    checkpoint: Option<u64>,
    sink: Arc<RecordingSink>,
) -> (
    broadcast::Sender<()>,
    tokio::task::JoinHandle<Result<(), StreamError>>,
) {
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(async move {
        consumer
            .run(checkpoint, sink.as_ref(), &mut shutdown_rx)
            .await
    });
    (shutdown_tx, handle)
}

#[tokio::test]
async fn backfill_delivers_in_strictly_increasing_order() {
    let chain = Arc::new(NullChainNode::new(20));
    chain.set_latest_height(140);
    // The first chunk answers last, so completion order is inverted.
    chain.set_fetch_delay(101, Duration::from_millis(80));

    let consumer = Arc::new(EventStreamConsumer::new(
        chain.clone(),
        config(Duration::from_secs(30)),
    ));
    let (sink, mut delivered) = RecordingSink::new(false);
    let (shutdown, handle) = spawn_consumer(consumer, Some(100), sink.clone());

    let batch = delivered.recv().await.unwrap();
    assert_eq!(batch, (101..=140).collect::<Vec<_>>());

    shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();

    let heights = sink.heights();
    assert!(heights.windows(2).all(|w| w[0] < w[1]));
    let mut fetches = chain.fetches();
    fetches.sort_by_key(|r| r.min);
    assert_eq!(
        fetches,
        vec![BlockRange::new(101, 120), BlockRange::new(121, 140)]
    );
}

#[tokio::test]
async fn backfill_windows_are_bounded_by_concurrency() {
    let chain = Arc::new(NullChainNode::new(20));
    chain.set_latest_height(160);
    let consumer = Arc::new(EventStreamConsumer::new(
        chain.clone(),
        config(Duration::from_secs(30)),
    ));
    let (sink, mut delivered) = RecordingSink::new(false);
    let (shutdown, handle) = spawn_consumer(consumer, Some(100), sink.clone());

    assert_eq!(delivered.recv().await.unwrap(), (101..=140).collect::<Vec<_>>());
    assert_eq!(delivered.recv().await.unwrap(), (141..=160).collect::<Vec<_>>());
    shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn chunk_size_is_capped_by_query_limit() {
    let chain = Arc::new(NullChainNode::new(10));
    chain.set_latest_height(30);
    let mut cfg = config(Duration::from_secs(30));
    cfg.chunk_size = 50;
    cfg.query_limit = 10;
    cfg.fetch_concurrency = 3;
    let consumer = Arc::new(EventStreamConsumer::new(chain.clone(), cfg));
    let (sink, mut delivered) = RecordingSink::new(false);
    let (shutdown, handle) = spawn_consumer(consumer, Some(0), sink);

    assert_eq!(delivered.recv().await.unwrap().len(), 30);
    shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();
    assert!(chain.fetches().iter().all(|r| r.len() <= 10));
}

#[tokio::test]
async fn live_blocks_drop_duplicates_and_fill_gaps() {
    let chain = Arc::new(NullChainNode::new(20));
    chain.set_latest_height(10);
    chain.put_block(StreamBlock {
        height: 12,
        time: Timestamp::from_secs(12),
        txs: vec![TxResult {
            hash: TxHash::new([4; 32]),
            code: 0,
            raw_log: String::new(),
            events: vec![
                ChainEvent::new("scope_created").with_attribute("scope_id", "s"),
                ChainEvent::new("transfer"),
            ],
        }],
    });
    chain.set_latest_height(10);
    let consumer = Arc::new(EventStreamConsumer::new(
        chain.clone(),
        config(Duration::from_secs(30)),
    ));
    let mut state = consumer.state();
    let (sink, mut delivered) = RecordingSink::new(false);
    let (shutdown, handle) = spawn_consumer(consumer, None, sink.clone());

    state.wait_for(|s| *s == StreamState::Live).await.unwrap();
    chain.announce(9);
    chain.announce(10);
    chain.announce(13);
    assert_eq!(delivered.recv().await.unwrap(), vec![11, 12, 13]);
    chain.announce(13);
    chain.announce(14);
    assert_eq!(delivered.recv().await.unwrap(), vec![14]);

    shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(sink.heights(), vec![11, 12, 13, 14]);
    assert_eq!(
        chain.fetches(),
        vec![BlockRange::new(11, 13), BlockRange::new(14, 14)]
    );
}

#[tokio::test]
async fn stalled_stream_surfaces_staleness() {
    let chain = Arc::new(NullChainNode::new(20));
    chain.set_latest_height(5);
    let consumer = Arc::new(EventStreamConsumer::new(
        chain.clone(),
        config(Duration::from_millis(50)),
    ));
    let mut state = consumer.state();
    let (sink, _delivered) = RecordingSink::new(false);
    let (_shutdown, handle) = spawn_consumer(consumer, Some(5), sink);

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, StreamError::Stale { height: 5, .. }));
    assert_eq!(*state.borrow_and_update(), StreamState::Disconnected);
    assert_eq!(chain.subscriber_count(), 0);
}

#[tokio::test]
async fn slow_gap_fill_is_not_a_stall() {
    let chain = Arc::new(NullChainNode::new(20));
    chain.set_latest_height(10);
    chain.set_fetch_delay(11, Duration::from_millis(400));
    let consumer = Arc::new(EventStreamConsumer::new(
        chain.clone(),
        config(Duration::from_millis(100)),
    ));
    let mut state = consumer.state();
    let (sink, mut delivered) = RecordingSink::new(false);
    let (shutdown, handle) = spawn_consumer(consumer, None, sink.clone());

    state.wait_for(|s| *s == StreamState::Live).await.unwrap();
    let announcer = {
        let chain = chain.clone();
        tokio::spawn(async move {
            for height in 11u64.. {
                chain.announce(height);
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
        })
    };

    // The first fetch outlasts several liveness intervals.
    tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(batch) = delivered.recv().await {
            if batch.contains(&30) {
                break;
            }
        }
    })
    .await
    .expect("height 30 delivered");
    assert!(!handle.is_finished());

    shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();
    announcer.abort();

    let heights = sink.heights();
    assert_eq!(heights.first(), Some(&11));
    assert!(heights.windows(2).all(|w| w[1] == w[0] + 1));
}

#[tokio::test]
async fn closed_subscription_is_an_error() {
    let chain = Arc::new(NullChainNode::new(20));
    chain.set_latest_height(5);
    let consumer = Arc::new(EventStreamConsumer::new(
        chain.clone(),
        config(Duration::from_secs(30)),
    ));
    let mut state = consumer.state();
    let (sink, _delivered) = RecordingSink::new(false);
    let (_shutdown, handle) = spawn_consumer(consumer, None, sink);

    state.wait_for(|s| *s == StreamState::Live).await.unwrap();
    chain.disconnect();
    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, StreamError::SubscriptionClosed));
}

#[tokio::test]
async fn sink_failure_stops_the_stream() {
    let chain = Arc::new(NullChainNode::new(20));
    chain.set_latest_height(25);
    let consumer = Arc::new(EventStreamConsumer::new(
        chain.clone(),
        config(Duration::from_secs(30)),
    ));
    let (sink, _delivered) = RecordingSink::new(true);
    let (_shutdown, handle) = spawn_consumer(consumer, Some(20), sink);

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, StreamError::Sink(_)));
}
