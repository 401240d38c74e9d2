//! Consumer group manager.
//!
//! `start` opens one independent subscription per topic and returns them as
//! an owned [`Subscriptions`] collection; `shutdown` consumes that
//! collection, so a subscription cannot be closed twice.
//!
//! Each subscription runs on its own task and moves through
//! `Created -> JoiningGroup -> Consuming -> Closing -> Closed`. Records are
//! delivered only while `Consuming`; errors are reported without changing
//! state; only shutdown leads to `Closing`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use super::{ConsumerFactory, GroupOptions, RecordHandler, RecordStream};
use crate::error::IngestError;
use crate::metrics::{self, SubscriptionGauge};

/// How often a member waiting for its partition assignment re-checks it.
const ASSIGNMENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Created,
    JoiningGroup,
    Consuming,
    Closing,
    Closed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::JoiningGroup => "joining-group",
            Self::Consuming => "consuming",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Handle to one running subscription.
pub struct Subscription {
    topic: String,
    group_id: String,
    state: watch::Receiver<SubscriptionState>,
    cancellation: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Topic consumed by this subscription.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group owned by this subscription.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Waits until the subscription reaches `target`.
    ///
    /// Returns false if the subscription task went away first.
    pub async fn wait_for_state(&self, target: SubscriptionState) -> bool {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|state| *state == target).await.is_ok();
        reached
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("group_id", &self.group_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Owned collection of running subscriptions.
pub struct Subscriptions {
    subscriptions: Vec<Subscription>,
    handler: Arc<dyn RecordHandler>,
    abandon: CancellationToken,
}

impl Subscriptions {
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }

    /// Subscription for `topic`, if one was started.
    pub fn get(&self, topic: &str) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.topic == topic)
    }
}

impl fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.subscriptions.iter()).finish()
    }
}

/// Starts and stops per-topic consumer groups.
pub struct ConsumerGroupManager {
    factory: Arc<dyn ConsumerFactory>,
    drain_timeout: Duration,
}

impl ConsumerGroupManager {
    /// Creates a manager that opens subscriptions through `factory`.
    pub fn new(factory: Arc<dyn ConsumerFactory>) -> Self {
        Self {
            factory,
            drain_timeout: Duration::from_secs(30),
        }
    }

    /// Bounds how long a draining shutdown waits for in-flight work.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Opens one subscription per topic, each in its own consumer group.
    ///
    /// If any subscription cannot be opened, the ones already running are
    /// closed and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Subscription` naming the failing topic.
    pub async fn start(
        &self,
        topics: &[String],
        options: &GroupOptions,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<Subscriptions, IngestError> {
        let mut started = Subscriptions {
            subscriptions: Vec::with_capacity(topics.len()),
            handler: Arc::clone(&handler),
            abandon: CancellationToken::new(),
        };

        for topic in topics {
            let subscription_options = options.for_topic(topic);

            let stream = match self.factory.subscribe(&subscription_options) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(topic = %topic, error = %e, "Failed to open subscription");
                    self.shutdown(started, false).await;
                    return Err(IngestError::Subscription {
                        topic: topic.clone(),
                        message: e.to_string(),
                    });
                }
            };

            let (state_tx, state_rx) = watch::channel(SubscriptionState::Created);
            let cancellation = CancellationToken::new();

            let task = tokio::spawn(run_subscription(
                stream,
                topic.clone(),
                Arc::clone(&handler),
                state_tx,
                cancellation.clone(),
                started.abandon.clone(),
            ));

            info!(
                topic = %topic,
                group_id = %subscription_options.group_id,
                "Subscription started"
            );

            started.subscriptions.push(Subscription {
                topic: topic.clone(),
                group_id: subscription_options.group_id,
                state: state_rx,
                cancellation,
                task,
            });
        }

        Ok(started)
    }

    /// Closes every subscription.
    ///
    /// Intake stops on all subscriptions first, then each one leaves its
    /// group. With `drain` the message each subscription is handling and the
    /// handler's in-flight work are awaited, together bounded by the drain
    /// timeout; without it both are abandoned right away.
    pub async fn shutdown(&self, subscriptions: Subscriptions, drain: bool) {
        let Subscriptions {
            subscriptions,
            handler,
            abandon,
        } = subscriptions;

        info!(count = subscriptions.len(), drain, "Shutting down subscriptions");

        for subscription in &subscriptions {
            subscription.cancellation.cancel();
        }

        let mut tasks: Vec<(String, Option<JoinHandle<()>>)> = subscriptions
            .into_iter()
            .map(|s| (s.topic, Some(s.task)))
            .collect();

        if drain {
            let drained = tokio::time::timeout(self.drain_timeout, async {
                join_tasks(&mut tasks).await;
                handler.drain().await;
            })
            .await;

            if drained.is_err() {
                warn!(
                    timeout_secs = self.drain_timeout.as_secs(),
                    "Drain timed out, abandoning in-flight work"
                );
                abandon.cancel();
                handler.abandon();
            }
        } else {
            abandon.cancel();
            handler.abandon();
        }

        join_tasks(&mut tasks).await;
        info!("All subscriptions closed");
    }
}

/// Awaits every subscription task not yet joined.
async fn join_tasks(tasks: &mut [(String, Option<JoinHandle<()>>)]) {
    for (topic, task) in tasks.iter_mut() {
        if let Some(handle) = task.as_mut() {
            if let Err(e) = handle.await {
                error!(topic = %topic, error = %e, "Subscription task failed");
            }
            *task = None;
        }
    }
}

async fn run_subscription(
    mut stream: Box<dyn RecordStream>,
    topic: String,
    handler: Arc<dyn RecordHandler>,
    state: watch::Sender<SubscriptionState>,
    cancellation: CancellationToken,
    abandon: CancellationToken,
) {
    let gauge = SubscriptionGauge::open(&topic);
    state.send_replace(SubscriptionState::JoiningGroup);

    let mut assignment_poll = tokio::time::interval(ASSIGNMENT_POLL_INTERVAL);
    let mut ended = false;

    loop {
        let joining = *state.borrow() == SubscriptionState::JoiningGroup;

        tokio::select! {
            biased;

            _ = cancellation.cancelled() => break,

            _ = assignment_poll.tick(), if joining => {
                if stream.is_assigned() {
                    info!(topic = %topic, "Partitions assigned");
                    state.send_replace(SubscriptionState::Consuming);
                }
            }

            next = stream.next(), if !ended => match next {
                Some(Ok(record)) => {
                    if joining {
                        state.send_replace(SubscriptionState::Consuming);
                    }
                    metrics::record_message(&topic);

                    let span = info_span!(
                        "ingest",
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset
                    );
                    let offset = record.offset;
                    tokio::select! {
                        biased;

                        _ = abandon.cancelled() => {
                            warn!(topic = %topic, offset, "Message abandoned on shutdown");
                        }

                        result = handler.handle(record).instrument(span) => {
                            if let Err(e) = result {
                                warn!(topic = %topic, kind = e.kind(), error = %e, "Message dropped");
                                metrics::record_dropped(e.kind());
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    metrics::record_subscription_error(&topic);
                    handler.on_error(&topic, &e);
                }
                None => {
                    warn!(topic = %topic, "Record stream ended, waiting for shutdown");
                    ended = true;
                }
            },
        }
    }

    state.send_replace(SubscriptionState::Closing);
    stream.close();
    gauge.close();
    state.send_replace(SubscriptionState::Closed);
    info!(topic = %topic, "Subscription closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumedRecord, ConsumerError, SubscriptionOptions};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    type Feed = mpsc::UnboundedSender<Result<ConsumedRecord, ConsumerError>>;

    struct ChannelStream {
        rx: mpsc::UnboundedReceiver<Result<ConsumedRecord, ConsumerError>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RecordStream for ChannelStream {
        async fn next(&mut self) -> Option<Result<ConsumedRecord, ConsumerError>> {
            self.rx.recv().await
        }

        fn is_assigned(&self) -> bool {
            false
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct ChannelFactory {
        feeds: Mutex<Vec<(String, String, Feed)>>,
        closed: Mutex<Vec<Arc<AtomicBool>>>,
        fail_topic: Option<String>,
    }

    impl ChannelFactory {
        fn feed(&self, topic: &str) -> Feed {
            self.feeds
                .lock()
                .unwrap()
                .iter()
                .find(|(t, _, _)| t == topic)
                .map(|(_, _, tx)| tx.clone())
                .unwrap()
        }
    }

    impl ConsumerFactory for ChannelFactory {
        fn subscribe(
            &self,
            options: &SubscriptionOptions,
        ) -> Result<Box<dyn RecordStream>, ConsumerError> {
            if self.fail_topic.as_deref() == Some(options.topic.as_str()) {
                return Err(ConsumerError::Kafka("broker down".to_string()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let closed = Arc::new(AtomicBool::new(false));
            self.feeds.lock().unwrap().push((
                options.topic.clone(),
                options.group_id.clone(),
                tx,
            ));
            self.closed.lock().unwrap().push(Arc::clone(&closed));
            Ok(Box::new(ChannelStream { rx, closed }))
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        handled: Mutex<Vec<ConsumedRecord>>,
        errors: AtomicUsize,
        drained: AtomicBool,
        abandoned: AtomicBool,
    }

    #[async_trait]
    impl RecordHandler for CountingHandler {
        async fn handle(&self, record: ConsumedRecord) -> Result<(), IngestError> {
            self.handled.lock().unwrap().push(record);
            Ok(())
        }

        fn on_error(&self, _topic: &str, _error: &ConsumerError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        async fn drain(&self) {
            self.drained.store(true, Ordering::SeqCst);
        }

        fn abandon(&self) {
            self.abandoned.store(true, Ordering::SeqCst);
        }
    }

    /// Handler that never finishes a message within a test's lifetime.
    #[derive(Default)]
    struct StuckHandler {
        entered: AtomicBool,
        abandoned: AtomicBool,
    }

    #[async_trait]
    impl RecordHandler for StuckHandler {
        async fn handle(&self, _record: ConsumedRecord) -> Result<(), IngestError> {
            self.entered.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        fn abandon(&self) {
            self.abandoned.store(true, Ordering::SeqCst);
        }
    }

    async fn start_stuck(
        manager: &ConsumerGroupManager,
        factory: &ChannelFactory,
        handler: Arc<StuckHandler>,
    ) -> Subscriptions {
        let options = GroupOptions::new("localhost:9092", "dev", "acme");
        let subs = manager
            .start(&topics(&["t"]), &options, handler.clone())
            .await
            .unwrap();

        factory.feed("t").send(Ok(record("t", 7))).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !handler.entered.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        subs
    }

    fn record(topic: &str, offset: i64) -> ConsumedRecord {
        ConsumedRecord {
            topic: topic.to_string(),
            partition: 0,
            offset,
            payload: b"{}".to_vec(),
        }
    }

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_start_opens_one_group_per_topic() {
        let factory = Arc::new(ChannelFactory::default());
        let manager = ConsumerGroupManager::new(factory.clone());
        let handler = Arc::new(CountingHandler::default());
        let options = GroupOptions::new("localhost:9092", "dev", "acme");

        let subs = manager
            .start(&topics(&["a-raw-data", "b-raw-data"]), &options, handler)
            .await
            .unwrap();

        assert_eq!(subs.len(), 2);
        let groups: Vec<_> = subs.iter().map(|s| s.group_id().to_string()).collect();
        assert_eq!(
            groups,
            vec!["ingestion_dev_acme_a-raw-data", "ingestion_dev_acme_b-raw-data"]
        );

        manager.shutdown(subs, true).await;
    }

    #[tokio::test]
    async fn test_records_and_errors_are_delivered() {
        let factory = Arc::new(ChannelFactory::default());
        let manager = ConsumerGroupManager::new(factory.clone());
        let handler = Arc::new(CountingHandler::default());
        let options = GroupOptions::new("localhost:9092", "dev", "acme");

        let subs = manager
            .start(&topics(&["t"]), &options, handler.clone())
            .await
            .unwrap();
        let sub = subs.get("t").unwrap();
        assert!(sub.wait_for_state(SubscriptionState::JoiningGroup).await);

        let feed = factory.feed("t");
        feed.send(Ok(record("t", 1))).unwrap();
        feed.send(Err(ConsumerError::Kafka("transport".to_string())))
            .unwrap();
        feed.send(Ok(record("t", 2))).unwrap();

        assert!(sub.wait_for_state(SubscriptionState::Consuming).await);
        tokio::time::timeout(Duration::from_secs(2), async {
            while handler.handled.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let offsets: Vec<_> = handler.handled.lock().unwrap().iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![1, 2]);
        assert_eq!(handler.errors.load(Ordering::SeqCst), 1);
        // Errors do not close the subscription
        assert_eq!(sub.state(), SubscriptionState::Consuming);

        manager.shutdown(subs, true).await;
        assert!(handler.drained.load(Ordering::SeqCst));
        assert!(!handler.abandoned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_stream() {
        let factory = Arc::new(ChannelFactory::default());
        let manager = ConsumerGroupManager::new(factory.clone());
        let handler = Arc::new(CountingHandler::default());
        let options = GroupOptions::new("localhost:9092", "dev", "acme");

        let subs = manager
            .start(&topics(&["a", "b", "c"]), &options, handler.clone())
            .await
            .unwrap();
        let mut states: Vec<_> = subs.iter().map(|s| s.state.clone()).collect();

        manager.shutdown(subs, false).await;

        for closed in factory.closed.lock().unwrap().iter() {
            assert!(closed.load(Ordering::SeqCst));
        }
        for rx in states.iter_mut() {
            assert_eq!(*rx.borrow_and_update(), SubscriptionState::Closed);
        }
        assert!(handler.abandoned.load(Ordering::SeqCst));
        assert!(!handler.drained.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_subscribe_closes_started_ones() {
        let factory = Arc::new(ChannelFactory {
            fail_topic: Some("b".to_string()),
            ..ChannelFactory::default()
        });
        let manager = ConsumerGroupManager::new(factory.clone());
        let handler = Arc::new(CountingHandler::default());
        let options = GroupOptions::new("localhost:9092", "dev", "acme");

        let err = manager
            .start(&topics(&["a", "b", "c"]), &options, handler)
            .await
            .unwrap_err();

        match err {
            IngestError::Subscription { topic, .. } => assert_eq!(topic, "b"),
            other => panic!("unexpected error: {:?}", other),
        }
        let closed = factory.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        assert!(closed[0].load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_ended_stream_stays_open_until_shutdown() {
        let factory = Arc::new(ChannelFactory::default());
        let manager = ConsumerGroupManager::new(factory.clone());
        let handler = Arc::new(CountingHandler::default());
        let options = GroupOptions::new("localhost:9092", "dev", "acme");

        let subs = manager
            .start(&topics(&["t"]), &options, handler)
            .await
            .unwrap();
        factory.feeds.lock().unwrap().clear();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(subs.get("t").unwrap().state(), SubscriptionState::JoiningGroup);

        manager.shutdown(subs, true).await;
    }

    #[tokio::test]
    async fn test_no_drain_shutdown_interrupts_running_handler() {
        let factory = Arc::new(ChannelFactory::default());
        let manager = ConsumerGroupManager::new(factory.clone())
            .with_drain_timeout(Duration::from_secs(60));
        let handler = Arc::new(StuckHandler::default());

        let subs = start_stuck(&manager, &factory, handler.clone()).await;
        let mut state = subs.get("t").unwrap().state.clone();

        tokio::time::timeout(Duration::from_secs(2), manager.shutdown(subs, false))
            .await
            .expect("shutdown should not wait for the running handler");

        assert_eq!(*state.borrow_and_update(), SubscriptionState::Closed);
        assert!(factory.closed.lock().unwrap()[0].load(Ordering::SeqCst));
        assert!(handler.abandoned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drain_timeout_bounds_running_handler() {
        let factory = Arc::new(ChannelFactory::default());
        let manager = ConsumerGroupManager::new(factory.clone())
            .with_drain_timeout(Duration::from_millis(100));
        let handler = Arc::new(StuckHandler::default());

        let subs = start_stuck(&manager, &factory, handler.clone()).await;
        let mut state = subs.get("t").unwrap().state.clone();

        tokio::time::timeout(Duration::from_secs(2), manager.shutdown(subs, true))
            .await
            .expect("shutdown should give up after the drain timeout");

        assert_eq!(*state.borrow_and_update(), SubscriptionState::Closed);
        assert!(handler.abandoned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SubscriptionState::JoiningGroup.to_string(), "joining-group");
        assert_eq!(SubscriptionState::Closed.to_string(), "closed");
    }
}
