use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;

use crate::notification::{Notification, NotificationCenter};

use super::batch::EventBatch;
use super::dispatcher::{EventDispatcher, LogEvent};
use super::event::UserEvent;
use super::EventsConfiguration;

const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(200);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EventProcessorError {
    #[error(transparent)]
    SpawnFailed(#[from] std::io::Error),
}

/// Point-in-time counters describing the processor's delivery history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventProcessorMetrics {
    pub success_flush: u64,
    pub fail_flush: u64,
    pub retry_flush: u64,
    pub queue_size: usize,
    pub dropped: u64,
}

/// Trait for the component that buffers impression and conversion events and delivers them in
/// batches. This component can be replaced for testing purposes.
pub trait EventProcessor: Send + Sync {
    /// Queues an event without blocking. Returns false when the event was dropped because the
    /// queue is full or the processor is closed.
    fn process(&self, event: UserEvent) -> bool;

    /// Requests that queued events are sent as soon as possible, rather than waiting for the next
    /// flush interval.
    fn flush(&self);

    /// Sends everything still queued and stops the processor. Subsequent calls to
    /// [EventProcessor::process] are ignored.
    fn close(&self);

    fn metrics(&self) -> EventProcessorMetrics;
}

pub struct NullEventProcessor {}

impl NullEventProcessor {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for NullEventProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventProcessor for NullEventProcessor {
    fn process(&self, _: UserEvent) -> bool {
        true
    }
    fn flush(&self) {}
    fn close(&self) {}
    fn metrics(&self) -> EventProcessorMetrics {
        EventProcessorMetrics::default()
    }
}

pub(super) enum ProcessorMessage {
    Flush,
    Close(Sender<()>),
}

#[derive(Default)]
struct Counters {
    success_flush: AtomicU64,
    fail_flush: AtomicU64,
    retry_flush: AtomicU64,
    dropped: AtomicU64,
}

/// State shared between producers and the flushing thread.
struct Shared {
    queue: Mutex<VecDeque<UserEvent>>,
    counters: Counters,
    /// Number of events at the head of the queue the flusher is currently dispatching.
    in_flight: AtomicUsize,
    /// Set when close gave up waiting for the flusher. The queue is owned by close from then on.
    abandoned: AtomicBool,
}

pub struct BatchEventProcessor {
    shared: Arc<Shared>,
    inbox_tx: Sender<ProcessorMessage>,
    batch_size: usize,
    queue_size: usize,
    close_timeout: Duration,
    closed: AtomicBool,
    overflowing: AtomicBool,
}

impl BatchEventProcessor {
    pub fn new(
        configuration: EventsConfiguration,
        notification_center: Arc<NotificationCenter>,
    ) -> Result<Self, EventProcessorError> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(configuration.batch_size)),
            counters: Counters::default(),
            in_flight: AtomicUsize::new(0),
            abandoned: AtomicBool::new(false),
        });
        let (inbox_tx, inbox_rx) = bounded(configuration.batch_size.max(1));

        let batch_size = configuration.batch_size.max(1);
        let queue_size = configuration.queue_size;
        let close_timeout = configuration.close_timeout;

        let mut flusher = Flusher {
            shared: shared.clone(),
            configuration,
            notification_center,
        };
        thread::Builder::new()
            .name("event-flusher".into())
            .spawn(move || flusher.start(inbox_rx))?;

        Ok(Self {
            shared,
            inbox_tx,
            batch_size,
            queue_size,
            close_timeout,
            closed: AtomicBool::new(false),
            overflowing: AtomicBool::new(false),
        })
    }
}

impl EventProcessor for BatchEventProcessor {
    fn process(&self, event: UserEvent) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Event processor is closed; ignoring {}", event);
            return false;
        }

        let queued = {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.queue_size {
                None
            } else {
                queue.push_back(event);
                Some(queue.len())
            }
        };

        match queued {
            Some(len) => {
                self.overflowing.store(false, Ordering::Relaxed);
                if len >= self.batch_size {
                    let _ = self.inbox_tx.try_send(ProcessorMessage::Flush);
                }
                true
            }
            None => {
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                if !self.overflowing.swap(true, Ordering::Relaxed) {
                    warn!("Event queue is full; events are being produced faster than they can be sent and will be dropped");
                }
                false
            }
        }
    }

    fn flush(&self) {
        let _ = self.inbox_tx.try_send(ProcessorMessage::Flush);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (sender, receiver) = bounded::<()>(1);
        if self.inbox_tx.send(ProcessorMessage::Close(sender)).is_err() {
            error!("Failed to send close message. Cannot stop event processor");
            return;
        }

        if receiver.recv_timeout(self.close_timeout).is_err() {
            warn!(
                "Event processor did not finish within {:?} of closing",
                self.close_timeout
            );
        }

        let mut queue = self.shared.queue.lock();
        self.shared.abandoned.store(true, Ordering::SeqCst);
        // The batch still being dispatched is accounted for by the flusher once it completes.
        let in_flight = self.shared.in_flight.load(Ordering::SeqCst).min(queue.len());
        let undelivered = queue.len() - in_flight;
        if undelivered > 0 {
            warn!("Dropping {} undelivered events on close", undelivered);
            self.shared
                .counters
                .dropped
                .fetch_add(undelivered as u64, Ordering::Relaxed);
        }
        queue.clear();
    }

    fn metrics(&self) -> EventProcessorMetrics {
        let counters = &self.shared.counters;
        EventProcessorMetrics {
            success_flush: counters.success_flush.load(Ordering::Relaxed),
            fail_flush: counters.fail_flush.load(Ordering::Relaxed),
            retry_flush: counters.retry_flush.load(Ordering::Relaxed),
            queue_size: self.shared.queue.lock().len(),
            dropped: counters.dropped.load(Ordering::Relaxed),
        }
    }
}

/// The single consumer of the queue. Runs on its own thread so that batches are dispatched one at
/// a time, in enqueue order.
struct Flusher {
    shared: Arc<Shared>,
    configuration: EventsConfiguration,
    notification_center: Arc<NotificationCenter>,
}

impl Flusher {
    fn start(&mut self, inbox_rx: Receiver<ProcessorMessage>) {
        let flush_ticker = tick(self.configuration.flush_interval);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build();

        let rt = match rt {
            Ok(rt) => rt,
            Err(e) => {
                error!("Could not start runtime for event dispatching: {}", e);
                return;
            }
        };

        loop {
            select! {
                recv(flush_ticker) -> _ => self.flush(&rt, None),
                recv(inbox_rx) -> result => match result {
                    Ok(ProcessorMessage::Flush) => self.flush(&rt, None),
                    Ok(ProcessorMessage::Close(sender)) => {
                        let deadline = Instant::now() + self.configuration.close_timeout;
                        self.flush(&rt, Some(deadline));
                        drop(inbox_rx);
                        let _ = sender.send(());
                        return;
                    }
                    Err(e) => {
                        error!("inbox_rx is disconnected. Shutting down event flusher: {}", e);
                        return;
                    }
                }
            }
        }
    }

    /// Dispatches batches from the head of the queue until it is empty or a batch exhausts its
    /// retries. Failed events stay at the head for the next trigger.
    fn flush(&self, rt: &tokio::runtime::Runtime, deadline: Option<Instant>) {
        loop {
            if self.shared.abandoned.load(Ordering::SeqCst)
                || deadline.is_some_and(|deadline| Instant::now() >= deadline)
            {
                return;
            }

            let events = self.next_batch();
            let Some(batch) = EventBatch::from_events(&events) else {
                return;
            };
            let endpoint = self
                .configuration
                .endpoints
                .events_url(batch.region)
                .to_string();
            let log_event = LogEvent::new(endpoint, batch);

            debug!("Flushing batch of {} events", events.len());
            let delivered = self.dispatch_with_retry(rt, log_event);

            let mut queue = self.shared.queue.lock();
            self.shared.in_flight.store(0, Ordering::SeqCst);
            let abandoned = self.shared.abandoned.load(Ordering::SeqCst);
            if delivered {
                if !abandoned {
                    let sent = events.len().min(queue.len());
                    queue.drain(..sent);
                }
                self.shared
                    .counters
                    .success_flush
                    .fetch_add(1, Ordering::Relaxed);
            } else {
                if abandoned {
                    self.shared
                        .counters
                        .dropped
                        .fetch_add(events.len() as u64, Ordering::Relaxed);
                }
                self.shared
                    .counters
                    .fail_flush
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Copies the longest run at the head of the queue that shares one `(project_id, revision)`,
    /// bounded by the batch size.
    fn next_batch(&self) -> Vec<UserEvent> {
        let queue = self.shared.queue.lock();
        let Some(first) = queue.front() else {
            return Vec::new();
        };
        let key = first.batch_key();
        let events: Vec<UserEvent> = queue
            .iter()
            .take(self.configuration.batch_size.max(1))
            .take_while(|event| event.batch_key() == key)
            .cloned()
            .collect();
        self.shared.in_flight.store(events.len(), Ordering::SeqCst);
        events
    }

    fn dispatch_with_retry(&self, rt: &tokio::runtime::Runtime, log_event: LogEvent) -> bool {
        let mut backoff = INITIAL_RETRY_BACKOFF;
        for attempt in 0..=self.configuration.retry_count {
            if attempt > 0 {
                self.shared
                    .counters
                    .retry_flush
                    .fetch_add(1, Ordering::Relaxed);
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
            }

            self.notification_center
                .send(Notification::LogEvent(log_event.clone()));

            match rt.block_on(
                self.configuration
                    .dispatcher
                    .dispatch_event(log_event.clone()),
            ) {
                Ok(()) => return true,
                Err(e) => warn!("Event dispatch attempt {} failed: {}", attempt + 1, e),
            }
        }

        error!(
            "Failed to dispatch events after {} retries; keeping them queued",
            self.configuration.retry_count
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::events::dispatcher::test_doubles::InMemoryEventDispatcher;
    use crate::events::dispatcher::DispatchError;
    use crate::events::event::EventFactory;
    use crate::events::create_events_configuration;
    use crate::notification::NotificationType;
    use crate::project_config::{ProjectConfig, Region};
    use crate::service_endpoints::ServiceEndpoints;
    use crate::test_common::{s1_config, s1_datafile_with_revision};
    use crossbeam_channel::unbounded;

    fn conversion(config: &ProjectConfig, user_id: &str) -> UserEvent {
        EventFactory::new("rust-sdk", "0.1.0").new_conversion(
            config,
            config.event_by_key("event1").unwrap(),
            user_id,
            &HashMap::new(),
            &HashMap::new(),
        )
    }

    fn processor(
        dispatcher: InMemoryEventDispatcher,
        flush_interval: Duration,
    ) -> BatchEventProcessor {
        BatchEventProcessor::new(
            create_events_configuration(Arc::new(dispatcher), flush_interval),
            Arc::new(NotificationCenter::new()),
        )
        .expect("failed to start processor")
    }

    #[test]
    fn close_drains_queue_in_one_batch() {
        let (batch_tx, batch_rx) = unbounded();
        let processor = processor(
            InMemoryEventDispatcher::new(batch_tx),
            Duration::from_secs(100),
        );
        let config = s1_config();

        for user in ["u1", "u2", "u3", "u4"] {
            assert!(processor.process(conversion(&config, user)));
        }
        processor.close();

        let batches = batch_rx.try_iter().collect::<Vec<_>>();
        assert_eq!(1, batches.len());
        let visitors = batches[0]
            .visitors
            .iter()
            .map(|v| v.visitor_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(vec!["u1", "u2", "u3", "u4"], visitors);
        assert_eq!(0, processor.metrics().queue_size);
        assert_eq!(1, processor.metrics().success_flush);
    }

    #[test]
    fn revisions_are_split_into_separate_batches() {
        let (batch_tx, batch_rx) = unbounded();
        let processor = processor(
            InMemoryEventDispatcher::new(batch_tx),
            Duration::from_secs(100),
        );
        let first = s1_config();
        let second = ProjectConfig::from_datafile(&s1_datafile_with_revision("2")).unwrap();

        processor.process(conversion(&first, "u1"));
        processor.process(conversion(&second, "u2"));
        processor.flush();
        processor.close();

        let batches = batch_rx.try_iter().collect::<Vec<_>>();
        assert_eq!(2, batches.len());
        assert_eq!("1", batches[0].revision);
        assert_eq!(1, batches[0].visitors.len());
        assert_eq!("2", batches[1].revision);
        assert_eq!(1, batches[1].visitors.len());
    }

    #[test]
    fn reaching_batch_size_triggers_flush() {
        let (batch_tx, batch_rx) = unbounded();
        let processor = processor(
            InMemoryEventDispatcher::new(batch_tx),
            Duration::from_secs(100),
        );
        let config = s1_config();

        for i in 0..10 {
            processor.process(conversion(&config, &format!("user-{}", i)));
        }

        let batch = batch_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("batch should be flushed without waiting for the interval");
        assert_eq!(10, batch.visitors.len());
        processor.close();
    }

    #[test]
    fn ticker_flushes_queued_events() {
        let (batch_tx, batch_rx) = unbounded();
        let processor = processor(
            InMemoryEventDispatcher::new(batch_tx),
            Duration::from_millis(50),
        );

        processor.process(conversion(&s1_config(), "u1"));

        let batch = batch_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("ticker should flush");
        assert_eq!(1, batch.visitors.len());
        processor.close();
    }

    #[test]
    fn failed_dispatch_is_retried_before_succeeding() {
        let (batch_tx, batch_rx) = unbounded();
        let processor = processor(
            InMemoryEventDispatcher::failing(batch_tx, 2),
            Duration::from_secs(100),
        );

        processor.process(conversion(&s1_config(), "u1"));
        processor.close();

        assert_eq!(1, batch_rx.try_iter().count());
        let metrics = processor.metrics();
        assert_eq!(2, metrics.retry_flush);
        assert_eq!(1, metrics.success_flush);
        assert_eq!(0, metrics.fail_flush);
    }

    #[test]
    fn exhausted_retries_keep_events_queued_until_close() {
        let (batch_tx, batch_rx) = unbounded();
        let dispatcher = InMemoryEventDispatcher::failing(batch_tx, 4);
        let processor = processor(dispatcher, Duration::from_secs(100));

        processor.process(conversion(&s1_config(), "u1"));
        processor.flush();

        let deadline = Instant::now() + Duration::from_secs(10);
        while processor.metrics().fail_flush == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(1, processor.metrics().fail_flush);
        assert_eq!(1, processor.metrics().queue_size);

        processor.close();
        assert_eq!(1, batch_rx.try_iter().count());
        assert_eq!(0, processor.metrics().queue_size);
    }

    #[test]
    fn overflow_drops_events() {
        let (batch_tx, _batch_rx) = unbounded();
        let mut configuration = create_events_configuration(
            Arc::new(InMemoryEventDispatcher::new(batch_tx)),
            Duration::from_secs(100),
        );
        configuration.queue_size = 2;
        configuration.batch_size = 10;
        let processor =
            BatchEventProcessor::new(configuration, Arc::new(NotificationCenter::new())).unwrap();
        let config = s1_config();

        assert!(processor.process(conversion(&config, "u1")));
        assert!(processor.process(conversion(&config, "u2")));
        assert!(!processor.process(conversion(&config, "u3")));
        assert_eq!(1, processor.metrics().dropped);
        processor.close();
    }

    #[test]
    fn every_attempt_emits_log_event_notification() {
        let (batch_tx, _batch_rx) = unbounded();
        let center = Arc::new(NotificationCenter::new());
        let (seen_tx, seen_rx) = unbounded();
        center.add_handler(NotificationType::LogEvent, move |notification| {
            if let Notification::LogEvent(event) = notification {
                seen_tx.send(event.endpoint_url.clone()).unwrap();
            }
        });
        let processor = BatchEventProcessor::new(
            create_events_configuration(
                Arc::new(InMemoryEventDispatcher::failing(batch_tx, 1)),
                Duration::from_secs(100),
            ),
            center,
        )
        .unwrap();

        processor.process(conversion(&s1_config(), "u1"));
        processor.close();

        let urls = seen_rx.try_iter().collect::<Vec<_>>();
        assert_eq!(2, urls.len());
        assert_eq!(ServiceEndpoints::default().events_url(Region::US), urls[0]);
    }

    struct SlowDispatcher {
        delay: Duration,
        batch_tx: crossbeam_channel::Sender<EventBatch>,
    }

    impl EventDispatcher for SlowDispatcher {
        fn dispatch_event(
            &self,
            event: LogEvent,
        ) -> futures::future::BoxFuture<'_, Result<(), DispatchError>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                self.batch_tx.send(event.body).unwrap();
                Ok(())
            })
        }
    }

    #[test]
    fn close_timeout_leaves_in_flight_batch_to_the_flusher() {
        let (batch_tx, batch_rx) = unbounded();
        let mut configuration = create_events_configuration(
            Arc::new(SlowDispatcher {
                delay: Duration::from_millis(500),
                batch_tx,
            }),
            Duration::from_secs(100),
        );
        configuration.close_timeout = Duration::from_millis(100);
        let processor =
            BatchEventProcessor::new(configuration, Arc::new(NotificationCenter::new())).unwrap();

        assert!(processor.process(conversion(&s1_config(), "u1")));
        processor.close();
        assert_eq!(0, processor.metrics().queue_size);

        // The flusher thread survives the late success and reports it.
        let batch = batch_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("in-flight batch should still be delivered");
        assert_eq!(1, batch.visitors.len());

        let deadline = Instant::now() + Duration::from_secs(5);
        while processor.metrics().success_flush == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let metrics = processor.metrics();
        assert_eq!(1, metrics.success_flush);
        assert_eq!(0, metrics.dropped);
        assert_eq!(0, metrics.queue_size);
    }

    #[test]
    fn calling_close_twice_returns() {
        let (batch_tx, _) = unbounded();
        let processor = processor(
            InMemoryEventDispatcher::new(batch_tx),
            Duration::from_secs(100),
        );
        processor.close();
        processor.close();
        assert!(!processor.process(conversion(&s1_config(), "late")));
    }
}
