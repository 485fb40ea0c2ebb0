use super::dispatcher::EventDispatcher;
#[cfg(feature = "rustls")]
use super::dispatcher::HyperEventDispatcher;
use super::processor::{
    BatchEventProcessor, EventProcessor, EventProcessorError, NullEventProcessor,
};
use super::EventsConfiguration;

use crate::notification::NotificationCenter;
use crate::service_endpoints::ServiceEndpoints;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_QUEUE_SIZE: usize = 2000;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type used to represent failures when building an [EventProcessor] instance.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BuildError {
    /// Error used when a configuration setting is invalid.
    #[error("event processor factory failed to build: {0}")]
    InvalidConfig(String),

    /// Error used when the event processor's thread fails to start
    #[error(transparent)]
    FailedToStart(EventProcessorError),
}

/// Trait which allows creation of event processors. Should be implemented by event processor
/// builder types.
pub trait EventProcessorFactory {
    fn build(
        &self,
        endpoints: &ServiceEndpoints,
        notification_center: Arc<NotificationCenter>,
    ) -> Result<Arc<dyn EventProcessor>, BuildError>;
    fn to_owned(&self) -> Box<dyn EventProcessorFactory>;
}

/// Contains methods for configuring delivery of impression and conversion events.
///
/// The SDK buffers events and sends them in batches. If you want to customize this behavior,
/// create a builder with [crate::EventProcessorBuilder::new], change its properties with the
/// methods of this struct, and pass it to [crate::ConfigBuilder::event_processor].
///
/// # Examples
///
/// Adjust the flush interval
/// ```
/// # use optimizely_sdk::{EventProcessorBuilder, ConfigBuilder};
/// # use std::time::Duration;
/// # fn main() {
///     ConfigBuilder::new("sdk-key").event_processor(EventProcessorBuilder::new()
///         .flush_interval(Duration::from_secs(10)));
/// # }
/// ```
#[derive(Clone)]
pub struct EventProcessorBuilder {
    batch_size: usize,
    queue_size: usize,
    flush_interval: Duration,
    retry_count: u32,
    close_timeout: Duration,
    dispatcher: Option<Arc<dyn EventDispatcher>>,
}

impl EventProcessorFactory for EventProcessorBuilder {
    fn build(
        &self,
        endpoints: &ServiceEndpoints,
        notification_center: Arc<NotificationCenter>,
    ) -> Result<Arc<dyn EventProcessor>, BuildError> {
        if self.batch_size == 0 {
            return Err(BuildError::InvalidConfig(
                "batch size must be greater than zero".into(),
            ));
        }
        if self.queue_size < self.batch_size {
            return Err(BuildError::InvalidConfig(format!(
                "queue size ({}) must be at least the batch size ({})",
                self.queue_size, self.batch_size
            )));
        }

        let dispatcher = match &self.dispatcher {
            Some(dispatcher) => dispatcher.clone(),
            None => default_dispatcher()?,
        };

        let events_configuration = EventsConfiguration {
            batch_size: self.batch_size,
            queue_size: self.queue_size,
            flush_interval: self.flush_interval,
            retry_count: self.retry_count,
            close_timeout: self.close_timeout,
            dispatcher,
            endpoints: endpoints.clone(),
        };

        let events_processor = BatchEventProcessor::new(events_configuration, notification_center)
            .map_err(BuildError::FailedToStart)?;

        Ok(Arc::new(events_processor))
    }

    fn to_owned(&self) -> Box<dyn EventProcessorFactory> {
        Box::new(self.clone())
    }
}

#[cfg(feature = "rustls")]
fn default_dispatcher() -> Result<Arc<dyn EventDispatcher>, BuildError> {
    Ok(Arc::new(HyperEventDispatcher::new(
        crate::https_connector::create_https_connector(),
    )))
}

#[cfg(not(feature = "rustls"))]
fn default_dispatcher() -> Result<Arc<dyn EventDispatcher>, BuildError> {
    Err(BuildError::InvalidConfig(
        "an event dispatcher is required when the rustls feature is disabled".into(),
    ))
}

impl EventProcessorBuilder {
    /// Create a new [EventProcessorBuilder] with all default values.
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            queue_size: DEFAULT_QUEUE_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retry_count: DEFAULT_RETRY_COUNT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            dispatcher: None,
        }
    }

    /// Sets how many queued events trigger an immediate flush. This is also the largest number of
    /// events sent in one batch.
    pub fn batch_size(&mut self, batch_size: usize) -> &mut Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the capacity of the event queue.
    ///
    /// Events produced while the queue is full are discarded. Increasing the capacity means that
    /// events are less likely to be discarded, at the cost of consuming more memory.
    pub fn queue_size(&mut self, queue_size: usize) -> &mut Self {
        self.queue_size = queue_size;
        self
    }

    /// Sets the interval between flushes of the event queue.
    pub fn flush_interval(&mut self, flush_interval: Duration) -> &mut Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Sets how many times a failed batch is retried before the flush gives up. Events of a batch
    /// that gave up stay queued for the next flush.
    pub fn retry_count(&mut self, retry_count: u32) -> &mut Self {
        self.retry_count = retry_count;
        self
    }

    /// Sets how long closing waits for queued events to be delivered. Events still queued after
    /// this are dropped.
    pub fn close_timeout(&mut self, close_timeout: Duration) -> &mut Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Replaces the HTTP dispatcher.
    pub fn dispatcher(&mut self, dispatcher: Arc<dyn EventDispatcher>) -> &mut Self {
        self.dispatcher = Some(dispatcher);
        self
    }
}

impl Default for EventProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An implementation of EventProcessorFactory that will discard all events received. This should
/// only be used for unit tests or offline clients.
#[derive(Clone)]
pub struct NullEventProcessorBuilder {}

impl EventProcessorFactory for NullEventProcessorBuilder {
    fn build(
        &self,
        _: &ServiceEndpoints,
        _: Arc<NotificationCenter>,
    ) -> Result<Arc<dyn EventProcessor>, BuildError> {
        Ok(Arc::new(NullEventProcessor::new()))
    }

    fn to_owned(&self) -> Box<dyn EventProcessorFactory> {
        Box::new(self.clone())
    }
}

impl NullEventProcessorBuilder {
    /// Create a new [NullEventProcessorBuilder] with all default values.
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for NullEventProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
