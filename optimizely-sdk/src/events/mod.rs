use std::sync::Arc;
use std::time::Duration;

use crate::service_endpoints::ServiceEndpoints;

use self::dispatcher::EventDispatcher;

pub mod batch;
pub mod dispatcher;
pub mod event;
pub mod processor;
pub mod processor_builders;

pub struct EventsConfiguration {
    batch_size: usize,
    queue_size: usize,
    flush_interval: Duration,
    retry_count: u32,
    close_timeout: Duration,
    dispatcher: Arc<dyn EventDispatcher>,
    endpoints: ServiceEndpoints,
}

#[cfg(test)]
fn create_events_configuration(
    dispatcher: Arc<dyn EventDispatcher>,
    flush_interval: Duration,
) -> EventsConfiguration {
    EventsConfiguration {
        batch_size: 10,
        queue_size: 100,
        flush_interval,
        retry_count: 3,
        close_timeout: Duration::from_secs(10),
        dispatcher,
        endpoints: ServiceEndpoints::default(),
    }
}
