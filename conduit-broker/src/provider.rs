//! Backend providers.
//!
//! A [`Provider`] builds consumer and producer backends for the brokers it
//! supports. [`BrokerService`](crate::BrokerService) holds an explicit,
//! ordered list of providers and picks the first one whose
//! [`supports`](Provider::supports) returns true; when two providers claim
//! the same broker type, the one registered first wins.

use std::sync::Arc;

use crate::broker::Broker;
use crate::consumer::ConsumerBackend;
use crate::error::Result;
use crate::producer::ProducerBackend;
use crate::topic::Topic;

/// Factory of backends for one family of brokers.
pub trait Provider: Send + Sync {
    /// Name used in log lines.
    fn name(&self) -> &str;

    fn supports(&self, broker: &Broker) -> bool;

    /// Build an uninitialized consumer backend for `topic`.
    fn create_consumer(&self, topic: &Arc<Topic>) -> Result<Box<dyn ConsumerBackend>>;

    /// Build an uninitialized producer backend for `topic`.
    fn create_producer(&self, topic: &Arc<Topic>) -> Result<Box<dyn ProducerBackend>>;
}

/// Providers for the backends compiled into this build, in resolution order.
///
/// Without the `kafka` or `pulsar` features the list is empty and callers
/// register in-memory providers themselves.
#[allow(unused_mut)]
pub fn default_providers() -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    #[cfg(feature = "kafka")]
    providers.push(Arc::new(crate::log::LogProvider::new(Arc::new(
        crate::log::kafka::KafkaConnector,
    ))));
    #[cfg(feature = "pulsar")]
    providers.push(Arc::new(crate::subscription::SubscriptionProvider::new(
        Arc::new(crate::subscription::pulsar::PulsarConnector::default()),
    )));
    providers
}
