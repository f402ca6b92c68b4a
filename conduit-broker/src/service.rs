//! Broker service: provider resolution and the live instance registry.
//!
//! [`BrokerService`] owns the configured brokers and topics, binds each
//! broker to the first [`Provider`] that supports it and creates consumers
//! and producers through that provider. Every consumer and producer
//! registers itself in the shared [`Registry`] on construction and leaves it
//! on release, so the service can list and look up live instances.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerType, to_identifier};
use crate::config::BrokerConfig;
use crate::consumer::{BrokerConsumer, ConsumerInfo};
use crate::error::{Error, Result};
use crate::producer::{BrokerProducer, ProducerInfo};
use crate::provider::{Provider, default_providers};
use crate::sync::{read, write};
use crate::topic::Topic;

/// Live consumers and producers, keyed by id.
///
/// Cheap to clone; clones share the same maps. The registry only holds
/// introspection handles and never touches backend state.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    consumers: RwLock<HashMap<String, Arc<ConsumerInfo>>>,
    producers: RwLock<HashMap<String, Arc<ProducerInfo>>>,
}

impl Registry {
    pub fn register_consumer(&self, consumer: Arc<ConsumerInfo>) {
        debug!(consumer = %consumer.id(), topic = %consumer.topic().id(), "consumer registered");
        write(&self.inner.consumers).insert(consumer.id().to_string(), consumer);
    }

    pub fn register_producer(&self, producer: Arc<ProducerInfo>) {
        debug!(producer = %producer.id(), topic = %producer.topic().id(), "producer registered");
        write(&self.inner.producers).insert(producer.id().to_string(), producer);
    }

    /// Forget a consumer; returns whether it was registered.
    pub fn release_consumer(&self, id: &str) -> bool {
        write(&self.inner.consumers).remove(id).is_some()
    }

    /// Forget a producer; returns whether it was registered.
    pub fn release_producer(&self, id: &str) -> bool {
        write(&self.inner.producers).remove(id).is_some()
    }

    pub fn consumer(&self, id: &str) -> Result<Arc<ConsumerInfo>> {
        read(&self.inner.consumers)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("consumer '{id}'")))
    }

    pub fn producer(&self, id: &str) -> Result<Arc<ProducerInfo>> {
        read(&self.inner.producers)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("producer '{id}'")))
    }

    /// Snapshot of the live consumers, oldest first.
    pub fn consumers(&self) -> Vec<Arc<ConsumerInfo>> {
        let mut consumers: Vec<_> = read(&self.inner.consumers).values().cloned().collect();
        consumers.sort_by_key(|c| c.created_at());
        consumers
    }

    /// Snapshot of the live producers, oldest first.
    pub fn producers(&self) -> Vec<Arc<ProducerInfo>> {
        let mut producers: Vec<_> = read(&self.inner.producers).values().cloned().collect();
        producers.sort_by_key(|p| p.created_at());
        producers
    }
}

#[derive(Default)]
struct Catalog {
    brokers: BTreeMap<String, Arc<Broker>>,
    topics: BTreeMap<String, Arc<Topic>>,
    /// Broker id to index into the provider list.
    bindings: HashMap<String, usize>,
}

/// Entry point for creating and inspecting consumers and producers.
pub struct BrokerService {
    providers: Vec<Arc<dyn Provider>>,
    catalog: RwLock<Catalog>,
    registry: Registry,
}

impl BrokerService {
    /// Create a service resolving brokers over `providers`, in order.
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            providers,
            catalog: RwLock::new(Catalog::default()),
            registry: Registry::default(),
        }
    }

    /// Create a service with the providers compiled into this build.
    pub fn with_default_providers() -> Self {
        Self::new(default_providers())
    }

    /// Create a service and load `config` into it.
    pub fn from_config(providers: Vec<Arc<dyn Provider>>, config: &BrokerConfig) -> Result<Self> {
        let service = Self::new(providers);
        service.reload(config)?;
        Ok(service)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Names of the providers, in resolution order.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Register (or replace) a broker and bind it to a provider.
    pub fn register_broker(&self, broker: Broker) -> Arc<Broker> {
        let broker = Arc::new(broker);
        let mut catalog = write(&self.catalog);
        self.bind(&mut catalog, &broker);
        catalog
            .brokers
            .insert(broker.id().to_string(), Arc::clone(&broker));
        broker
    }

    /// Register (or replace) a topic; its broker is registered too if unknown.
    pub fn register_topic(&self, topic: Topic) -> Arc<Topic> {
        let topic = Arc::new(topic);
        let mut catalog = write(&self.catalog);
        if !catalog.brokers.contains_key(topic.broker().id()) {
            let broker = Arc::clone(topic.broker());
            self.bind(&mut catalog, &broker);
            catalog.brokers.insert(broker.id().to_string(), broker);
        }
        catalog
            .topics
            .insert(topic.id().to_string(), Arc::clone(&topic));
        topic
    }

    pub fn broker(&self, id: &str) -> Result<Arc<Broker>> {
        read(&self.catalog)
            .brokers
            .get(&to_identifier(id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("broker '{id}'")))
    }

    pub fn topic(&self, id: &str) -> Result<Arc<Topic>> {
        read(&self.catalog)
            .topics
            .get(&to_identifier(id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("topic '{id}'")))
    }

    pub fn brokers(&self) -> Vec<Arc<Broker>> {
        read(&self.catalog).brokers.values().cloned().collect()
    }

    pub fn topics(&self) -> Vec<Arc<Topic>> {
        read(&self.catalog).topics.values().cloned().collect()
    }

    /// Replace brokers and topics with `config` and re-resolve provider
    /// bindings. Live consumers and producers keep running on the values
    /// they were created with.
    pub fn reload(&self, config: &BrokerConfig) -> Result<()> {
        let resolved = config.resolve()?;
        let mut catalog = Catalog::default();
        for broker in resolved.brokers {
            self.bind(&mut catalog, &broker);
            catalog.brokers.insert(broker.id().to_string(), broker);
        }
        for topic in resolved.topics {
            catalog.topics.insert(topic.id().to_string(), topic);
        }
        info!(
            brokers = catalog.brokers.len(),
            topics = catalog.topics.len(),
            bound = catalog.bindings.len(),
            "broker configuration reloaded"
        );
        *write(&self.catalog) = catalog;
        Ok(())
    }

    /// The provider handling `broker`: its binding when the broker is
    /// registered, otherwise the first provider that supports it.
    pub fn provider_for(&self, broker: &Broker) -> Result<Arc<dyn Provider>> {
        let bound = {
            let catalog = read(&self.catalog);
            catalog
                .brokers
                .get(broker.id())
                .filter(|registered| registered.as_ref() == broker)
                .and_then(|_| catalog.bindings.get(broker.id()).copied())
        };
        bound
            .or_else(|| self.first_match(broker))
            .map(|index| Arc::clone(&self.providers[index]))
            .ok_or_else(|| no_provider(broker))
    }

    /// Create and initialize a consumer for `topic`.
    ///
    /// A consumer that fails to initialize is released before the error is
    /// returned.
    pub async fn create_consumer<K, V>(&self, topic: &Arc<Topic>) -> Result<BrokerConsumer<K, V>> {
        let provider = self.provider_for(topic.broker())?;
        let backend = provider.create_consumer(topic).map_err(|e| {
            Error::broker(
                format!("Failed to create consumer for {}", topic.describe()),
                e,
            )
        })?;
        let consumer = BrokerConsumer::new(self.registry.clone(), Arc::clone(topic), backend);
        if let Err(e) = consumer.initialize().await {
            consumer.release().await;
            return Err(e);
        }
        info!(consumer = %consumer.id(), topic = %topic.describe(), provider = provider.name(), "consumer created");
        Ok(consumer)
    }

    /// Create and initialize a producer for `topic`.
    pub async fn create_producer<K, V>(&self, topic: &Arc<Topic>) -> Result<BrokerProducer<K, V>> {
        let provider = self.provider_for(topic.broker())?;
        let backend = provider.create_producer(topic).map_err(|e| {
            Error::broker(
                format!("Failed to create producer for {}", topic.describe()),
                e,
            )
        })?;
        let producer = BrokerProducer::new(self.registry.clone(), Arc::clone(topic), backend);
        if let Err(e) = producer.initialize().await {
            producer.release().await;
            return Err(e);
        }
        info!(producer = %producer.id(), topic = %topic.describe(), provider = provider.name(), "producer created");
        Ok(producer)
    }

    /// Resolve `<type>://<broker-id>/<topic-name>` to a topic.
    ///
    /// A registered topic is returned when present; otherwise a topic with
    /// default settings is created on the registered broker.
    pub fn topic_for_uri(&self, uri: &str) -> Result<Arc<Topic>> {
        let url = url::Url::parse(uri)
            .map_err(|e| Error::Config(format!("invalid topic URI '{uri}': {e}")))?;
        let broker_type: BrokerType = url.scheme().parse()?;
        let broker_id = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Config(format!("topic URI '{uri}' names no broker")))?;
        let name = url.path().trim_matches('/');
        if name.is_empty() {
            return Err(Error::Config(format!("topic URI '{uri}' names no topic")));
        }

        let broker = self.broker(broker_id)?;
        if broker.broker_type() != broker_type {
            return Err(Error::Config(format!(
                "broker '{}' is a {} broker, not {}",
                broker.id(),
                broker.broker_type(),
                broker_type
            )));
        }

        let id = to_identifier(&format!("{}_{}", broker.id(), name));
        match self.topic(&id) {
            Ok(topic) => Ok(topic),
            Err(_) => Ok(Arc::new(Topic::new(broker, name))),
        }
    }

    pub async fn create_consumer_for_uri<K, V>(&self, uri: &str) -> Result<BrokerConsumer<K, V>> {
        let topic = self.topic_for_uri(uri)?;
        self.create_consumer(&topic).await
    }

    pub async fn create_producer_for_uri<K, V>(&self, uri: &str) -> Result<BrokerProducer<K, V>> {
        let topic = self.topic_for_uri(uri)?;
        self.create_producer(&topic).await
    }

    pub fn get_consumer(&self, id: &str) -> Result<Arc<ConsumerInfo>> {
        self.registry.consumer(id)
    }

    pub fn get_producer(&self, id: &str) -> Result<Arc<ProducerInfo>> {
        self.registry.producer(id)
    }

    pub fn consumers(&self) -> Vec<Arc<ConsumerInfo>> {
        self.registry.consumers()
    }

    pub fn producers(&self) -> Vec<Arc<ProducerInfo>> {
        self.registry.producers()
    }

    /// Drop a consumer from the registry. The consumer itself stays open
    /// until its owner releases it.
    pub fn release_consumer(&self, id: &str) -> bool {
        self.registry.release_consumer(id)
    }

    /// Drop a producer from the registry.
    pub fn release_producer(&self, id: &str) -> bool {
        self.registry.release_producer(id)
    }

    fn first_match(&self, broker: &Broker) -> Option<usize> {
        self.providers.iter().position(|p| p.supports(broker))
    }

    fn bind(&self, catalog: &mut Catalog, broker: &Broker) {
        match self.first_match(broker) {
            Some(index) => {
                debug!(broker = %broker.id(), provider = self.providers[index].name(), "broker bound");
                catalog.bindings.insert(broker.id().to_string(), index);
            }
            None => {
                warn!(broker = %broker.id(), broker_type = %broker.broker_type(), "no provider supports broker");
                catalog.bindings.remove(broker.id());
            }
        }
    }
}

impl std::fmt::Debug for BrokerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerService")
            .field("providers", &self.provider_names())
            .field("consumers", &self.registry.consumers().len())
            .field("producers", &self.registry.producers().len())
            .finish_non_exhaustive()
    }
}

fn no_provider(broker: &Broker) -> Error {
    Error::Config(format!(
        "no provider supports broker '{}' of type {}",
        broker.id(),
        broker.broker_type()
    ))
}
