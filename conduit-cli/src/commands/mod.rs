pub mod catalog;
pub mod consume;
pub mod produce;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use conduit_broker::{BrokerConfig, BrokerService, Topic};
use tracing::debug;

/// Build a service with the compiled-in providers and the configured
/// brokers and topics.
pub fn load_service(path: Option<&Path>) -> Result<BrokerService> {
    let config = match path {
        Some(path) => BrokerConfig::load(path)
            .with_context(|| format!("Failed to load broker configuration from {}", path.display()))?,
        None => BrokerConfig::load_default().context("Failed to load broker configuration")?,
    };
    let service = BrokerService::with_default_providers();
    service
        .reload(&config)
        .context("Invalid broker configuration")?;
    debug!(providers = ?service.provider_names(), "broker service ready");
    Ok(service)
}

/// Resolve a topic given either by id or as `<type>://<broker>/<topic>`.
pub fn resolve_topic(service: &BrokerService, topic: &str) -> Result<Arc<Topic>> {
    if topic.contains("://") {
        return service
            .topic_for_uri(topic)
            .with_context(|| format!("Cannot resolve topic URI '{topic}'"));
    }
    service
        .topic(topic)
        .with_context(|| format!("Unknown topic '{topic}'"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const CONFIG: &str = r#"
        [[brokers]]
        id = "local"
        type = "kafka"

        [[topics]]
        name = "orders"
        broker = "local"
    "#;

    #[test]
    fn loads_service_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let service = load_service(Some(file.path())).unwrap();
        assert_eq!(service.brokers().len(), 1);
        assert_eq!(resolve_topic(&service, "local_orders").unwrap().name(), "orders");
    }

    #[test]
    fn resolves_topics_by_uri() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let service = load_service(Some(file.path())).unwrap();

        let topic = resolve_topic(&service, "kafka://local/shipments").unwrap();
        assert_eq!(topic.name(), "shipments");
        assert!(resolve_topic(&service, "pulsar://local/shipments").is_err());
        assert!(resolve_topic(&service, "missing").is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_service(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
