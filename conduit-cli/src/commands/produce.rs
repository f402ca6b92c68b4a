//! Produce command: send events read from arguments or stdin.

use std::io::BufRead;

use anyhow::{Context, Result};
use clap::Args;
use conduit_broker::{BrokerProducer, BrokerService};
use serde_json::Value;
use tracing::{info, warn};

/// Arguments for the `produce` command
#[derive(Debug, Args)]
pub struct ProduceArgs {
    /// Topic id or `<type>://<broker>/<topic>` URI
    pub topic: String,

    /// Key for every event
    #[arg(short, long)]
    pub key: Option<String>,

    /// Event value (reads one event per line from stdin if omitted)
    #[arg(short, long)]
    pub data: Option<String>,
}

pub async fn run(service: &BrokerService, args: ProduceArgs) -> Result<()> {
    let values = match &args.data {
        Some(data) => vec![parse_value(data)],
        None => std::io::stdin()
            .lock()
            .lines()
            .filter(|line| !line.as_ref().is_ok_and(|l| l.trim().is_empty()))
            .map(|line| line.map(|l| parse_value(&l)))
            .collect::<std::io::Result<Vec<_>>>()
            .context("Failed to read events from stdin")?,
    };

    let topic = super::resolve_topic(service, &args.topic)?;
    let producer: BrokerProducer<Value, Value> = service
        .create_producer(&topic)
        .await
        .context("Failed to start producer")?;

    let key = args.key.as_deref().map(parse_value);
    let result = send_all(&producer, key.as_ref(), &values).await;
    if result.is_err()
        && let Err(e) = producer.rollback().await
    {
        warn!(error = %e, "rollback after failed send failed");
    }
    producer.release().await;
    result?;

    info!(events = producer.event_count(), topic = %topic.describe(), "events sent");
    Ok(())
}

async fn send_all(
    producer: &BrokerProducer<Value, Value>,
    key: Option<&Value>,
    values: &[Value],
) -> Result<()> {
    for value in values {
        producer.send(key, value).await?;
    }
    producer.commit().await?;
    Ok(())
}

/// Interpret input as JSON, falling back to a plain string.
fn parse_value(input: &str) -> Value {
    serde_json::from_str(input).unwrap_or_else(|_| Value::String(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_input_is_parsed() {
        assert_eq!(parse_value(r#"{"id":1}"#)["id"], 1);
        assert_eq!(parse_value("42"), Value::from(42));
    }

    #[test]
    fn plain_text_becomes_a_string() {
        assert_eq!(parse_value("hello world"), Value::from("hello world"));
    }
}
