//! Consume command: print events of a topic as JSON lines.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use conduit_broker::{BrokerConsumer, BrokerService, Event};
use serde_json::{Value, json};
use tracing::info;

/// Arguments for the `consume` command
#[derive(Debug, Args)]
pub struct ConsumeArgs {
    /// Topic id or `<type>://<broker>/<topic>` URI
    pub topic: String,

    /// Stop after this many events
    #[arg(short = 'n', long)]
    pub count: Option<u64>,

    /// Seconds to wait for each batch
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,

    /// Stop after the first empty batch
    #[arg(long)]
    pub once: bool,

    /// Leave consumed events uncommitted
    #[arg(long)]
    pub no_commit: bool,
}

pub async fn run(service: &BrokerService, args: ConsumeArgs) -> Result<()> {
    let topic = super::resolve_topic(service, &args.topic)?;
    let consumer: BrokerConsumer<Value, Value> = service
        .create_consumer(&topic)
        .await
        .context("Failed to start consumer")?;

    let result = tokio::select! {
        result = consume(&consumer, &args) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };
    consumer.release().await;
    info!(
        polls = consumer.poll_count(),
        events = consumer.event_count(),
        commits = consumer.commit_count(),
        "consumer finished"
    );
    result
}

async fn consume(consumer: &BrokerConsumer<Value, Value>, args: &ConsumeArgs) -> Result<()> {
    let timeout = Duration::from_secs(args.timeout);
    let mut printed = 0u64;
    loop {
        let events = consumer.poll(timeout).await?;
        if events.is_empty() && args.once {
            return Ok(());
        }
        let shown = within_limit(events.len(), printed, args.count);
        for event in &events[..shown] {
            println!("{}", render(event));
        }
        printed += shown as u64;
        if shown < events.len() {
            // Unprinted events stay unacknowledged for redelivery.
            info!(unprinted = events.len() - shown, "leaving the last batch uncommitted");
            return Ok(());
        }
        if !events.is_empty() && !args.no_commit {
            consumer.commit().await?;
        }
        if args.count.is_some_and(|count| printed >= count) {
            return Ok(());
        }
    }
}

/// How many events of a batch fit under `count` after `printed` were shown.
fn within_limit(batch: usize, printed: u64, count: Option<u64>) -> usize {
    match count {
        Some(count) => batch.min(usize::try_from(count.saturating_sub(printed)).unwrap_or(usize::MAX)),
        None => batch,
    }
}

fn render(event: &Event<Value, Value>) -> Value {
    json!({
        "partition": event.partition().value(),
        "position": event.offset().position(),
        "timestamp": event.timestamp().to_rfc3339(),
        "key": event.key(),
        "value": event.value(),
    })
}
