//! Listing of configured brokers and topics.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use conduit_broker::BrokerService;

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        header
            .iter()
            .map(|h| Cell::new(h).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );
    table
}

pub fn brokers(service: &BrokerService) -> Result<()> {
    let brokers = service.brokers();
    if brokers.is_empty() {
        println!("No brokers configured.");
        return Ok(());
    }

    let mut table = table(&["Id", "Name", "Type", "Provider"]);
    for broker in brokers {
        let provider = match service.provider_for(&broker) {
            Ok(provider) => Cell::new(provider.name()),
            Err(_) => Cell::new("none").fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(broker.id()),
            Cell::new(broker.name()),
            Cell::new(broker.broker_type()),
            provider,
        ]);
    }
    println!("{table}");
    Ok(())
}

pub fn topics(service: &BrokerService) -> Result<()> {
    let topics = service.topics();
    if topics.is_empty() {
        println!("No topics configured.");
        return Ok(());
    }

    let mut table = table(&[
        "Id",
        "Name",
        "Broker",
        "Subscription",
        "Format",
        "Offset reset",
        "Auto commit",
        "Max poll",
    ]);
    for topic in topics {
        table.add_row(vec![
            Cell::new(topic.id()),
            Cell::new(topic.name()),
            Cell::new(topic.broker().id()),
            Cell::new(topic.subscription()),
            Cell::new(topic.format()),
            Cell::new(topic.offset_reset_strategy()),
            Cell::new(if topic.auto_commit() { "yes" } else { "no" }),
            Cell::new(topic.max_poll_records()),
        ]);
    }
    println!("{table}");
    Ok(())
}
