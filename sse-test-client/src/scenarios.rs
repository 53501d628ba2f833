use crate::api_client::ApiClient;
use crate::output::TestResult;
use crate::sse_client::Connection;
use anyhow::Result;
use colored::*;
use serde_json::json;
use std::time::{Duration, Instant};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE_WINDOW: Duration = Duration::from_secs(1);

/// Both streams are registered and counted.
pub async fn test_connection(api: &ApiClient, expected_min: u64) -> Result<TestResult> {
    let name = "connection";
    println!("\n{} Running {} scenario", "→".blue(), name.bold());
    let started = Instant::now();

    let count = api.connection_count().await?;
    if count < expected_min {
        return Ok(TestResult::fail(
            name,
            format!("expected at least {expected_min} connection(s), server reports {count}"),
            started.elapsed(),
        ));
    }
    println!("{} Server reports {} open connection(s)", "✓".green(), count);
    Ok(TestResult::pass(name, started.elapsed()))
}

/// A targeted event reaches every connection of its client and nobody else.
pub async fn test_fan_out(
    api: &ApiClient,
    target_tabs: &mut [Connection],
    bystander: &mut Connection,
) -> Result<TestResult> {
    let name = "fan-out";
    println!("\n{} Running {} scenario", "→".blue(), name.bold());
    let started = Instant::now();

    let Some(client_id) = target_tabs.first().map(|tab| tab.client_id.clone()) else {
        return Ok(TestResult::fail(name, "no target connections".to_string(), started.elapsed()));
    };

    api.publish_to(
        &client_id,
        "test.fan_out",
        json!({ "taskId": "T1", "sentAt": started.elapsed().as_millis() as u64 }),
        Some("fan-out-1"),
    )
    .await?;

    for tab in target_tabs.iter_mut() {
        match tab.wait_for_event("test.fan_out", EVENT_TIMEOUT).await {
            Ok(event) if event.data["taskId"] == "T1" => {
                println!("{} {} received the event", "✓".green(), tab.label);
            }
            Ok(event) => {
                return Ok(TestResult::fail(
                    name,
                    format!("{} received unexpected payload {}", tab.label, event.data),
                    started.elapsed(),
                ));
            }
            Err(e) => {
                return Ok(TestResult::fail(
                    name,
                    format!("{}: {e}", tab.label),
                    started.elapsed(),
                ));
            }
        }
    }

    if !bystander.expect_silence("test.fan_out", SILENCE_WINDOW).await {
        return Ok(TestResult::fail(
            name,
            format!("{} received an event targeted at {client_id}", bystander.label),
            started.elapsed(),
        ));
    }
    println!("{} {} did not receive it", "✓".green(), bystander.label);

    Ok(TestResult::pass(name, started.elapsed()))
}

/// A broadcast reaches every connection, on whichever server it lives.
pub async fn test_broadcast(api: &ApiClient, connections: &mut [Connection]) -> Result<TestResult> {
    let name = "broadcast";
    println!("\n{} Running {} scenario", "→".blue(), name.bold());
    let started = Instant::now();

    api.broadcast("test.broadcast", json!({ "msg": "hello" }), None)
        .await?;

    for connection in connections.iter_mut() {
        if let Err(e) = connection
            .wait_for_event("test.broadcast", EVENT_TIMEOUT)
            .await
        {
            return Ok(TestResult::fail(
                name,
                format!("{}: {e}", connection.label),
                started.elapsed(),
            ));
        }
        println!("{} {} received the broadcast", "✓".green(), connection.label);
    }

    Ok(TestResult::pass(name, started.elapsed()))
}
