use anyhow::Result;
use clap::Parser;
use colored::*;

mod api_client;
mod output;
mod scenarios;
mod sse_client;

use api_client::ApiClient;
use output::print_test_summary;
use sse_client::Connection;

#[derive(Parser)]
#[command(name = "sse-test-client")]
#[command(about = "SSE Integration Testing Tool")]
struct Cli {
    /// Base URL of the server events are published through (e.g., http://localhost:4000)
    #[arg(long)]
    base_url: String,

    /// Base URL of a second server sharing the same Redis. When given, the
    /// bystander and one target tab connect there, exercising the backplane.
    #[arg(long)]
    peer_url: Option<String>,

    /// Test scenario to run
    #[arg(long, value_enum, default_value = "all")]
    scenario: ScenarioChoice,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,
}

#[derive(clap::ValueEnum, Clone)]
enum ScenarioChoice {
    /// Open streams and check the server counts them
    ConnectionTest,
    /// Targeted event reaches every tab of one client and no other client
    FanOut,
    /// Broadcast reaches every stream
    Broadcast,
    /// Run all scenarios
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    }

    println!("{}", "=== SETUP PHASE ===".bright_white().bold());

    let client = reqwest::Client::new();
    let api = ApiClient::new(client.clone(), cli.base_url.clone());
    api.health().await?;
    println!("{} Server at {} is healthy", "✓".green(), api.base_url());

    let peer_url = cli.peer_url.clone().unwrap_or_else(|| cli.base_url.clone());
    if let Some(peer) = &cli.peer_url {
        ApiClient::new(client.clone(), peer.clone()).health().await?;
        println!("{} Peer at {} is healthy", "✓".green(), peer);
    }

    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let target_id = format!("target-{run_id}");
    let bystander_id = format!("bystander-{run_id}");

    println!("\n{} Establishing SSE connections...", "→".blue());
    let mut tabs = vec![
        Connection::establish(&cli.base_url, &target_id, "Target tab 1".to_string()).await?,
        Connection::establish(&peer_url, &target_id, "Target tab 2".to_string()).await?,
    ];
    let mut bystander =
        Connection::establish(&peer_url, &bystander_id, "Bystander".to_string()).await?;

    // Streams register when the server accepts them; give the handshakes a
    // moment before asserting on them.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    println!("{} 3 SSE connections established", "✓".green());

    println!("\n{}", "=== TEST PHASE ===".bright_white().bold());

    let mut results = Vec::new();

    match cli.scenario {
        ScenarioChoice::ConnectionTest => {
            results.push(scenarios::test_connection(&api, 3).await?);
        }
        ScenarioChoice::FanOut => {
            results.push(scenarios::test_fan_out(&api, &mut tabs, &mut bystander).await?);
        }
        ScenarioChoice::Broadcast => {
            tabs.push(bystander);
            results.push(scenarios::test_broadcast(&api, &mut tabs).await?);
        }
        ScenarioChoice::All => {
            results.push(scenarios::test_connection(&api, 3).await?);
            results.push(scenarios::test_fan_out(&api, &mut tabs, &mut bystander).await?);
            tabs.push(bystander);
            results.push(scenarios::test_broadcast(&api, &mut tabs).await?);
        }
    }

    println!("\n{}", "=== RESULTS ===".bright_white().bold());
    print_test_summary(&results);

    let all_passed = results.iter().all(|r| r.passed);

    if all_passed {
        println!("\n{}", "All tests passed! ✓".bright_green().bold());
    } else {
        println!("\n{}", "Some tests failed! ✗".bright_red().bold());
    }

    std::process::exit(if all_passed { 0 } else { 1 });
}
