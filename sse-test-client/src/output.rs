use colored::*;
use std::time::Duration;

#[derive(Debug)]
pub struct TestResult {
    pub scenario_name: String,
    pub passed: bool,
    pub message: Option<String>,
    pub duration: Duration,
}

impl TestResult {
    pub fn pass(scenario_name: &str, duration: Duration) -> Self {
        Self {
            scenario_name: scenario_name.to_string(),
            passed: true,
            message: None,
            duration,
        }
    }

    pub fn fail(scenario_name: &str, message: String, duration: Duration) -> Self {
        Self {
            scenario_name: scenario_name.to_string(),
            passed: false,
            message: Some(message),
            duration,
        }
    }
}

pub fn print_test_summary(results: &[TestResult]) {
    for result in results {
        let marker = if result.passed {
            "✓".green()
        } else {
            "✗".red()
        };
        println!(
            "{} {} ({} ms)",
            marker,
            result.scenario_name,
            result.duration.as_millis()
        );
        if let Some(message) = &result.message {
            println!("    {}", message.yellow());
        }
    }

    let passed = results.iter().filter(|r| r.passed).count();
    println!("\n{}/{} scenarios passed", passed, results.len());
}
