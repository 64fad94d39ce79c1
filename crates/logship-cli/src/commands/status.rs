//! Status command implementation.

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;

/// Health response from the server.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    uptime_seconds: u64,
    components: HashMap<String, ComponentStatus>,
}

/// Component status from the server.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    message: Option<String>,
}

/// Show status and health.
pub async fn run(url: &str) -> Result<()> {
    let base = url.trim_end_matches('/');
    println!("Checking health at {}...\n", base);

    let client = reqwest::Client::new();
    let health_url = format!("{}/health", base);

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => {
                    print_health_status(&health, status_code.as_u16());
                }
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs the logship daemon running?");
            println!("Start it with: logship serve --config <path-to-config>");
            return Ok(());
        }
    }

    let metrics_url = format!("{}/metrics", base);
    println!("\n--- Metrics ---");
    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let body = response.text().await.unwrap_or_default();
            for line in body.lines().filter(|l| !l.starts_with('#') && !l.is_empty()) {
                println!("{}", line);
            }
        }
        Err(e) => {
            println!("Failed to fetch metrics: {}", e);
        }
    }

    Ok(())
}

fn print_health_status(health: &HealthResponse, http_status: u16) {
    println!("Overall: {} (HTTP {})", health.status, http_status);
    println!("Uptime:  {}s", health.uptime_seconds);
    println!();

    let mut names: Vec<_> = health.components.keys().collect();
    names.sort();
    for name in names {
        let component = &health.components[name];
        match &component.message {
            Some(message) => println!("  {:<10} {} ({})", name, component.status, message),
            None => println!("  {:<10} {}", name, component.status),
        }
    }
}
