//! Diagnostics command - probes the container engine and prints the
//! effective configuration

use anyhow::Result;

use workspace_agent::config::Configuration;
use workspace_agent::container::ContainerEngine;

pub async fn run(config_path: &str) -> Result<()> {
    println!("Workspace Agent Diagnostics");
    println!("===========================\n");

    let config = match Configuration::load(config_path) {
        Ok(config) => {
            println!("Configuration: {}", config_path);
            config
        }
        Err(e) => {
            println!("Configuration: {} (unreadable: {}), using defaults", config_path, e);
            Configuration::default()
        }
    };

    println!("  API bind: {}:{}", config.api.host, config.api.port);
    println!("  Root: {}", config.system.root_directory.display());
    println!("  Engine binary: {}", config.container.binary);
    println!("  Image: {}", config.container.image);
    println!("  Network: {}", config.container.network);
    println!(
        "  Host ports: [{}, {})",
        config.container.host_port_base,
        config.container.host_port_base as u32 + config.container.host_port_scan as u32
    );
    println!(
        "  Idle thresholds: run {}s, container {}s",
        config.idle.stop_run_after_secs, config.idle.stop_container_after_secs
    );
    println!(
        "  Signing: {}",
        if config.auth.signing_enabled { "enabled" } else { "disabled" }
    );

    println!("\nContainer Engine:");
    println!("-----------------");
    let engine = ContainerEngine::new(&config.container);
    match engine.version().await {
        Ok(version) => println!("  Server version: {}", version),
        Err(e) => {
            println!("  Unreachable: {}", e);
            println!("  Make sure the engine is running and accessible.");
        }
    }

    println!("\nDiagnostics complete.");
    Ok(())
}
