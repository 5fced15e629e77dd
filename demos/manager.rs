//! Manager example
//!
//! Run with: cargo run --example manager [MANAGER_TOML] [PLANET_TOML...]
//!
//! Starts a manager with the given settings (defaults otherwise), restores
//! the planet it saved last time, merges any planet documents named on the
//! command line and serves workers, components and admins until Ctrl+C.
//! The planet is saved on the way out.
//!
//! A planet document looks like:
//!
//! ```toml
//! [[flow]]
//! name = "default"
//!
//! [[flow.component]]
//! name = "producer-video"
//! type = "videotest-producer"
//! worker = "localhost"
//! ```

use std::path::Path;

use mediaplanet::auth::StaticBouncer;
use mediaplanet::config::{persist, ManagerConfig};
use mediaplanet::manager::Manager;

fn print_usage() {
    eprintln!("Usage: manager [MANAGER_TOML] [PLANET_TOML...]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  MANAGER_TOML    Manager settings (default: built-in defaults)");
    eprintln!("  PLANET_TOML     Planet documents merged after startup");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mediaplanet=info".parse()?),
        )
        .init();

    let config = match args.first() {
        Some(path) => ManagerConfig::load(Path::new(path))?,
        None => ManagerConfig::default(),
    };
    let manager = Manager::new(config.clone());
    manager.register_bouncer(
        "demo-bouncer",
        std::sync::Arc::new(StaticBouncer::new().user("user", "test")),
    );

    if let Some(saved) = persist::load_planet(&config.config_dir, &config.name)? {
        manager.load_configuration(&saved)?;
    }
    for path in args.iter().skip(1) {
        let text = std::fs::read_to_string(path)?;
        manager.load_configuration_str(&text)?;
        println!("Loaded {}", path);
    }

    let server = manager.server()?;
    println!("Manager {} listening on {}", config.name, server.bind_addr());

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    match manager.save_planet() {
        Ok(path) => println!("Planet saved to {}", path.display()),
        Err(e) => eprintln!("Failed to save planet: {}", e),
    }
    Ok(())
}
