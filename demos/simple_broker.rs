//! Simple hpfeeds broker example
//!
//! Run with: cargo run --example simple_broker [BIND_ADDR] [METRICS_ADDR]
//!
//! Examples:
//!   cargo run --example simple_broker                              # binds to 0.0.0.0:10000
//!   cargo run --example simple_broker 127.0.0.1:20000              # binds to 127.0.0.1:20000
//!   cargo run --example simple_broker 0.0.0.0:10000 0.0.0.0:9431   # with Prometheus metrics
//!
//! A single demo identity is registered:
//!
//!   ident:  demo
//!   secret: demo-secret
//!   may publish and subscribe on: demo.events, demo.alerts
//!
//! With the python hpfeeds client:
//!   hpfeeds subscribe --host localhost -p 10000 -i demo -s demo-secret -c demo.events
//!   hpfeeds publish   --host localhost -p 10000 -i demo -s demo-secret -c demo.events hello

use std::sync::Arc;

use hpfeeds_broker::{AuthKey, Broker, BrokerConfig, MemoryAuthenticator};

const DEMO_CHANNELS: [&str; 2] = ["demo.events", "demo.alerts"];

fn print_usage() {
    eprintln!("Usage: simple_broker [BIND_ADDR] [METRICS_ADDR]");
    eprintln!();
    eprintln!("  BIND_ADDR     host:port to accept clients on (default 0.0.0.0:10000)");
    eprintln!("  METRICS_ADDR  host:port for /metrics, /live and /ready (default: disabled)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let bind = args.get(1).map(String::as_str).unwrap_or("0.0.0.0:10000");
    let metrics = args.get(2).map(String::as_str);

    let config = match BrokerConfig::from_specs(Some(bind), metrics) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hpfeeds_broker=debug".parse()?)
                .add_directive("simple_broker=debug".parse()?),
        )
        .init();

    let auth = MemoryAuthenticator::new();
    auth.insert(
        AuthKey::new("demo", "demo-owner", "demo-secret")
            .publish(DEMO_CHANNELS)
            .subscribe(DEMO_CHANNELS),
    );

    println!("Starting hpfeeds broker on {}", config.bind);
    if config.metrics.is_configured() {
        println!("Metrics on http://{}/metrics", config.metrics);
    }
    println!();
    println!("Identity: demo / demo-secret");
    println!("Channels: {}", DEMO_CHANNELS.join(", "));
    println!();

    let broker = Arc::new(Broker::new(config, Arc::new(auth)));

    let result = broker
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\nShutting down...");
        })
        .await;

    if let Err(e) = result {
        eprintln!("Broker error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
