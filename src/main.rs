use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{LoggingConfig, RatekeeperConfig};
use ratekeeper::ratelimit::{parse_many, Identifier, RateLimiter, Strategy};
use ratekeeper::registry;

/// Hit, inspect and clear rate limits in a configured counter store.
#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about)]
struct Cli {
    /// YAML configuration file; `RATEKEEPER__*` variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Cache to use instead of the configured default
    #[arg(long, global = true)]
    cache: Option<String>,

    /// Strategy to use instead of the configured default
    #[arg(long, global = true)]
    strategy: Option<Strategy>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record a hit against every rate and report whether it was allowed
    Hit {
        /// Rates such as "5/minute" or "5/second; 100/hour"
        rates: String,
        /// Identifier components, e.g. a namespace, an operation and a caller key
        #[arg(required = true)]
        identifiers: Vec<String>,
        /// Slots the hit consumes
        #[arg(long, default_value_t = 1)]
        cost: u64,
    },
    /// Show the remaining hits and reset time of every rate
    Stats {
        rates: String,
        #[arg(required = true)]
        identifiers: Vec<String>,
    },
    /// Discard the hits recorded against every rate
    Clear {
        rates: String,
        #[arg(required = true)]
        identifiers: Vec<String>,
    },
    /// Check that the counter store is reachable
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = RatekeeperConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Ratekeeper");

    let registry = registry::global();
    registry.configure(config, None)?;

    let store = registry.resolve(cli.cache.as_deref(), None).await?;
    let strategy = cli.strategy.unwrap_or_else(|| registry.default_strategy());
    let limiter = RateLimiter::new(strategy, store);
    info!(strategy = %strategy, store = limiter.store().name(), "Rate limiter initialized");

    let output = match cli.command {
        Command::Hit {
            rates,
            identifiers,
            cost,
        } => {
            let identifier = Identifier::new(identifiers)?;
            let mut results = Vec::new();
            for rate in parse_many(&rates)? {
                let allowed = limiter.hit_cost(&rate, &identifier, cost).await?;
                let stats = limiter.get_window_stats(&rate, &identifier).await?;
                results.push(json!({
                    "rate": rate,
                    "allowed": allowed,
                    "remaining": stats.remaining,
                    "reset_time": stats.reset_time,
                }));
            }
            json!({ "identifier": identifier.to_string(), "results": results })
        }
        Command::Stats { rates, identifiers } => {
            let identifier = Identifier::new(identifiers)?;
            let mut results = Vec::new();
            for rate in parse_many(&rates)? {
                let stats = limiter.get_window_stats(&rate, &identifier).await?;
                results.push(json!({ "rate": rate, "stats": stats }));
            }
            json!({ "identifier": identifier.to_string(), "results": results })
        }
        Command::Clear { rates, identifiers } => {
            let identifier = Identifier::new(identifiers)?;
            let rates = parse_many(&rates)?;
            for rate in &rates {
                limiter.clear(rate, &identifier).await?;
            }
            json!({ "identifier": identifier.to_string(), "cleared": rates })
        }
        Command::Check => {
            let store = limiter.store();
            json!({ "store": store.name(), "healthy": store.check().await })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Logs go to stderr so stdout stays machine-readable. `RUST_LOG` wins over
/// the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
