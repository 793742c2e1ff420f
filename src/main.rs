use hopscope::cli::{Cli, Commands, ConfigAction};
use hopscope::config::Config;
use hopscope::daemon::Daemon;
use hopscope::error::{HopscopeError, Result};
use hopscope::flow::{AugmentedFlow, FlowRecord, Sizes, TraceStatus};
use hopscope::trace::HopDiscovery;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Run => {
            cmd_run(cli.config)?;
        }
        Commands::Trace { destination, from } => {
            cmd_trace(cli.config, &from, &destination)?;
        }
        Commands::Resolve { address } => {
            cmd_resolve(cli.config, &address)?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, action)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "hopscope=debug" } else { "hopscope=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| HopscopeError::Io {
        source: e,
        context: "Failed to create tokio runtime".to_string(),
    })
}

fn cmd_run(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    tracing::info!(
        "Starting hopscope: {} -> {} on {}",
        config.broker.inbound_queue,
        config.broker.outbound_queue,
        config.broker.host
    );

    let daemon = Daemon::new(config)?;
    let stats = runtime()?.block_on(daemon.run())?;

    tracing::info!(
        "Stopped after {} messages ({} published, {} rejected)",
        stats.received,
        stats.published,
        stats.rejected
    );

    Ok(())
}

fn cmd_trace(config_path: Option<PathBuf>, from: &str, destination: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let settle_limit = config.geo_request_timeout();
    let daemon = Daemon::new(config)?;

    let snapshot = runtime()?.block_on(async {
        let resolver = daemon.resolver();
        let record = FlowRecord {
            out_ip: from.to_string(),
            out_port: None,
            in_ip: destination.to_string(),
            in_port: None,
            in_size: Sizes::default(),
            out_size: Sizes::default(),
        };
        let flow = Arc::new(AugmentedFlow::new(
            &record,
            resolver.resolve(from),
            resolver.resolve(destination),
            false,
            TraceStatus::Running,
        ));

        daemon.tracer().trace(from, destination, flow.clone());
        let status = flow.wait_for_trace().await;
        tracing::info!("Trace finished: {}", status.as_str());

        let mut addresses = flow.routes();
        addresses.push(flow.out_ip().clone());
        addresses.push(flow.in_ip().clone());
        wait_until_settled(&addresses, settle_limit).await;

        flow.snapshot()
    });

    print_json(&snapshot)
}

fn cmd_resolve(config_path: Option<PathBuf>, address: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let settle_limit = config.geo_request_timeout();
    let daemon = Daemon::new(config)?;

    let snapshot = runtime()?.block_on(async {
        let ip = daemon.resolver().resolve(address);
        wait_until_settled(std::slice::from_ref(&ip), settle_limit).await;
        ip.snapshot()
    });

    print_json(&snapshot)
}

async fn wait_until_settled(addresses: &[Arc<hopscope::geo::ResolvedIp>], limit: Duration) {
    let settled = futures::future::join_all(addresses.iter().map(|ip| ip.settled()));
    if tokio::time::timeout(limit, settled).await.is_err() {
        tracing::warn!("Some locations still pending after {:?}", limit);
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| HopscopeError::Json {
        source: e,
        context: "Failed to serialize output".to_string(),
    })?;
    println!("{}", json);
    Ok(())
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path)?;
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
            println!("  Broker: {}", config.broker.host);
            println!("  Publish mode: {:?}", config.pipeline.publish_mode);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| HopscopeError::Io {
                    source: e,
                    context: format!("Failed to create config directory: {:?}", parent),
                })?;
            }

            Config::default().save(&path)?;

            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file {} not found, using defaults. Run 'hopscope config init' to create one.",
            path.display()
        );
        return Config::from_env();
    }

    Config::load(&path)
}
