use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use threadline_agent::EchoRuntime;
use threadline_core::config::{Config, LoggingConfig};
use threadline_core::store::JsonConversationStore;
use threadline_gateway::GatewayState;

#[derive(Parser)]
#[command(
    name = "threadline",
    about = "Chat gateway with cancellable, streamed agent invocations",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show system status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
}

/// Install the global subscriber. `RUST_LOG` overrides the config file.
fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = logging
            .level
            .clone()
            .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string());
        let mut directives = vec![level];
        directives.extend(logging.filters.iter().cloned());
        EnvFilter::new(directives.join(","))
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !errors.is_empty() {
        for error in &errors {
            tracing::error!("{error}");
        }
        anyhow::bail!("Invalid configuration ({} errors)", errors.len());
    }

    let port = port.unwrap_or_else(|| config.gateway_port());
    let store_dir = config.store_dir();
    tracing::info!(
        store = %store_dir.display(),
        on_conflict = ?config.conflict_policy(),
        "Starting Threadline gateway on port {port}"
    );

    let store = Arc::new(JsonConversationStore::new(store_dir));
    let runtime = Arc::new(EchoRuntime::new(Duration::from_millis(config.echo_delay_ms())));
    let state = GatewayState::new(Arc::new(config), store, runtime);

    #[cfg(feature = "metrics")]
    let state = state.with_metrics(threadline_gateway::metrics::install_prometheus_recorder()?);

    threadline_gateway::start_gateway(Arc::new(state), port).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);
    tracing::debug!(path = %config_path.display(), "Loaded config");

    match cli.command {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Status => {
            println!("Threadline v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Listen: {}:{}", config.bind_addr(), config.gateway_port());
            println!("Store: {}", config.store_dir().display());
            println!("On conflict: {:?}", config.conflict_policy());
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
        },
    }

    Ok(())
}
