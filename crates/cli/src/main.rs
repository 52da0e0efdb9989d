mod args;

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::Mutex,
};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    tokio_util::sync::CancellationToken,
    tracing::info,
    tracing_subscriber::{
        EnvFilter,
        fmt::{self, writer::BoxMakeWriter},
        layer::SubscriberExt,
        util::SubscriberInitExt,
    },
};

use {
    args::{AgentArgs, ServerArgs},
    tally_agent::Agent,
    tally_common::shutdown_signal,
    tally_config::TallyConfig,
};

#[derive(Parser)]
#[command(name = "tally", about = "Tally: metrics collection server and agent", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (toml, yaml or json). Discovered when omitted.
    #[arg(short = 'c', long, global = true, env = "CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server that stores metrics.
    Server(ServerArgs),
    /// Run the agent that polls this host and reports to a server.
    Agent(AgentArgs),
}

fn init_telemetry(cli: &Cli, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let (writer, ansi) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        },
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(writer),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .init();
    }
    Ok(())
}

fn load(cli: &Cli) -> anyhow::Result<TallyConfig> {
    tally_config::load_or_discover(cli.config.as_deref())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = load(&cli)?;
    let log_file = match &cli.command {
        Commands::Server(args) => {
            args.apply(&mut config);
            config.server.log_file.clone()
        },
        Commands::Agent(args) => {
            args.apply(&mut config);
            config.agent.log_file.clone()
        },
    };
    init_telemetry(&cli, log_file.as_deref())?;

    info!(version = env!("CARGO_PKG_VERSION"), "tally starting");

    match cli.command {
        Commands::Server(_) => tally_server::run(&config).await,
        Commands::Agent(_) => {
            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    shutdown_signal().await;
                    info!("shutdown signal received");
                    cancel.cancel();
                }
            });
            Agent::new(&config.agent)?.run(cancel).await;
            Ok(())
        },
    }
}
