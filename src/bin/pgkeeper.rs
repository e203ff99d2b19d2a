//! Keeper binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use pgkeeper::common::{StopMode, StopSignal};
use pgkeeper::keeper::coordinator::Coordinator;
use pgkeeper::keeper::report::{self, OutputFormat};
use pgkeeper::keeper::{fsm, FileStateStore, Keeper, KeeperService, NodeState, PgCtl, StateStore};
use pgkeeper::pgsql::notify::{LOG_CHANNEL, STATE_CHANNEL};
use pgkeeper::pgsql::{ConnectionClass, ConnectionHandle, PgConnector, RetryPolicy, Subscription};
use pgkeeper::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pgkeeper")]
#[command(about = "Keeps a PostgreSQL node in the state its coordinator assigns")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the keeper loop
    Run,

    /// Inspect the keeper and its formation
    Show {
        #[command(subcommand)]
        what: ShowCommands,
    },
}

#[derive(Subcommand)]
enum ShowCommands {
    /// Local keeper state, from the state file
    State {
        #[arg(long)]
        json: bool,
    },

    /// Recent coordinator events for this group
    Events {
        /// Number of events
        #[arg(long, default_value = "10")]
        count: u32,

        #[arg(long)]
        json: bool,
    },

    /// The state machine transition table
    Fsm {
        /// Only transitions leaving this state
        #[arg(long)]
        state: Option<NodeState>,

        /// Graphviz output
        #[arg(long)]
        dot: bool,

        #[arg(long)]
        json: bool,
    },
}

fn output_format(json: bool) -> OutputFormat {
    if json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    }
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// SIGTERM asks for a graceful stop, SIGINT for a fast one.
fn spawn_signal_handler(stop: StopSignal) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, stopping after the current cycle");
                    stop.stop(StopMode::Graceful);
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, stopping now");
                    stop.stop(StopMode::Fast);
                }
            }
        }
    });
    Ok(())
}

fn coordinator_handle(
    config: &Config,
    connector: &Arc<PgConnector>,
    stop: &StopSignal,
) -> pgkeeper::Result<ConnectionHandle> {
    ConnectionHandle::new(
        ConnectionClass::Coordinator,
        &config.coordinator.conninfo,
        connector.clone(),
        RetryPolicy::from_config(&config.timeouts),
        stop.clone(),
    )
}

async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let stop = StopSignal::new();
    spawn_signal_handler(stop.clone())?;

    let connector = Arc::new(PgConnector::new(config.timeouts.connect_timeout));
    let local = ConnectionHandle::new(
        ConnectionClass::Local,
        &config.local_conninfo(),
        connector.clone(),
        RetryPolicy::from_config(&config.timeouts),
        stop.clone(),
    )?;
    let coordinator = Coordinator::new(coordinator_handle(&config, &connector, &stop)?);
    let subscription = Subscription::new(
        coordinator_handle(&config, &connector, &stop)?,
        &[STATE_CHANNEL, LOG_CHANNEL],
    );

    let postgres = Arc::new(PgCtl::new(
        &config.postgres.pgdata,
        config.postgres.bin_dir.clone(),
        config.postgres.port,
    ));
    let store = Arc::new(FileStateStore::new(&config.state_file));

    info!(
        "Starting keeper for node \"{}\" of formation \"{}\", pgdata {}",
        config.node_name,
        config.formation,
        config.postgres.pgdata.display()
    );

    let keeper = Keeper::new(
        config.clone(),
        local,
        coordinator,
        connector,
        postgres,
        store,
        stop.clone(),
    );
    let mut service = KeeperService::new(
        keeper,
        Some(subscription),
        config.timeouts.loop_interval,
        stop,
    );
    service.run().await?;
    Ok(())
}

async fn show_state(config: &Config, format: OutputFormat) -> anyhow::Result<()> {
    let store = FileStateStore::new(&config.state_file);
    let state = store
        .read_state()
        .await?
        .with_context(|| format!("no state file at {}", store.path().display()))?;
    print!("{}", report::format_state(&state, format)?);
    Ok(())
}

async fn show_events(config: &Config, count: u32, format: OutputFormat) -> anyhow::Result<()> {
    let stop = StopSignal::new();
    let connector = Arc::new(PgConnector::new(config.timeouts.connect_timeout));
    let mut coordinator = Coordinator::new(coordinator_handle(config, &connector, &stop)?);
    if !coordinator.check_settings().await? {
        warn!("The coordinator extension is not in shared_preload_libraries");
    }
    let events = coordinator
        .last_events(&config.formation, config.group_id, count)
        .await?;
    coordinator.close();
    print!("{}", report::format_events(&events, format)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let config = Config::load(cli.config.as_deref())?;
            init_tracing(&config.log_level);
            run(config).await?;
        }

        Commands::Show { what } => {
            init_tracing("warn");
            match what {
                ShowCommands::State { json } => {
                    let config = Config::load(cli.config.as_deref())?;
                    show_state(&config, output_format(json)).await?;
                }
                ShowCommands::Events { count, json } => {
                    let config = Config::load(cli.config.as_deref())?;
                    show_events(&config, count, output_format(json)).await?;
                }
                ShowCommands::Fsm { state, dot, json } => {
                    if dot {
                        if state.is_some() {
                            warn!("--state is ignored with --dot");
                        }
                        print!("{}", fsm::graphviz());
                    } else {
                        print!("{}", report::format_fsm(state, output_format(json))?);
                    }
                }
            }
        }
    }

    Ok(())
}
