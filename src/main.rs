use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use spawn_server::config::SpawnConfig;
use spawn_server::plugin::{DirBuild, PluginError, SpawnServerPlugin};
use spawn_server::serve::ServeRuntime;
use spawn_server::{logging, signals, worker, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "spawn-server")]
#[command(author, version, about = "Re-run freshly built server output in a supervised worker", long_about = None)]
struct Cli {
    /// Config file (defaults to $SPAWN_SERVER_CONFIG or ./spawn-server.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch an output directory and reload the worker on every change
    Run(RunArgs),

    /// Worker process entry point (spawned by the supervisor)
    #[command(hide = true)]
    Worker,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Build output directory
    #[arg(long, default_value = "dist")]
    out_dir: PathBuf,

    /// Entry file, relative to the output directory
    #[arg(long, default_value = "main.js")]
    entry: PathBuf,

    /// Polling interval for output changes
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,

    /// Wait for the application's `ready` event instead of `listening`
    #[arg(long)]
    wait_for_ready: bool,

    /// Grace period before a worker is killed
    #[arg(long)]
    kill_timeout_ms: Option<u64>,

    /// Worker command and arguments (defaults to the built-in worker)
    #[arg(last = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Worker => {
            logging::init(true);
            worker::run(ServeRuntime::default()).await
        }
        Command::Run(args) => {
            logging::init(false);
            let config = match &cli.config {
                Some(path) => SpawnConfig::load_from(path)?,
                None => SpawnConfig::load()?,
            };
            run(config, args).await
        }
    }
}

async fn run(config: SpawnConfig, args: RunArgs) -> anyhow::Result<()> {
    let mut worker = config.worker;
    if let Some((command, rest)) = args.command.split_first() {
        worker.command = Some(command.clone());
        worker.args = rest.to_vec();
    }
    if args.wait_for_ready {
        worker.wait_for_ready = true;
    }
    if let Some(ms) = args.kill_timeout_ms {
        worker.kill_timeout_ms = ms;
    }

    let supervisor = Supervisor::new(worker);
    let mut shutdown = supervisor.attach_shutdown(signals::shutdown_signal());
    log_events(&supervisor);

    let routing = supervisor.routing().with_timeout(config.proxy.ready_timeout());
    tokio::spawn(async move {
        match routing.ready().await {
            Ok(address) => tracing::info!("Worker reachable at http://{}", address),
            Err(e) => tracing::warn!("{} ({})", e, e.error_code()),
        }
    });

    let plugin = SpawnServerPlugin::new(supervisor);
    plugin.watch_run();
    tracing::info!("Watching {}", args.out_dir.display());

    let mut ticker = tokio::time::interval(Duration::from_millis(args.poll_ms.max(10)));
    let mut last_fingerprint = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => break,
        }

        let build = match DirBuild::scan(&args.out_dir, &args.entry, true) {
            Ok(build) => build,
            Err(e) => {
                tracing::debug!("No build output yet: {:#}", e);
                continue;
            }
        };
        let fingerprint = build.fingerprint();
        if last_fingerprint.as_ref() == Some(&fingerprint) {
            continue;
        }
        last_fingerprint = Some(fingerprint);

        for error in build.errors() {
            tracing::warn!("Build error: {}", error);
        }
        match plugin.done(&build).await {
            Ok(outcome) => tracing::info!("Build handled: {:?}", outcome),
            Err(PluginError::Supervisor(e)) => {
                tracing::error!("Reload failed: {}", e.to_json());
            }
            Err(e) => tracing::error!("Reload failed: {}", e),
        }
    }

    tracing::info!("Shutting down");
    Ok(())
}

fn log_events(supervisor: &Supervisor) {
    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!("Supervisor event: {:?}", event),
                Err(RecvError::Lagged(n)) => tracing::warn!("Dropped {} supervisor events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
