use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use livebench_core::config::Config;
use livebench_core::forward::{self, ForwardedSender};
use livebench_core::instance::{Identity, InstanceCoordinator, Role};
use livebench_core::options::{Cli, Options};
use livebench_core::session::BenchSession;
use livebench_core::telemetry::logging;

#[tokio::main]
async fn main() -> ExitCode {
    // Forwarded verbatim to a running master, so keep what was typed.
    let arguments: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    let cli = Cli::parse_from(&arguments);

    if let Err(err) = logging::init(&cli.logging.to_config()) {
        eprintln!("failed to initialise logging: {err}");
    }

    let options = match Options::from_cli(cli) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("livebench: {err}");
            return ExitCode::from(2);
        }
    };

    match run(&arguments, options).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("livebench: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(arguments: &[String], options: Options) -> Result<ExitCode> {
    let config = Config::from_env();
    let coordinator = InstanceCoordinator::new(
        Identity::resolve(&config),
        &config.runtime_dir,
        options.no_remote,
    );

    match coordinator.decide_role() {
        Role::Master => run_master(config, &coordinator, options).await,
        Role::Follower => Ok(run_follower(&config, &coordinator, arguments, &options).await),
    }
}

async fn run_master(
    config: Config,
    coordinator: &InstanceCoordinator,
    options: Options,
) -> Result<ExitCode> {
    if options.ping {
        info!("no running instance answered the ping");
        return Ok(ExitCode::FAILURE);
    }
    if options.remote_only {
        debug!("no running instance; nothing to do for --remoteonly");
        return Ok(ExitCode::SUCCESS);
    }

    let forward_timeout = config.forward_timeout;
    let mut session = BenchSession::new(config);
    session.apply(&options);
    if options.has_noninteractive_options() {
        return Ok(ExitCode::SUCCESS);
    }

    session.initialize();
    let (forwarded_tx, mut forwarded_rx) = mpsc::unbounded_channel();
    let _listener = if options.no_remote {
        None
    } else {
        listen(&coordinator.channel_path(), forwarded_tx, forward_timeout)
    };

    info!("session running; press ctrl-c to quit");
    loop {
        tokio::select! {
            Some(forwarded) = forwarded_rx.recv() => session.handle_forwarded(forwarded),
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("shutting down");
                break;
            }
        }
    }

    session.shutdown();
    Ok(ExitCode::SUCCESS)
}

#[cfg(unix)]
fn listen(
    path: &Path,
    forwarded: ForwardedSender,
    read_timeout: Duration,
) -> Option<forward::ArgumentListener> {
    match forward::ArgumentListener::bind(path, forwarded, read_timeout) {
        Ok(listener) => Some(listener),
        Err(err) => {
            warn!(error = %err, "failed to listen for forwarded arguments");
            None
        }
    }
}

#[cfg(not(unix))]
fn listen(_path: &Path, _forwarded: ForwardedSender, _read_timeout: Duration) -> Option<()> {
    warn!("argument forwarding is not supported on this platform");
    None
}

async fn run_follower(
    config: &Config,
    coordinator: &InstanceCoordinator,
    arguments: &[String],
    options: &Options,
) -> ExitCode {
    if options.ping {
        return ExitCode::SUCCESS;
    }
    if !options.remote_only && !options.has_noninteractive_options() {
        println!("Another instance running. Activating...");
    }
    if options.plugin_path.is_some() {
        warn!("Ignoring --pluginpath option");
    }
    if !options.import_paths.is_empty() {
        warn!("Ignoring --importpath option");
    }

    debug!(master = ?coordinator.master_pid(), "forwarding arguments");
    match forward::forward_arguments(&coordinator.channel_path(), arguments, config.forward_timeout)
        .await
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error forwarding arguments: {err}");
            if let Some(kind) = err.socket_kind() {
                eprintln!("{kind}");
            }
            ExitCode::FAILURE
        }
    }
}
