use anyhow::Context;
use clap::{Parser, Subcommand};
use peerlaunch_lib::commands;
use peerlaunch_lib::session::LaunchConfig;
use peerlaunch_lib::{logger, Config, StopCode, StopSignal};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, warn};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(long, env = "PEERLAUNCH_CONFIG")]
    config: Option<PathBuf>,

    /// Override the directory endpoint
    #[arg(long, env = "PEERLAUNCH_DIRECTORY")]
    directory: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a game on the first node to become ready
    Launch {
        #[arg(long)]
        game: String,
        /// Lowest acceptable node version
        #[arg(long)]
        node_min: Option<String>,
        /// Highest acceptable node version
        #[arg(long)]
        node_max: Option<String>,
    },
    /// List nodes currently offering sessions
    Nodes {
        #[arg(long)]
        capability: Option<String>,
    },
    /// Check that the configured ICE servers answer
    IceCheck,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(directory) = &cli.directory {
        config.directory.endpoint = directory.clone();
        config.signaling.endpoint = directory.clone();
    }
    config.normalize();
    config.validate()?;
    Ok(config)
}

/// Stop everything on Ctrl-C
fn stop_on_ctrl_c() -> StopSignal {
    let stop = StopSignal::new();
    let signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted");
            signal.stop_with(StopCode::Normal);
        }
    });
    stop
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli)?;
    logger::init(&config.logging);
    let stop = stop_on_ctrl_c();

    match cli.command {
        Command::Launch {
            game,
            node_min,
            node_max,
        } => {
            let request = LaunchConfig {
                node_min,
                node_max,
                ..LaunchConfig::new(game)
            };
            match commands::launch(&config, request, stop).await {
                Ok(code) => {
                    if code != 0 {
                        println!("Exit code: {} ({})", code, StopCode::from_code(code));
                    }
                    Ok(code)
                }
                Err(e) if e.is_user_facing() => {
                    println!("{e}");
                    Ok(StopCode::GENERAL_ERROR)
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Nodes { capability } => {
            let nodes = commands::list_nodes(&config, capability, &stop).await?;
            for node in &nodes {
                println!("{}", node.session_id);
            }
            println!("{} node(s)", nodes.len());
            Ok(0)
        }
        Command::IceCheck => {
            let mut failed = 0;
            for server in &config.ice {
                let ok = commands::check_ice_server_availability(server).await?;
                println!("{} {} {}", if ok { "ok  " } else { "FAIL" }, server.id, server.url);
                if !ok {
                    failed += 1;
                }
            }
            Ok(failed)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
