//! mobiledev - run allowlisted shell commands and a coding-agent CLI in a
//! project directory, driven over WebSocket from a mobile client.

mod agent;
mod allowlist;
mod config;
mod error;
mod exec;
mod gateway;
mod platform;
mod protocol;
mod qr;

use allowlist::{Allowlist, ArgPolicy};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use gateway::ServerContext;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mobiledev", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Serve,
    /// Print the commands clients may run
    Allowlist,
}

// Global so they are accepted before or after `serve`.
#[derive(Args)]
struct ServeArgs {
    /// Port to listen on
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Project directory commands run in (default: current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Config file (default: ~/.mobiledev/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent CLI executable
    #[arg(long, global = true)]
    agent_command: Option<String>,

    /// Don't print the pairing QR code
    #[arg(long, global = true)]
    no_qr: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Allowlist) => {
            print_allowlist(Allowlist::builtin());
            Ok(())
        }
        Some(Commands::Serve) | None => serve(cli.serve).await,
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "mobiledev=debug" } else { "mobiledev=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

async fn serve(args: ServeArgs) -> Result<(), BoxError> {
    init_logging(args.verbose);

    let mut config = config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(root) = args.root {
        config.project_root = Some(root);
    }
    if let Some(command) = args.agent_command {
        config.agent.command = command;
    }

    let root = config.resolve_root()?;
    tracing::info!("Project root: {}", root.display());

    if which::which(&config.agent.command).is_err() {
        tracing::warn!(
            "Agent executable '{}' not found on PATH; /claude/ws requests will fail",
            config.agent.command
        );
    }

    let ctx = Arc::new(ServerContext {
        allowlist: Allowlist::builtin(),
        exec: Arc::new(config.exec_settings(&root)),
        agent: Arc::new(config.agent_settings(&root)),
        keepalive: config.keepalive(),
    });

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    qr::display_banner(&qr::PairingInfo::detect(&config.bind, config.port), !args.no_qr);

    gateway::run(listener, ctx).await;
    Ok(())
}

fn print_allowlist(allowlist: &Allowlist) {
    println!("{}", "Allowed commands:".bold());
    for spec in allowlist.commands() {
        let policy = match &spec.policy {
            ArgPolicy::NoArgs => "no arguments".to_string(),
            ArgPolicy::Any => "any arguments".to_string(),
            ArgPolicy::Patterns(patterns) => format!("{} argument pattern(s)", patterns.len()),
        };
        println!(
            "  {:<10} {} {}",
            spec.name.green(),
            spec.description,
            format!("({})", policy).dimmed()
        );
    }
    println!();
    println!("{}", "Always blocked:".bold());
    println!("  {}", allowlist.blocked().join(" ").red());
}
