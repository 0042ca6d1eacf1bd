mod cli;

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use jumptunnel::config;
use jumptunnel::config::model::{AppConfig, JumpSettings};
use jumptunnel::gatling::{GatlingConnector, GatlingRunner, RunParameters};
use jumptunnel::ssh::process::kill_pid;
use jumptunnel::ssh::{JumpClient, RemoteProcessList, Tunnel};

use cli::{Cli, Commands, ConfigAction, GatlingArgs};

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Open { local_port, direct } => {
            let config = load_config(config_path)?;
            cmd_open(config.jump, local_port, direct).await?;
        }
        Commands::Ps { user, grep } => {
            let config = load_config(config_path)?;
            cmd_ps(&config.jump, user.as_deref(), grep.as_deref()).await?;
        }
        Commands::Kill { pid } => {
            let config = load_config(config_path)?;
            cmd_kill(&config.jump, pid).await?;
        }
        Commands::Gatling(args) => {
            let config = load_config(config_path)?;
            cmd_gatling(config, args).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => cmd_config_init(config_path, force)?,
            ConfigAction::Show => cmd_config_show(config_path)?,
        },
        Commands::Completions { shell } => {
            cmd_completions(shell);
        }
    }

    Ok(())
}

fn load_config(custom_path: Option<&str>) -> Result<AppConfig> {
    config::load_with_override(custom_path).context("Failed to load config")
}

fn jump_client(settings: &JumpSettings) -> Result<JumpClient> {
    JumpClient::new(settings.user.clone(), settings).context("Failed to set up jump host access")
}

/// Open the tunnel, wait for Ctrl+C, then tear everything down.
async fn cmd_open(mut settings: JumpSettings, local_port: Option<u16>, direct: bool) -> Result<()> {
    if let Some(port) = local_port {
        settings.socks_port = port;
    }
    if direct {
        settings.direct_access = true;
    }

    let client = Arc::new(jump_client(&settings)?);
    let mut tunnel = Tunnel::from_settings(Arc::clone(&client), &settings);

    if let Err(e) = tunnel.open().await {
        client.cleanup();
        return Err(e).context("Failed to open tunnel");
    }

    println!(
        "SOCKS proxy ({} tunnel via {}) listening on 127.0.0.1:{}",
        tunnel.kind(),
        client.destination(),
        tunnel.local_port()
    );
    println!("Press Ctrl+C to close.");

    let waited = tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl+C");

    let closed = tunnel.close().await;
    client.cleanup();
    waited?;
    closed.context("Failed to close tunnel")?;

    println!("Tunnel closed.");
    Ok(())
}

/// List jump host processes as a table.
async fn cmd_ps(settings: &JumpSettings, user: Option<&str>, grep: Option<&str>) -> Result<()> {
    let client = jump_client(settings)?;
    let listed = RemoteProcessList::list(&client).await;
    client.cleanup();
    let processes = listed.context("Failed to list jump host processes")?;

    let rows: Vec<_> = processes
        .iter()
        .filter(|p| user.is_none_or(|u| p.user == u))
        .filter(|p| grep.is_none_or(|g| p.command.contains(g)))
        .collect();

    if rows.is_empty() {
        println!("No matching processes.");
        return Ok(());
    }

    println!("  {:<12} {:>8}  COMMAND", "USER", "PID");
    println!("  {}", "-".repeat(76));
    for p in &rows {
        println!("  {:<12} {:>8}  {}", p.user, p.pid, p.command.trim_end());
    }
    println!("\n  {} process(es)", rows.len());

    Ok(())
}

async fn cmd_kill(settings: &JumpSettings, pid: u32) -> Result<()> {
    let client = jump_client(settings)?;
    let killed = kill_pid(&client, pid).await;
    client.cleanup();
    killed.with_context(|| format!("Failed to kill process {pid} on {}", client.destination()))?;

    println!("Sent kill to process {pid} on {}", client.destination());
    Ok(())
}

async fn cmd_gatling(config: AppConfig, args: GatlingArgs) -> Result<()> {
    let mut parameters = RunParameters::new(
        args.simulation,
        args.platform,
        args.organization,
        args.space,
        args.username,
        args.password,
    )
    .context("Invalid simulation parameters")?;
    parameters.users = args.users;
    parameters.users_at_once = args.users_at_once;
    parameters.ramp = args.ramp;
    parameters.duration = args.duration;
    parameters.repeat = args.repeat;
    parameters.proxy = args.proxy;
    parameters.proxy_http_port = args.proxy_http_port;
    parameters.proxy_https_port = args.proxy_https_port;

    let connector = GatlingConnector::connect(&config.gatling)
        .await
        .context("Failed to connect to the Gatling host")?;

    let mut runner = GatlingRunner::new(connector, config.gatling, parameters);
    let outcome = runner.run().await;

    let log_file = runner.parameters().log_file();
    if let Err(e) = runner.into_host().close().await {
        tracing::warn!(error = %e, "failed to close Gatling connection");
    }
    let result = outcome.with_context(|| format!("Simulation failed (log: {log_file})"))?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("Failed to serialize result")?
        );
    } else {
        print!("{result}");
    }
    Ok(())
}

fn cmd_config_init(custom_path: Option<&str>, force: bool) -> Result<()> {
    let path = config::resolve_config_path(custom_path);
    if path.exists() && !force {
        bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }
    let written = config::save_with_override(&AppConfig::default(), custom_path)?;
    println!("Wrote {}", written.display());
    Ok(())
}

fn cmd_config_show(custom_path: Option<&str>) -> Result<()> {
    let config = load_config(custom_path)?;
    print!("{}", config::writer::render(&config)?);
    Ok(())
}

/// Generate shell completions to stdout.
fn cmd_completions(shell: clap_complete::Shell) {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "jumptunnel", &mut io::stdout());
}
