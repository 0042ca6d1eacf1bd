use clap::{Parser, Subcommand};

/// SOCKS tunnels through an SSH jump host, jump host process management,
/// and remote Gatling simulation runs.
#[derive(Parser, Debug)]
#[command(name = "jumptunnel", version, about)]
pub struct Cli {
    /// Path to the config file (default: ~/.config/jumptunnel/config.toml).
    #[arg(long, global = true, env = "JUMPTUNNEL_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open the configured SOCKS tunnel and keep it open until Ctrl+C.
    Open {
        /// Local SOCKS port (overrides jump.socks_port).
        #[arg(short = 'p', long)]
        local_port: Option<u16>,

        /// Tunnel straight through the jump host (overrides jump.direct_access).
        #[arg(long)]
        direct: bool,
    },

    /// List processes running on the jump host.
    Ps {
        /// Only show processes of this user.
        #[arg(short, long)]
        user: Option<String>,

        /// Only show processes whose command contains this text.
        #[arg(short, long)]
        grep: Option<String>,
    },

    /// Kill a process on the jump host.
    Kill {
        /// Process id on the jump host.
        pid: u32,
    },

    /// Run a Gatling simulation on the configured load-test host.
    Gatling(GatlingArgs),

    /// Manage the config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate for.
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args, Debug)]
pub struct GatlingArgs {
    /// Simulation class to run.
    #[arg(long)]
    pub simulation: String,

    /// Platform domain under test.
    #[arg(long)]
    pub platform: String,

    #[arg(long)]
    pub organization: String,

    #[arg(long)]
    pub space: String,

    /// Platform username.
    #[arg(long)]
    pub username: String,

    /// Platform password.
    #[arg(long, env = "JUMPTUNNEL_GATLING_PASSWORD", hide_env_values = true)]
    pub password: String,

    #[arg(long)]
    pub users: Option<u32>,

    #[arg(long)]
    pub users_at_once: Option<u32>,

    /// Seconds over which users are started.
    #[arg(long)]
    pub ramp: Option<u32>,

    #[arg(long)]
    pub duration: Option<u32>,

    #[arg(long)]
    pub repeat: Option<u32>,

    /// Proxy host (overrides gatling.proxy).
    #[arg(long)]
    pub proxy: Option<String>,

    #[arg(long)]
    pub proxy_http_port: Option<u16>,

    #[arg(long)]
    pub proxy_https_port: Option<u16>,

    /// Print the result as JSON instead of a summary.
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a config file with default values.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration (file plus environment).
    Show,
}
