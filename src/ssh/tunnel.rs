use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::model::JumpSettings;

use super::command_line;
use super::endpoint::{JumpClient, TunnelEndpoint};
use super::error::TunnelError;
use super::nested::NestedTunnel;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Address probed for local proxy readiness.
pub const READINESS_HOST: &str = "127.0.0.1";

/// How long `close` waits for a killed tunnel process to be reaped.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Dynamic forward flag; also used to find the port in remote commands.
pub const DYNAMIC_FORWARD_FLAG: &str = "-D";

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Local port probe: connection refused is retried, anything else fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: crate::config::model::DEFAULT_READINESS_ATTEMPTS,
            interval: Duration::from_secs(crate::config::model::DEFAULT_READINESS_INTERVAL_SECS),
        }
    }
}

impl ReadinessPolicy {
    pub fn from_settings(settings: &JumpSettings) -> Self {
        Self {
            attempts: settings.readiness_attempts,
            interval: settings.readiness_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// Local process
// ---------------------------------------------------------------------------

/// A locally spawned tunnel process. Killed when dropped.
#[derive(Debug)]
pub struct LocalProcess {
    child: Child,
}

impl LocalProcess {
    /// Spawn `command` directly, without a shell.
    pub fn spawn(command: &[String]) -> Result<Self, TunnelError> {
        let (program, args) = command.split_first().ok_or_else(|| TunnelError::Spawn {
            program: String::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty tunnel command"),
        })?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                program: program.clone(),
                source,
            })?;

        debug!(pid = child.id(), program = %program, "spawned tunnel process");
        Ok(Self { child })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Poll `port` until it accepts a connection.
    ///
    /// Only `ConnectionRefused` is retried. The process exiting while the
    /// port is still closed ends the wait early.
    pub async fn wait_ready(&mut self, port: u16, policy: ReadinessPolicy) -> Result<(), TunnelError> {
        let mut last_refusal = None;

        for attempt in 1..=policy.attempts {
            match TcpStream::connect((READINESS_HOST, port)).await {
                Ok(_) => {
                    debug!(port, attempt, "local proxy port accepts connections");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    if let Ok(Some(status)) = self.child.try_wait() {
                        return Err(TunnelError::ProcessExited {
                            port,
                            status: status.to_string(),
                        });
                    }
                    debug!(port, attempt, error = %e, "local proxy port not ready yet");
                    last_refusal = Some(e);
                    if attempt < policy.attempts {
                        tokio::time::sleep(policy.interval).await;
                    }
                }
                Err(e) => {
                    return Err(TunnelError::Readiness {
                        port,
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }

        Err(TunnelError::Readiness {
            port,
            attempts: policy.attempts,
            source: last_refusal.unwrap_or_else(|| io::Error::from(io::ErrorKind::TimedOut)),
        })
    }

    /// Kill the process and reap it. Never fails: the process may already
    /// be gone.
    pub async fn terminate(mut self) {
        let pid = self.child.id();
        if let Err(e) = self.child.start_kill() {
            debug!(?pid, error = %e, "tunnel process already gone");
        }
        match tokio::time::timeout(CLOSE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(?pid, %status, "tunnel process stopped"),
            Ok(Err(e)) => debug!(?pid, error = %e, "failed to reap tunnel process"),
            Err(_) => warn!(?pid, "tunnel process did not exit after kill"),
        }
    }
}

// ---------------------------------------------------------------------------
// SimpleTunnel
// ---------------------------------------------------------------------------

/// Single-hop SOCKS proxy: `ssh ... -D <local_port> -N` against the jump host.
#[derive(Debug)]
pub struct SimpleTunnel<E = JumpClient> {
    endpoint: Arc<E>,
    local_port: u16,
    readiness: ReadinessPolicy,
    process: Option<LocalProcess>,
}

impl<E: TunnelEndpoint> SimpleTunnel<E> {
    /// Build a closed tunnel. No I/O happens until `open`.
    pub fn new(endpoint: Arc<E>, local_port: u16) -> Self {
        Self {
            endpoint,
            local_port,
            readiness: ReadinessPolicy::default(),
            process: None,
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn endpoint(&self) -> &Arc<E> {
        &self.endpoint
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn is_open(&self) -> bool {
        self.process.is_some()
    }

    /// Pid of the local tunnel process while open.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(LocalProcess::id)
    }

    /// `ssh_command + ["-D", <local_port>, "-N"]`
    pub fn tunnel_command(&self) -> Vec<String> {
        let mut command = self.endpoint.ssh_command();
        command.push(DYNAMIC_FORWARD_FLAG.into());
        command.push(self.local_port.to_string());
        command.push("-N".into());
        command
    }

    /// Start the proxy and wait until the local port accepts connections.
    /// On failure nothing is left running and the tunnel stays closed.
    pub async fn open(&mut self) -> Result<(), TunnelError> {
        if self.is_open() {
            return Err(TunnelError::AlreadyOpen);
        }
        let command = self.tunnel_command();
        self.launch(command).await
    }

    /// Stop the local process. Errors only when the tunnel is not open.
    pub async fn close(&mut self) -> Result<(), TunnelError> {
        let process = self.process.take().ok_or(TunnelError::NotOpen)?;
        info!(port = self.local_port, "closing local tunnel");
        process.terminate().await;
        Ok(())
    }

    /// Spawn `command` and wait for readiness; shared with the nested tunnel.
    pub(crate) async fn launch(&mut self, command: Vec<String>) -> Result<(), TunnelError> {
        info!(
            port = self.local_port,
            command = %command_line(&command),
            "opening tunnel"
        );

        let mut process = LocalProcess::spawn(&command)?;

        match process.wait_ready(self.local_port, self.readiness).await {
            Ok(()) => {
                info!(port = self.local_port, "tunnel ready");
                self.process = Some(process);
                Ok(())
            }
            Err(e) => {
                warn!(port = self.local_port, error = %e, "tunnel failed to open, closing it");
                process.terminate().await;
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tunnel
// ---------------------------------------------------------------------------

/// The two tunnel flavours behind one open/close contract.
#[derive(Debug)]
pub enum Tunnel<E = JumpClient> {
    Simple(SimpleTunnel<E>),
    Nested(NestedTunnel<E>),
}

impl<E: TunnelEndpoint> Tunnel<E> {
    /// Pick the tunnel kind from configuration: a single hop when the jump
    /// host reaches the target network itself, two hops otherwise.
    pub fn from_settings(endpoint: Arc<E>, settings: &JumpSettings) -> Self {
        let readiness = ReadinessPolicy::from_settings(settings);
        if settings.direct_access {
            Tunnel::Simple(SimpleTunnel::new(endpoint, settings.socks_port).with_readiness(readiness))
        } else {
            Tunnel::Nested(
                NestedTunnel::new(endpoint, settings.socks_port, settings.master_host.clone())
                    .with_port_window(settings.remote_port_base, settings.remote_port_window)
                    .with_readiness(readiness),
            )
        }
    }

    pub async fn open(&mut self) -> Result<(), TunnelError> {
        match self {
            Tunnel::Simple(t) => t.open().await,
            Tunnel::Nested(t) => t.open().await,
        }
    }

    pub async fn close(&mut self) -> Result<(), TunnelError> {
        match self {
            Tunnel::Simple(t) => t.close().await,
            Tunnel::Nested(t) => t.close().await,
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Tunnel::Simple(t) => t.is_open(),
            Tunnel::Nested(t) => t.is_open(),
        }
    }

    pub fn local_port(&self) -> u16 {
        match self {
            Tunnel::Simple(t) => t.local_port(),
            Tunnel::Nested(t) => t.local_port(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Tunnel::Simple(_) => "simple",
            Tunnel::Nested(_) => "nested",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
