use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use tracing::{debug, info, warn};

use super::endpoint::{JumpClient, TunnelEndpoint, auth_options};
use super::error::{PortDiscoveryError, PortParseError, TunnelError};
use super::process::RemoteProcessList;
use super::tunnel::{DYNAMIC_FORWARD_FLAG, ReadinessPolicy, SimpleTunnel};
use super::{RemoteHost, tokens};
use crate::config::model::{DEFAULT_REMOTE_PORT_BASE, DEFAULT_REMOTE_PORT_WINDOW};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const LOCALHOST: &str = "localhost";

/// (jump host, username) pairs whose key is already on the jump host.
static COPIED_KEYS: LazyLock<Mutex<HashSet<(String, String)>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

// ---------------------------------------------------------------------------
// Port helpers
// ---------------------------------------------------------------------------

/// Read the port that follows `-D` in a remote tunnel command.
pub fn port_from_tunnel_command(command: &str) -> Result<u16, PortParseError> {
    let mut parts = command.split_whitespace();
    if !parts.any(|part| part == DYNAMIC_FORWARD_FLAG) {
        return Err(PortParseError::FlagMissing {
            command: command.to_string(),
        });
    }
    parts
        .next()
        .and_then(|port| port.parse::<u16>().ok())
        .ok_or_else(|| PortParseError::InvalidPort {
            command: command.to_string(),
        })
}

/// Lowest port in `[base, base + window)` that is not in `busy`.
pub fn find_free_port(busy: &HashSet<u16>, base: u16, window: u16) -> Option<u16> {
    let end = (u32::from(base) + u32::from(window)).min(u32::from(u16::MAX) + 1);
    (u32::from(base)..end)
        .filter_map(|port| u16::try_from(port).ok())
        .find(|port| !busy.contains(port))
}

fn key_marked_copied(host: &str, user: &str) -> bool {
    COPIED_KEYS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(&(host.to_string(), user.to_string()))
}

fn mark_key_copied(host: &str, user: &str) {
    COPIED_KEYS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert((host.to_string(), user.to_string()));
}

// ---------------------------------------------------------------------------
// NestedTunnel
// ---------------------------------------------------------------------------

/// Two-hop SOCKS proxy for when only the master host reaches the cluster.
///
/// Locally: `ssh <jump> -L p:localhost:p "<remote command>"`. On the jump
/// host the remote command opens a dynamic forward to the master host on a
/// port chosen once per tunnel.
#[derive(Debug)]
pub struct NestedTunnel<E = JumpClient> {
    base: SimpleTunnel<E>,
    master_host: String,
    port_base: u16,
    port_window: u16,
    remote_port: Option<u16>,
}

impl<E: TunnelEndpoint> NestedTunnel<E> {
    pub fn new(endpoint: Arc<E>, local_port: u16, master_host: impl Into<String>) -> Self {
        Self {
            base: SimpleTunnel::new(endpoint, local_port),
            master_host: master_host.into(),
            port_base: DEFAULT_REMOTE_PORT_BASE,
            port_window: DEFAULT_REMOTE_PORT_WINDOW,
            remote_port: None,
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.base = self.base.with_readiness(readiness);
        self
    }

    pub fn with_port_window(mut self, base: u16, window: u16) -> Self {
        self.port_base = base;
        self.port_window = window;
        self
    }

    pub fn local_port(&self) -> u16 {
        self.base.local_port()
    }

    pub fn is_open(&self) -> bool {
        self.base.is_open()
    }

    pub fn master_host(&self) -> &str {
        &self.master_host
    }

    /// Remote port once resolved. Never changes afterwards.
    pub fn remote_port(&self) -> Option<u16> {
        self.remote_port
    }

    /// `ssh <auth options> <master> -N -D ` with the trailing space.
    pub fn remote_command_prefix(&self) -> String {
        format!(
            "ssh {} {} -N {} ",
            auth_options().join(" "),
            self.master_host,
            DYNAMIC_FORWARD_FLAG
        )
    }

    pub fn remote_command(&self, port: u16) -> String {
        format!("{}{}", self.remote_command_prefix(), port)
    }

    pub fn local_forward(&self) -> String {
        let port = self.local_port();
        format!("{port}:{LOCALHOST}:{port}")
    }

    /// Full local command for a resolved remote port.
    pub fn tunnel_command(&self, remote_port: u16) -> Vec<String> {
        let mut command = self.base.endpoint().ssh_command();
        command.extend(tokens(["-L".to_string(), self.local_forward()]));
        command.push(self.remote_command(remote_port));
        command
    }

    /// Pick a port on the jump host not used by another tunnel started
    /// this way. Only the first successful call lists processes.
    ///
    /// Only tunnels with this exact prefix are seen; other listeners on the
    /// jump host are not detected.
    pub async fn resolve_remote_port(&mut self) -> Result<u16, PortDiscoveryError> {
        if let Some(port) = self.remote_port {
            return Ok(port);
        }

        let endpoint = Arc::clone(self.base.endpoint());
        let prefix = self.remote_command_prefix();
        let processes = RemoteProcessList::list(&*endpoint).await?;

        let mut busy = HashSet::new();
        for process in processes.matching(&prefix) {
            let port = port_from_tunnel_command(&process.command)?;
            warn!(port, host = %endpoint.host(), "port on jump host is busy");
            busy.insert(port);
        }

        let port = find_free_port(&busy, self.port_base, self.port_window).ok_or(
            PortDiscoveryError::Exhausted {
                base: self.port_base,
                window: self.port_window,
            },
        )?;

        debug!(port, host = %endpoint.host(), "selected jump host port");
        self.remote_port = Some(port);
        Ok(port)
    }

    /// Put the local key on the jump host so it can reach the master host.
    /// Done once per (host, user) for the whole process.
    async fn ensure_key_copied(&self) -> Result<(), TunnelError> {
        let endpoint = self.base.endpoint();
        let (host, user) = (endpoint.host(), endpoint.username());
        if key_marked_copied(host, user) {
            return Ok(());
        }

        let target = format!("/home/{user}/.ssh/id_rsa");
        info!(host, path = %target, "copying key to jump host");

        endpoint
            .upload(endpoint.key_path(), &target)
            .await
            .map_err(TunnelError::KeyCopy)?;
        endpoint
            .execute(&tokens(["chmod", "600", target.as_str()]))
            .await
            .map_err(TunnelError::KeyCopy)?;

        mark_key_copied(host, user);
        Ok(())
    }

    pub async fn open(&mut self) -> Result<(), TunnelError> {
        if self.is_open() {
            return Err(TunnelError::AlreadyOpen);
        }
        warn!(
            master = %self.master_host,
            "cluster not reachable from the jump host directly, nesting the tunnel"
        );

        let remote_port = self.resolve_remote_port().await?;
        self.ensure_key_copied().await?;

        let command = self.tunnel_command(remote_port);
        if let Err(e) = self.base.launch(command).await {
            // The jump host side may already be running; listing failures
            // are logged by close_remote.
            let _ = self.close_remote(remote_port).await;
            return Err(e);
        }
        Ok(())
    }

    /// Kill the jump host side, then the local process. The local process
    /// is closed even when the jump host cannot be listed.
    pub async fn close(&mut self) -> Result<(), TunnelError> {
        if !self.is_open() {
            return Err(TunnelError::NotOpen);
        }

        let remote = match self.remote_port {
            Some(port) => self.close_remote(port).await,
            None => Ok(()),
        };

        self.base.close().await?;
        remote
    }

    async fn close_remote(&self, port: u16) -> Result<(), TunnelError> {
        let endpoint = self.base.endpoint();
        debug!(host = %endpoint.host(), port, "closing tunnel on jump host");

        let processes = match RemoteProcessList::list(&**endpoint).await {
            Ok(processes) => processes,
            Err(e) => {
                warn!(host = %endpoint.host(), error = %e, "failed to list jump host processes");
                return Err(TunnelError::RemoteCleanup(e));
            }
        };

        let command = self.remote_command(port);
        match processes.find_exact(&command, endpoint.username()) {
            Some(process) => {
                if let Err(e) = process.kill().await {
                    warn!(pid = process.pid, error = %e, "failed to kill jump host tunnel");
                }
            }
            None => warn!(host = %endpoint.host(), "tunnel process does not seem to exist on jump host"),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::ssh::testing::FakeEndpoint;

    const PS_HEADER: &str =
        "USER         PID %CPU %MEM    VSZ   RSS TTY      STAT START   TIME COMMAND";

    fn ps_line(user: &str, pid: u32, command: &str) -> String {
        format!(
            "{user:<8}{pid:>8}  0.0  0.0   1234   567 ?        S    10:00   0:00 {command}"
        )
    }

    fn fast() -> ReadinessPolicy {
        ReadinessPolicy {
            attempts: 3,
            interval: Duration::from_millis(20),
        }
    }

    fn nested(endpoint: &Arc<FakeEndpoint>, port: u16) -> NestedTunnel<FakeEndpoint> {
        NestedTunnel::new(Arc::clone(endpoint), port, "master-0").with_readiness(fast())
    }

    fn push_listing(endpoint: &FakeEndpoint, lines: &[String]) {
        let mut output = vec![PS_HEADER.to_string()];
        output.extend(lines.iter().cloned());
        let refs: Vec<&str> = output.iter().map(String::as_str).collect();
        endpoint.push_output(&refs);
    }

    #[test]
    fn test_port_from_tunnel_command() {
        assert_eq!(port_from_tunnel_command("ssh -D 12345 -N"), Ok(12345));
        assert_eq!(
            port_from_tunnel_command("ssh -D abc -N"),
            Err(PortParseError::InvalidPort {
                command: "ssh -D abc -N".into()
            })
        );
        assert_eq!(
            port_from_tunnel_command("ssh -D"),
            Err(PortParseError::InvalidPort {
                command: "ssh -D".into()
            })
        );
        assert_eq!(
            port_from_tunnel_command("ssh -N host"),
            Err(PortParseError::FlagMissing {
                command: "ssh -N host".into()
            })
        );
    }

    #[test]
    fn test_find_free_port_takes_first_gap() {
        let busy: HashSet<u16> = [5559, 5556, 5555, 5557].into_iter().collect();
        assert_eq!(find_free_port(&busy, 5555, 100), Some(5558));
        assert_eq!(find_free_port(&HashSet::new(), 5555, 100), Some(5555));
    }

    #[test]
    fn test_find_free_port_exhausted() {
        let busy: HashSet<u16> = (5555..5558).collect();
        assert_eq!(find_free_port(&busy, 5555, 3), None);
        assert_eq!(find_free_port(&HashSet::new(), u16::MAX, 10), Some(u16::MAX));
    }

    #[test]
    fn test_command_layout() {
        let endpoint = Arc::new(FakeEndpoint::new("jump", "centos"));
        let tunnel = nested(&endpoint, 5555);

        assert_eq!(
            tunnel.remote_command_prefix(),
            "ssh -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no \
             -o GSSAPIAuthentication=no master-0 -N -D "
        );

        let command = tunnel.tunnel_command(5557);
        let n = command.len();
        assert_eq!(command[n - 4], "centos@jump");
        assert_eq!(command[n - 3], "-L");
        assert_eq!(command[n - 2], "5555:localhost:5555");
        assert!(command[n - 1].ends_with("master-0 -N -D 5557"));
    }

    #[tokio::test]
    async fn test_remote_port_skips_busy_tunnels() {
        let endpoint = Arc::new(FakeEndpoint::new("jump", "centos"));
        let mut tunnel = nested(&endpoint, 5555);
        let busy = tunnel.remote_command(5555);
        push_listing(
            &endpoint,
            &[
                ps_line("centos", 100, &busy),
                ps_line("root", 1, "/sbin/init"),
            ],
        );

        assert_eq!(tunnel.resolve_remote_port().await.unwrap(), 5556);
        assert_eq!(endpoint.executed(), vec![tokens(["ps", "aux"])]);
    }

    #[tokio::test]
    async fn test_remote_port_is_resolved_once() {
        let endpoint = Arc::new(FakeEndpoint::new("jump", "centos"));
        let mut tunnel = nested(&endpoint, 5555);
        push_listing(&endpoint, &[]);
        let first = tunnel.resolve_remote_port().await.unwrap();

        push_listing(&endpoint, &[ps_line("centos", 100, &tunnel.remote_command(first))]);
        let second = tunnel.resolve_remote_port().await.unwrap();

        assert_eq!(first, 5555);
        assert_eq!(second, first);
        assert_eq!(endpoint.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_port_unparseable_tunnel() {
        let endpoint = Arc::new(FakeEndpoint::new("jump", "centos"));
        let mut tunnel = nested(&endpoint, 5555);
        let broken = format!("{}abc", tunnel.remote_command_prefix());
        push_listing(&endpoint, &[ps_line("centos", 100, &broken)]);

        let err = tunnel.resolve_remote_port().await.unwrap_err();
        assert!(matches!(
            err,
            PortDiscoveryError::Unparseable(PortParseError::InvalidPort { .. })
        ));
        assert_eq!(tunnel.remote_port(), None);
    }

    #[tokio::test]
    async fn test_remote_port_window_exhausted() {
        let endpoint = Arc::new(FakeEndpoint::new("jump", "centos"));
        let mut tunnel = nested(&endpoint, 5555).with_port_window(6000, 1);
        push_listing(&endpoint, &[ps_line("centos", 100, &tunnel.remote_command(6000))]);

        let err = tunnel.resolve_remote_port().await.unwrap_err();
        assert!(matches!(
            err,
            PortDiscoveryError::Exhausted {
                base: 6000,
                window: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_key_copied_once_per_host_and_user() {
        let endpoint = Arc::new(FakeEndpoint::new("key-copy-jump", "centos"));
        let tunnel = nested(&endpoint, 5555);

        tunnel.ensure_key_copied().await.unwrap();
        tunnel.ensure_key_copied().await.unwrap();
        nested(&endpoint, 5600).ensure_key_copied().await.unwrap();

        let uploads = endpoint.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].1, "/home/centos/.ssh/id_rsa");
        assert_eq!(
            endpoint.executed(),
            vec![tokens(["chmod", "600", "/home/centos/.ssh/id_rsa"])]
        );
    }

    #[tokio::test]
    async fn test_failed_chmod_leaves_key_unmarked() {
        let endpoint = Arc::new(FakeEndpoint::new("key-chmod-jump", "centos"));
        let tunnel = nested(&endpoint, 5555);
        endpoint.push_failure("chmod: permission denied");

        let err = tunnel.ensure_key_copied().await.unwrap_err();
        assert!(matches!(err, TunnelError::KeyCopy(_)));

        tunnel.ensure_key_copied().await.unwrap();
        assert_eq!(endpoint.uploads().len(), 2);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_tunnel_closed() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut fake = FakeEndpoint::new("open-fail-jump", "centos");
        fake.ssh_program = "false".into();
        let endpoint = Arc::new(fake);
        let mut tunnel = nested(&endpoint, port);
        push_listing(&endpoint, &[]);

        assert!(tunnel.open().await.is_err());
        assert!(!tunnel.is_open());
        assert!(matches!(tunnel.close().await, Err(TunnelError::NotOpen)));
    }

    #[tokio::test]
    async fn test_failed_open_kills_remote_tunnel() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut fake = FakeEndpoint::new("open-rollback-jump", "centos");
        fake.ssh_program = "false".into();
        let endpoint = Arc::new(fake);
        let mut tunnel = nested(&endpoint, port);

        push_listing(&endpoint, &[]);
        endpoint.push_output(&[]);
        let remote = tunnel.remote_command(5555);
        push_listing(&endpoint, &[ps_line("centos", 77, &remote)]);

        assert!(tunnel.open().await.is_err());
        assert!(!tunnel.is_open());
        let executed = endpoint.executed();
        assert_eq!(executed.last().unwrap(), &tokens(["kill", "77"]));
        assert_eq!(
            executed
                .iter()
                .filter(|command| command == &&tokens(["ps", "aux"]))
                .count(),
            2
        );
    }

    #[test]
    fn test_key_registry_survives_poisoning() {
        let _ = std::thread::spawn(|| {
            let _guard = COPIED_KEYS.lock().unwrap();
            panic!("poison the registry");
        })
        .join();

        mark_key_copied("poisoned-jump", "centos");
        assert!(key_marked_copied("poisoned-jump", "centos"));
        assert!(!key_marked_copied("poisoned-jump", "root"));
    }

    #[tokio::test]
    async fn test_open_then_close_kills_remote_tunnel() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut fake = FakeEndpoint::new("open-close-jump", "centos");
        fake.ssh_program = "sleep".into();
        let endpoint = Arc::new(fake);
        let mut tunnel = nested(&endpoint, port);

        push_listing(&endpoint, &[]);
        tunnel.open().await.unwrap();
        assert!(tunnel.is_open());
        assert_eq!(tunnel.remote_port(), Some(5555));

        let remote = tunnel.remote_command(5555);
        push_listing(
            &endpoint,
            &[
                ps_line("other", 41, &remote),
                ps_line("centos", 42, &remote),
            ],
        );
        tunnel.close().await.unwrap();

        assert!(!tunnel.is_open());
        let executed = endpoint.executed();
        assert_eq!(executed.last().unwrap(), &tokens(["kill", "42"]));
    }

    #[tokio::test]
    async fn test_close_without_remote_match_still_closes() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut fake = FakeEndpoint::new("close-missing-jump", "centos");
        fake.ssh_program = "sleep".into();
        let endpoint = Arc::new(fake);
        let mut tunnel = nested(&endpoint, port);

        push_listing(&endpoint, &[]);
        tunnel.open().await.unwrap();
        push_listing(&endpoint, &[ps_line("root", 1, "/sbin/init")]);

        tunnel.close().await.unwrap();
        assert!(!tunnel.is_open());
        assert!(!endpoint
            .executed()
            .iter()
            .any(|command| command.first().map(String::as_str) == Some("kill")));
    }

    #[tokio::test]
    async fn test_close_with_listing_failure_reports_cleanup() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut fake = FakeEndpoint::new("close-fail-jump", "centos");
        fake.ssh_program = "sleep".into();
        let endpoint = Arc::new(fake);
        let mut tunnel = nested(&endpoint, port);

        push_listing(&endpoint, &[]);
        tunnel.open().await.unwrap();
        endpoint.push_failure("connection reset");

        let err = tunnel.close().await.unwrap_err();
        assert!(matches!(err, TunnelError::RemoteCleanup(_)));
        assert!(!tunnel.is_open());
    }
}
