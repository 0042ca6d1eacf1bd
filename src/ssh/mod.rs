pub mod client;
pub mod endpoint;
pub mod error;
pub mod nested;
pub mod process;
pub mod session;
pub mod tunnel;

use std::path::Path;
use std::sync::Arc;

use self::error::CommandError;

pub use self::endpoint::{JumpClient, TunnelEndpoint};
pub use self::nested::NestedTunnel;
pub use self::process::{RemoteProcess, RemoteProcessList};
pub use self::tunnel::{ReadinessPolicy, SimpleTunnel, Tunnel};

/// A host reachable over SSH: run commands and push files.
pub trait RemoteHost {
    /// Run `command` on the host and return its standard output, one entry
    /// per line.
    fn execute(
        &self,
        command: &[String],
    ) -> impl Future<Output = Result<Vec<String>, CommandError>> + Send;

    /// Copy a local file to `remote` on the host.
    fn upload(
        &self,
        local: &Path,
        remote: &str,
    ) -> impl Future<Output = Result<(), CommandError>> + Send;

    /// Short label for log lines, e.g. `user@host`.
    fn describe(&self) -> String;
}

impl<T: RemoteHost + Send + Sync> RemoteHost for Arc<T> {
    fn execute(
        &self,
        command: &[String],
    ) -> impl Future<Output = Result<Vec<String>, CommandError>> + Send {
        (**self).execute(command)
    }

    fn upload(
        &self,
        local: &Path,
        remote: &str,
    ) -> impl Future<Output = Result<(), CommandError>> + Send {
        (**self).upload(local, remote)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Join command tokens for display and log output.
pub fn command_line(tokens: &[String]) -> String {
    tokens.join(" ")
}

/// Convert a list of string literals into owned command tokens.
pub fn tokens<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
