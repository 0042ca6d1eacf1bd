use russh::client;
use russh::keys::PublicKey;
use tracing::debug;

/// russh event handler for jumptunnel sessions.
///
/// Host keys are accepted without verification: jump and load-test hosts
/// are short-lived and their keys are not known in advance.
#[derive(Debug, Default)]
pub struct SessionHandler {
    target: String,
}

impl SessionHandler {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl client::Handler for SessionHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            host = %self.target,
            algorithm = server_public_key.algorithm().as_str(),
            "accepting server host key"
        );
        Ok(true)
    }
}
