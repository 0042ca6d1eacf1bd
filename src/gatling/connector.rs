use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::model::GatlingSettings;
use crate::ssh::error::CommandError;
use crate::ssh::session::{FileTransfer, SshSession};

use super::parameters::RunParameters;
use super::{GatlingError, SimulationHost};

const RESULTS_DIR: &str = "results";
const LOG_FILE: &str = "simulation.log";
const RESULT_FILE: &str = "js/global_stats.json";

/// Time for the java process to create its execution directory.
const WAIT_AFTER_SIMULATION_START: Duration = Duration::from_secs(2);

/// SSH connection to the load-test host.
///
/// All remote paths are relative to the simulation repository directory in
/// the login directory of the configured user.
#[derive(Debug)]
pub struct GatlingConnector {
    session: SshSession,
    settings: GatlingSettings,
}

impl GatlingConnector {
    /// Connect and create the repository layout the simulation jar expects.
    pub async fn connect(settings: &GatlingSettings) -> Result<Self, GatlingError> {
        let host = settings
            .host
            .as_deref()
            .ok_or(GatlingError::MissingSetting("gatling.host"))?;
        let username = settings
            .username
            .as_deref()
            .ok_or(GatlingError::MissingSetting("gatling.username"))?;
        let key_path = settings
            .key_path
            .as_deref()
            .ok_or(GatlingError::MissingSetting("gatling.key_path"))?;
        let key_path = shellexpand::tilde(key_path).to_string();

        let session = SshSession::connect(
            host,
            settings.port,
            username,
            Path::new(&key_path),
            settings.connect_timeout(),
        )
        .await?;

        let connector = Self {
            session,
            settings: settings.clone(),
        };
        connector.prepare_root_directory().await?;
        Ok(connector)
    }

    pub async fn close(self) -> Result<(), GatlingError> {
        Ok(self.session.close().await?)
    }

    fn repo(&self) -> &str {
        &self.settings.repo_name
    }

    async fn prepare_root_directory(&self) -> Result<(), GatlingError> {
        for dir in [
            format!("{}/target/test-classes", self.repo()),
            format!("{}/{RESULTS_DIR}", self.repo()),
        ] {
            self.run(&format!("mkdir -p {dir}")).await?;
        }
        Ok(())
    }

    /// SFTP channel inside the repository directory.
    async fn open_repo(&self) -> Result<FileTransfer, GatlingError> {
        let mut transfer = self.session.sftp().await?;
        transfer.chdir(self.repo()).await?;
        Ok(transfer)
    }

    async fn run(&self, command: &str) -> Result<Vec<String>, GatlingError> {
        let output = self.session.exec(command).await?;
        if !output.success() {
            return Err(CommandError::Failed {
                command: command.to_string(),
                status: format!("exit status: {}", output.exit_code),
                output: output.stderr,
            }
            .into());
        }
        Ok(output.lines())
    }

    /// Upload the package jar unless the host already has it.
    async fn prepare_package(&self, transfer: &FileTransfer) -> Result<(), GatlingError> {
        let name = self.settings.package_file_name();
        if transfer.size(&name).await? == 0 {
            info!(package = %name, "uploading package");
            transfer
                .put(&self.settings.package_file_path(), &name)
                .await?;
        }
        Ok(())
    }

    async fn file_size(&self, path: &str) -> Result<u64, GatlingError> {
        let transfer = self.open_repo().await?;
        let size = transfer.size(path).await;
        transfer.close().await;
        Ok(size?)
    }
}

impl SimulationHost for GatlingConnector {
    async fn start_simulation(&mut self, parameters: &RunParameters) -> Result<String, GatlingError> {
        let mut transfer = self.open_repo().await?;
        self.prepare_package(&transfer).await?;

        transfer.chdir(RESULTS_DIR).await?;
        let before = transfer.listdir(".").await?;

        let command = format!(
            "cd {}; {}",
            self.repo(),
            simulation_command(parameters, &self.settings)
        );
        info!(simulation = parameters.simulation(), "executing simulation command");
        self.run(&command).await?;

        tokio::time::sleep(WAIT_AFTER_SIMULATION_START).await;
        let after = transfer.listdir(".").await?;
        transfer.close().await;

        let directory = new_directory(&before, &after).ok_or(GatlingError::NoExecutionDirectory)?;
        info!(directory = %directory, "execution directory");
        Ok(directory)
    }

    async fn log_size(&mut self, parameters: &RunParameters) -> Result<u64, GatlingError> {
        self.file_size(&simulation_path(parameters, LOG_FILE)?).await
    }

    async fn results_ready(&mut self, parameters: &RunParameters) -> Result<bool, GatlingError> {
        Ok(self.file_size(&simulation_path(parameters, RESULT_FILE)?).await? > 0)
    }

    async fn results(&mut self, parameters: &RunParameters) -> Result<String, GatlingError> {
        let transfer = self.open_repo().await?;
        let contents = transfer
            .read_to_string(&simulation_path(parameters, RESULT_FILE)?)
            .await;
        transfer.close().await;
        Ok(contents?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `results/<execution directory>/<file>`
fn simulation_path(parameters: &RunParameters, file: &str) -> Result<String, GatlingError> {
    let directory = parameters
        .execution_directory()
        .ok_or(GatlingError::NotStarted)?;
    Ok(format!("{RESULTS_DIR}/{directory}/{file}"))
}

/// Background java invocation with output redirected to the run's log file.
pub fn simulation_command(parameters: &RunParameters, settings: &GatlingSettings) -> String {
    let mut parts = vec!["java".to_string()];
    parts.extend(
        parameters
            .system_properties(settings)
            .into_iter()
            .map(|(name, value)| format!("-D{name}={}", shell_quote(&value))),
    );
    parts.extend([
        "-jar".to_string(),
        settings.package_file_name(),
        ">".to_string(),
        parameters.log_file(),
        "2>&1".to_string(),
        "&".to_string(),
    ]);
    let command = parts.join(" ");
    debug!(
        simulation = parameters.simulation(),
        "built simulation command"
    );
    command
}

/// First entry (in sorted order) present in `after` but not in `before`.
pub fn new_directory(before: &[String], after: &[String]) -> Option<String> {
    let before: HashSet<&String> = before.iter().collect();
    let mut added: Vec<&String> = after.iter().filter(|d| !before.contains(d)).collect();
    added.sort();
    added.first().map(|d| d.to_string())
}

fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        "''".into()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_directory() {
        let before = strings(&["a-1", "b-2"]);
        let after = strings(&["b-2", "c-3", "a-1"]);
        assert_eq!(new_directory(&before, &after).as_deref(), Some("c-3"));
        assert_eq!(new_directory(&before, &before), None);
        assert_eq!(
            new_directory(&[], &strings(&["z", "y"])).as_deref(),
            Some("y")
        );
    }

    #[test]
    fn test_simulation_command() {
        let mut params =
            RunParameters::new("ApiSimulation", "example.com", "org", "my space", "admin", "p'w")
                .unwrap();
        params.users = Some(5);
        let settings = GatlingSettings::default();

        let command = simulation_command(&params, &settings);
        assert!(command.starts_with("java -Dsimulation='ApiSimulation' -Dplatform='example.com'"));
        assert!(command.contains("-Dspace='my space'"));
        assert!(command.contains("-Dpassword='p'\\''w'"));
        assert!(command.contains("-Dusers='5'"));
        assert!(!command.contains("-Dproxy"));
        assert!(command.ends_with(&format!(
            "-jar gatling-simulations-latest.jar > {} 2>&1 &",
            params.log_file()
        )));
    }

    #[test]
    fn test_simulation_path_requires_start() {
        let mut params =
            RunParameters::new("ApiSimulation", "example.com", "org", "space", "admin", "secret")
                .unwrap();
        assert!(matches!(
            simulation_path(&params, LOG_FILE),
            Err(GatlingError::NotStarted)
        ));

        params.set_execution_directory("apisimulation-1").unwrap();
        assert_eq!(
            simulation_path(&params, RESULT_FILE).unwrap(),
            "results/apisimulation-1/js/global_stats.json"
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
    }

    #[tokio::test]
    async fn test_connect_requires_host() {
        let err = GatlingConnector::connect(&GatlingSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatlingError::MissingSetting("gatling.host")));
    }
}
