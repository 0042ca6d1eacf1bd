pub mod connector;
pub mod parameters;
pub mod result;

use std::io;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::model::GatlingSettings;
use crate::ssh::error::{CommandError, SessionError};

pub use self::connector::GatlingConnector;
pub use self::parameters::{ParameterError, RunParameters};
pub use self::result::SimulationResult;

#[derive(Debug, Error)]
pub enum GatlingError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("missing gatling setting: {0}")]
    MissingSetting(&'static str),

    #[error("failed to download package from {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("package I/O error on {}: {source}", path.display())]
    PackageIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("simulation did not create an execution directory")]
    NoExecutionDirectory,

    #[error("simulation has not been started")]
    NotStarted,

    #[error("simulation log stopped growing, execution log file: {log_file}")]
    Stalled { log_file: String },

    #[error("provided json is not valid: {0}")]
    InvalidResults(#[from] serde_json::Error),

    #[error(transparent)]
    Parameters(#[from] ParameterError),
}

/// The remote side of a simulation run.
pub trait SimulationHost {
    /// Start the simulation in the background; returns its execution directory.
    fn start_simulation(
        &mut self,
        parameters: &RunParameters,
    ) -> impl Future<Output = Result<String, GatlingError>> + Send;

    /// Current size of the simulation log in bytes.
    fn log_size(
        &mut self,
        parameters: &RunParameters,
    ) -> impl Future<Output = Result<u64, GatlingError>> + Send;

    fn results_ready(
        &mut self,
        parameters: &RunParameters,
    ) -> impl Future<Output = Result<bool, GatlingError>> + Send;

    /// Raw results json.
    fn results(
        &mut self,
        parameters: &RunParameters,
    ) -> impl Future<Output = Result<String, GatlingError>> + Send;
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Runs one simulation end to end: package, start, wait, decode.
pub struct GatlingRunner<H> {
    host: H,
    settings: GatlingSettings,
    parameters: RunParameters,
}

impl<H: SimulationHost> GatlingRunner<H> {
    pub fn new(host: H, settings: GatlingSettings, parameters: RunParameters) -> Self {
        Self {
            host,
            settings,
            parameters,
        }
    }

    pub fn parameters(&self) -> &RunParameters {
        &self.parameters
    }

    pub fn into_host(self) -> H {
        self.host
    }

    pub async fn run(&mut self) -> Result<SimulationResult, GatlingError> {
        ensure_package(&self.settings).await?;

        info!(simulation = self.parameters.simulation(), "starting simulation");
        let directory = self.host.start_simulation(&self.parameters).await?;
        self.parameters.set_execution_directory(directory)?;
        info!(
            directory = self.parameters.execution_directory().unwrap_or_default(),
            "simulation started"
        );

        self.wait_for_results().await?;

        let json = self.host.results(&self.parameters).await?;
        Ok(SimulationResult::from_json(&json)?)
    }

    /// Poll until results exist. Fails once the log has not grown for more
    /// than the configured number of consecutive checks.
    async fn wait_for_results(&mut self) -> Result<(), GatlingError> {
        let mut log_size = 0;
        let mut trials_without_log_change = 0;

        while !self.host.results_ready(&self.parameters).await? {
            let current = self.host.log_size(&self.parameters).await?;
            if current > log_size {
                trials_without_log_change = 0;
            } else {
                trials_without_log_change += 1;
            }
            if trials_without_log_change > self.settings.trials_without_log_change {
                return Err(GatlingError::Stalled {
                    log_file: self.parameters.log_file(),
                });
            }
            log_size = current;
            info!(log_size = current, "waiting for results");
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Package
// ---------------------------------------------------------------------------

/// Download the simulation jar unless it is already cached locally.
pub async fn ensure_package(settings: &GatlingSettings) -> Result<PathBuf, GatlingError> {
    let path = settings.package_file_path();
    if path.is_file() {
        debug!(path = %path.display(), "using cached package");
        return Ok(path);
    }

    let url = settings
        .package_url()
        .ok_or(GatlingError::MissingSetting("gatling.repo_url"))?;
    info!(url = %url, "downloading package");
    download(&url, &path).await?;
    Ok(path)
}

async fn download(url: &str, path: &Path) -> Result<(), GatlingError> {
    let io_error = |source: io::Error| GatlingError::PackageIo {
        path: path.to_path_buf(),
        source,
    };
    let http_error = |source: reqwest::Error| GatlingError::Download {
        url: url.to_string(),
        source,
    };

    let dir = path.parent().unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(dir).await.map_err(io_error)?;

    let response = reqwest::get(url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(http_error)?;

    // Write to a temp file in the same directory, then rename into place.
    let tmp = tempfile::Builder::new()
        .prefix(".jumptunnel-package-")
        .tempfile_in(dir)
        .map_err(io_error)?;
    let mut file = tokio::fs::File::from_std(tmp.reopen().map_err(io_error)?);

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(http_error)?;
        file.write_all(&chunk).await.map_err(io_error)?;
    }
    file.flush().await.map_err(io_error)?;
    drop(file);

    tmp.persist(path).map_err(|e| io_error(e.error))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::*;

    const GLOBAL_STATS: &str = include_str!("../../tests/fixtures/global_stats.json");

    /// Scripted host: answers `results_ready` and `log_size` from queues.
    #[derive(Default)]
    struct ScriptedHost {
        ready: VecDeque<bool>,
        log_sizes: VecDeque<u64>,
        results: String,
        started: u32,
    }

    impl SimulationHost for ScriptedHost {
        async fn start_simulation(&mut self, _: &RunParameters) -> Result<String, GatlingError> {
            self.started += 1;
            Ok("apisimulation-1700000000".into())
        }

        async fn log_size(&mut self, _: &RunParameters) -> Result<u64, GatlingError> {
            Ok(self.log_sizes.pop_front().unwrap_or(0))
        }

        async fn results_ready(&mut self, _: &RunParameters) -> Result<bool, GatlingError> {
            Ok(self.ready.pop_front().unwrap_or(false))
        }

        async fn results(&mut self, parameters: &RunParameters) -> Result<String, GatlingError> {
            parameters.execution_directory().ok_or(GatlingError::NotStarted)?;
            Ok(self.results.clone())
        }
    }

    /// Settings with a pre-cached package so no download happens.
    fn settings(dir: &Path) -> GatlingSettings {
        let settings = GatlingSettings {
            download_directory: Some(dir.display().to_string()),
            poll_interval_secs: 0,
            trials_without_log_change: 1,
            ..GatlingSettings::default()
        };
        std::fs::write(settings.package_file_path(), b"jar").unwrap();
        settings
    }

    fn params() -> RunParameters {
        RunParameters::new("ApiSimulation", "example.com", "org", "space", "admin", "secret")
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_returns_results() {
        let dir = tempfile::tempdir().unwrap();
        let host = ScriptedHost {
            ready: VecDeque::from([false, false, true]),
            log_sizes: VecDeque::from([10, 20]),
            results: GLOBAL_STATS.into(),
            ..ScriptedHost::default()
        };
        let mut runner = GatlingRunner::new(host, settings(dir.path()), params());

        let result = runner.run().await.unwrap();
        assert_eq!(result.number_of_requests.total, 13.0);
        assert_eq!(
            runner.parameters().execution_directory(),
            Some("apisimulation-1700000000")
        );
        assert_eq!(runner.into_host().started, 1);
    }

    #[tokio::test]
    async fn test_run_stalls_when_log_does_not_grow() {
        let dir = tempfile::tempdir().unwrap();
        let host = ScriptedHost {
            log_sizes: VecDeque::from([10, 10, 10]),
            ..ScriptedHost::default()
        };
        let mut runner = GatlingRunner::new(host, settings(dir.path()), params());

        let err = runner.run().await.unwrap_err();
        match err {
            GatlingError::Stalled { log_file } => {
                assert!(log_file.starts_with("ApiSimulation_"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_growing_log_resets_trials() {
        let dir = tempfile::tempdir().unwrap();
        // 10 (grew), 10 (1 trial), 20 (grew), 20 (1 trial), ready.
        let host = ScriptedHost {
            ready: VecDeque::from([false, false, false, false, true]),
            log_sizes: VecDeque::from([10, 10, 20, 20]),
            results: GLOBAL_STATS.into(),
            ..ScriptedHost::default()
        };
        let mut runner = GatlingRunner::new(host, settings(dir.path()), params());

        assert!(runner.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_results_json() {
        let dir = tempfile::tempdir().unwrap();
        let host = ScriptedHost {
            ready: VecDeque::from([true]),
            results: "{}".into(),
            ..ScriptedHost::default()
        };
        let mut runner = GatlingRunner::new(host, settings(dir.path()), params());

        assert!(matches!(
            runner.run().await,
            Err(GatlingError::InvalidResults(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_package_without_repo_url() {
        let dir = tempfile::tempdir().unwrap();
        let settings = GatlingSettings {
            download_directory: Some(dir.path().display().to_string()),
            ..GatlingSettings::default()
        };

        let err = ensure_package(&settings).await.unwrap_err();
        assert!(matches!(err, GatlingError::MissingSetting("gatling.repo_url")));
    }

    #[tokio::test]
    async fn test_download_failure_names_url() {
        let dir = tempfile::tempdir().unwrap();
        let settings = GatlingSettings {
            download_directory: Some(dir.path().display().to_string()),
            repo_url: Some("http://127.0.0.1:1/repo/".into()),
            ..GatlingSettings::default()
        };

        let result = tokio::time::timeout(Duration::from_secs(10), ensure_package(&settings))
            .await
            .unwrap();
        match result {
            Err(GatlingError::Download { url, .. }) => {
                assert!(url.ends_with("gatling-simulations-latest.jar"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!settings.package_file_path().exists());
    }
}
