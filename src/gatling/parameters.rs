use chrono::Utc;
use thiserror::Error;

use crate::config::model::GatlingSettings;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParameterError {
    #[error("property '{0}' can not be empty")]
    Empty(&'static str),
}

fn required(name: &'static str, value: impl Into<String>) -> Result<String, ParameterError> {
    let value = value.into();
    if value.trim().is_empty() {
        return Err(ParameterError::Empty(name));
    }
    Ok(value)
}

/// Inputs of one simulation run.
///
/// The platform fields are required; the load profile is passed to the
/// simulation only when set. Proxy values fall back to configuration.
#[derive(Debug, Clone)]
pub struct RunParameters {
    simulation: String,
    platform: String,
    organization: String,
    space: String,
    username: String,
    password: String,
    pub proxy: Option<String>,
    pub proxy_http_port: Option<u16>,
    pub proxy_https_port: Option<u16>,
    pub users: Option<u32>,
    pub users_at_once: Option<u32>,
    pub ramp: Option<u32>,
    pub duration: Option<u32>,
    pub repeat: Option<u32>,
    execution_directory: Option<String>,
    started_at: i64,
}

impl RunParameters {
    pub fn new(
        simulation: impl Into<String>,
        platform: impl Into<String>,
        organization: impl Into<String>,
        space: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ParameterError> {
        Ok(Self {
            simulation: required("simulation", simulation)?,
            platform: required("platform", platform)?,
            organization: required("organization", organization)?,
            space: required("space", space)?,
            username: required("username", username)?,
            password: required("password", password)?,
            proxy: None,
            proxy_http_port: None,
            proxy_https_port: None,
            users: None,
            users_at_once: None,
            ramp: None,
            duration: None,
            repeat: None,
            execution_directory: None,
            started_at: Utc::now().timestamp(),
        })
    }

    pub fn simulation(&self) -> &str {
        &self.simulation
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn space(&self) -> &str {
        &self.space
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Directory under `results/` that the running simulation writes to.
    pub fn execution_directory(&self) -> Option<&str> {
        self.execution_directory.as_deref()
    }

    pub fn set_execution_directory(
        &mut self,
        directory: impl Into<String>,
    ) -> Result<(), ParameterError> {
        self.execution_directory = Some(required("execution_directory", directory)?);
        Ok(())
    }

    /// Remote log file of the java process: `<simulation>_<unix time>.log`.
    pub fn log_file(&self) -> String {
        format!("{}_{}.log", self.simulation, self.started_at)
    }

    /// Proxy host, port and https port, each falling back to `settings`.
    pub fn effective_proxy(
        &self,
        settings: &GatlingSettings,
    ) -> (Option<String>, Option<u16>, Option<u16>) {
        (
            self.proxy.clone().or_else(|| settings.proxy.clone()),
            self.proxy_http_port.or(settings.proxy_http_port),
            self.proxy_https_port.or(settings.proxy_https_port),
        )
    }

    /// `-D` system properties for the simulation jar, unquoted.
    pub fn system_properties(&self, settings: &GatlingSettings) -> Vec<(&'static str, String)> {
        let mut properties = vec![
            ("simulation", self.simulation.clone()),
            ("platform", self.platform.clone()),
            ("username", self.username.clone()),
            ("password", self.password.clone()),
            ("organization", self.organization.clone()),
            ("space", self.space.clone()),
        ];

        let load_profile = [
            ("users", self.users),
            ("usersAtOnce", self.users_at_once),
            ("ramp", self.ramp),
            ("repeat", self.repeat),
            ("duration", self.duration),
        ];
        properties.extend(
            load_profile
                .into_iter()
                .filter_map(|(name, value)| value.map(|v| (name, v.to_string()))),
        );

        if let (Some(proxy), http, https) = self.effective_proxy(settings) {
            properties.push(("proxy", proxy));
            if let Some(port) = http {
                properties.push(("proxyHttpPort", port.to_string()));
            }
            if let Some(port) = https {
                properties.push(("proxyHttpsPort", port.to_string()));
            }
        }

        properties
    }
}
