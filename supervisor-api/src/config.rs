use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "127.0.0.1")]
    pub host: String,

    /// Falls back to the control port of the definition file.
    #[envconfig(from = "BIND_PORT")]
    pub port: Option<u16>,

    #[envconfig(default = "services.json")]
    pub config_path: PathBuf,

    /// Base for relative working and log directories; defaults to the definition file's directory.
    pub base_directory: Option<PathBuf>,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "false")]
    pub log_json: bool,

    #[envconfig(default = "false")]
    pub stop_services_on_exit: bool,

    #[envconfig(default = "30000")]
    pub shutdown_timeout_ms: EnvMsDuration,

    #[envconfig(default = "1000000")]
    pub max_body_size: usize,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self, control_port: u16) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(control_port))
    }

    pub fn base_directory(&self) -> PathBuf {
        match &self.base_directory {
            Some(base) => base.clone(),
            None => self
                .config_path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
