use std::path::PathBuf;

use clap::Parser;
use shuttle_core::WorkerConfig;

use crate::logging::{LoggerConfig, LoggerFormat};

/// External task worker for a BPMN workflow engine.
#[derive(Debug, Parser)]
#[command(name = "shuttle-worker", version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, env = "SHUTTLE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Engine REST endpoint, e.g. http://localhost:8080/engine-rest
    #[arg(long)]
    pub base_url: Option<String>,

    #[arg(long)]
    pub worker_id: Option<String>,

    /// Filter directive, e.g. `info` or `shuttle_core=debug,info`
    #[arg(long, env = "SHUTTLE_LOG", default_value = "info")]
    pub log_level: String,

    /// text | json
    #[arg(long, default_value = "text")]
    pub log_format: LoggerFormat,

    /// Run against an in-process engine seeded with sample payments
    #[arg(long)]
    pub demo: bool,
}

impl Cli {
    pub fn logger_config(&self) -> LoggerConfig {
        LoggerConfig {
            format: self.log_format,
            level: self.log_level.clone(),
            ..LoggerConfig::default()
        }
    }

    /// Flags win over the file and the environment.
    pub fn apply(&self, config: &mut WorkerConfig) {
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        if let Some(id) = &self.worker_id {
            config.worker_id = Some(id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "shuttle-worker",
            "--base-url",
            "http://engine:8080/engine-rest",
            "--worker-id",
            "payments-7",
            "--log-format",
            "json",
        ]);
        let mut config = WorkerConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.base_url, "http://engine:8080/engine-rest");
        assert_eq!(config.worker_id.as_deref(), Some("payments-7"));
        assert_eq!(cli.logger_config().format, LoggerFormat::Json);
        assert!(!cli.demo);
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(Cli::try_parse_from(["shuttle-worker", "--log-format", "xml"]).is_err());
    }
}
