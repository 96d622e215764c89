//! Service configuration
//!
//! Command line flags, each with an environment variable fallback. An env
//! file (`WEBH_ENV_FILE`, then `.env`) can pre-populate the environment; it
//! never overrides variables that are already set.

use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use webh::{CompressOptions, CorsOptions};

/// Env files checked when `WEBH_ENV_FILE` is not set
pub const ENV_FILE_PATHS: &[&str] = &[".env"];

#[derive(Parser, Debug)]
#[command(name = "webh-service")]
#[command(about = "Demo HTTP service with JSON envelopes and graceful shutdown")]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Bind host (IP literal)
    #[arg(long, env = "WEBH_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Service name attached to request logs
    #[arg(long, env = "WEBH_SERVICE_NAME", default_value = "webh-service")]
    pub service_name: String,

    /// Health check path
    #[arg(long, env = "WEBH_HEARTBEAT", default_value = "/ping")]
    pub heartbeat: String,

    /// Allowed CORS origins (comma separated); CORS is off when empty
    #[arg(long, env = "WEBH_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Compression level; compression is off when unset
    #[arg(long, env = "WEBH_COMPRESS_LEVEL")]
    pub compress_level: Option<i32>,

    /// Directory (relative to the working directory) served as static files
    #[arg(long, env = "WEBH_STATIC_DIR")]
    pub static_dir: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "WEBH_LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    pub fn cors(&self) -> Option<CorsOptions> {
        if self.cors_origins.is_empty() {
            return None;
        }
        Some(CorsOptions {
            allowed_origins: self.cors_origins.clone(),
            allowed_headers: vec!["*".to_string()],
            exposed_headers: vec!["x-request-id".to_string()],
            allow_credentials: false,
            max_age: 300,
        })
    }

    pub fn compress(&self) -> Option<CompressOptions> {
        self.compress_level
            .map(|level| CompressOptions::new(level, ["application/json", "text/*"]))
    }
}

/// What an env file contributed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvFileReport {
    pub path: PathBuf,
    pub loaded: usize,
    pub skipped: usize,
}

/// Load the first env file found. Returns `None` if there is none.
pub fn load_environment() -> Option<EnvFileReport> {
    if let Ok(custom_path) = std::env::var("WEBH_ENV_FILE") {
        if let Some(report) = load_env_file(Path::new(&custom_path)) {
            return Some(report);
        }
    }

    ENV_FILE_PATHS
        .iter()
        .find_map(|path| load_env_file(Path::new(path)))
}

fn load_env_file(path: &Path) -> Option<EnvFileReport> {
    let content = fs::read_to_string(path).ok()?;

    let mut report = EnvFileReport {
        path: path.to_path_buf(),
        loaded: 0,
        skipped: 0,
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = parse_env_line(line) {
            if std::env::var_os(&key).is_some() {
                report.skipped += 1;
            } else {
                std::env::set_var(&key, &value);
                report.loaded += 1;
            }
        }
    }

    Some(report)
}

/// Parse `KEY=VALUE`, `KEY="VALUE"` or `KEY='VALUE'`.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let value = value.trim();

    if key.is_empty() {
        return None;
    }

    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}
