//! Orchestrator configuration
//!
//! Environment-driven defaults with an optional TOML overlay. Secrets
//! (`AMP_TOKEN`, `AMP_AUTH_CMD`) are carried but never logged; the `Debug`
//! impl redacts them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use session_core::GitConfig;

/// Default wall-clock budget for one agent iteration.
pub const DEFAULT_ITERATION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Grace period between closing stdin / SIGTERM and a forced kill.
pub const AGENT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Agent CLI configuration.
#[derive(Clone)]
pub struct AmpConfig {
    /// Agent binary. `AMP_BIN`, default `amp`.
    pub bin: PathBuf,
    /// Extra argv words appended to every spawn. `AMP_ARGS`, shell-split.
    pub extra_args: Vec<String>,
    /// Pass the JSON-logs flag to the agent. `AMP_ENABLE_JSONL`, default on.
    pub enable_jsonl: bool,
    /// Command that yields an auth token. `AMP_AUTH_CMD`. Never logged.
    pub auth_cmd: Option<String>,
    /// Static auth token. `AMP_TOKEN`. Never logged.
    pub token: Option<String>,
    /// Agent identity flag value, when the CLI is multi-agent.
    pub agent_id: Option<String>,
    /// Routing hint passed through to the agent. `AMP_ROUTING`.
    pub routing: Option<String>,
    /// Enable the agent's multi-provider mode. `AMP_MULTI_PROVIDER`.
    pub multi_provider: bool,
    /// Wall-clock budget for one iteration; batch items may override.
    pub iteration_timeout: Duration,
}

impl Default for AmpConfig {
    fn default() -> Self {
        Self {
            bin: std::env::var("AMP_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("amp")),
            extra_args: std::env::var("AMP_ARGS")
                .ok()
                .and_then(|raw| shlex::split(&raw))
                .unwrap_or_default(),
            enable_jsonl: std::env::var("AMP_ENABLE_JSONL")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            auth_cmd: std::env::var("AMP_AUTH_CMD").ok().filter(|s| !s.is_empty()),
            token: std::env::var("AMP_TOKEN").ok().filter(|s| !s.is_empty()),
            agent_id: std::env::var("AMP_AGENT_ID").ok().filter(|s| !s.is_empty()),
            routing: std::env::var("AMP_ROUTING").ok().filter(|s| !s.is_empty()),
            multi_provider: std::env::var("AMP_MULTI_PROVIDER")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            iteration_timeout: DEFAULT_ITERATION_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for AmpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmpConfig")
            .field("bin", &self.bin)
            .field("extra_args", &self.extra_args)
            .field("enable_jsonl", &self.enable_jsonl)
            .field("auth_cmd", &self.auth_cmd.as_ref().map(|_| "***"))
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("agent_id", &self.agent_id)
            .field("routing", &self.routing)
            .field("multi_provider", &self.multi_provider)
            .field("iteration_timeout", &self.iteration_timeout)
            .finish()
    }
}

impl AmpConfig {
    /// Well-known user-level file where the agent records its last thread id.
    ///
    /// Read only as a resumption hint; thread ids are authoritative solely
    /// when the agent emits them.
    pub fn last_thread_hint_path() -> Option<PathBuf> {
        std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".local/state/amp/last-thread-id"))
    }

    pub fn read_last_thread_hint() -> Option<String> {
        let path = Self::last_thread_hint_path()?;
        let contents = std::fs::read_to_string(path).ok()?;
        let trimmed = contents.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Optional TOML overlay, merged over the environment defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ConfigFile {
    amp_bin: Option<String>,
    amp_args: Option<String>,
    agent_id: Option<String>,
    db_path: Option<String>,
    iteration_timeout_secs: Option<u64>,
    git_timeout_secs: Option<u64>,
    retention_days: Option<i64>,
}

/// Process-wide configuration, constructed once at startup and passed down.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub amp: AmpConfig,
    pub git: GitConfig,
    /// Single-file database location. `AMP_DB_PATH`.
    pub db_path: PathBuf,
    /// Stream-event retention in days.
    pub retention_days: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            amp: AmpConfig::default(),
            git: GitConfig::default(),
            db_path: std::env::var("AMP_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".amp-orchestrator/state.db")),
            retention_days: session_core::store::DEFAULT_RETENTION_DAYS,
        }
    }
}

impl OrchestratorConfig {
    /// Environment defaults, optionally overlaid with a TOML file.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        let Some(path) = config_path else {
            return Ok(config);
        };

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&contents)
            .with_context(|| format!("malformed config file {}", path.display()))?;

        if let Some(bin) = file.amp_bin {
            config.amp.bin = PathBuf::from(bin);
        }
        if let Some(args) = file.amp_args {
            config.amp.extra_args = shlex::split(&args)
                .with_context(|| "unparseable amp-args in config file")?;
        }
        if let Some(agent_id) = file.agent_id {
            config.amp.agent_id = Some(agent_id);
        }
        if let Some(db_path) = file.db_path {
            config.db_path = PathBuf::from(db_path);
        }
        if let Some(secs) = file.iteration_timeout_secs {
            config.amp.iteration_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.git_timeout_secs {
            config.git.timeout = Duration::from_secs(secs);
        }
        if let Some(days) = file.retention_days {
            config.retention_days = days;
        }
        Ok(config)
    }

    /// Directory holding the database and per-run NDJSON logs.
    pub fn state_dir(&self) -> PathBuf {
        self.db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// NDJSON event log path for a batch run.
    pub fn run_log_path(&self, run_id: &str) -> PathBuf {
        self.state_dir().join("runs").join(format!("{run_id}.ndjson"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secrets() {
        let config = AmpConfig {
            token: Some("sk-secret-value".into()),
            auth_cmd: Some("op read token".into()),
            ..AmpConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-secret-value"));
        assert!(!rendered.contains("op read"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn toml_overlay_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.toml");
        std::fs::write(
            &path,
            r#"
            amp-bin = "/opt/amp/bin/amp"
            amp-args = "--no-color --routing fast"
            db-path = "/var/lib/amp/state.db"
            iteration-timeout-secs = 600
            "#,
        )
        .unwrap();

        let config = OrchestratorConfig::load(Some(&path)).unwrap();
        assert_eq!(config.amp.bin, PathBuf::from("/opt/amp/bin/amp"));
        assert_eq!(
            config.amp.extra_args,
            vec!["--no-color", "--routing", "fast"]
        );
        assert_eq!(config.db_path, PathBuf::from("/var/lib/amp/state.db"));
        assert_eq!(config.amp.iteration_timeout, Duration::from_secs(600));
        assert_eq!(config.run_log_path("r1"), PathBuf::from("/var/lib/amp/runs/r1.ndjson"));
    }
}
