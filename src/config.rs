use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::{ActorId, ApprovalType};

/// Main configuration structure for changeflow
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ChangeflowConfig {
    /// Approval policy and token settings
    pub approvals: ApprovalConfig,
    /// Ticket comment settings
    pub comments: CommentConfig,
    /// Ticket number allocation
    pub numbering: NumberingConfig,
    /// Operation bounds
    pub runtime: RuntimeConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
    /// Who signs off each approval type
    pub approvers: HashMap<ApprovalType, ApproverAssignment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Approvals may be decided in any order
    #[default]
    Parallel,
    /// Approval N+1 waits until every lower sequence_order is approved
    Sequential,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub policy: ApprovalPolicy,
    /// Lifetime of emailed approval links
    pub token_ttl_minutes: u64,
    /// Deny and request-update must explain themselves
    pub require_comment_on_rejection: bool,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            policy: ApprovalPolicy::Parallel,
            token_ttl_minutes: 72 * 60,
            require_comment_on_rejection: true,
        }
    }
}

/// Upper bound for emailed approval links: one year
pub const MAX_TOKEN_TTL_MINUTES: u64 = 365 * 24 * 60;
/// Upper bound for the comment edit window: thirty days
pub const MAX_EDIT_WINDOW_MINUTES: u64 = 30 * 24 * 60;

impl ApprovalConfig {
    /// `None` when the configured minutes do not fit a duration
    pub fn token_ttl(&self) -> Option<chrono::Duration> {
        minutes(self.token_ttl_minutes)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommentConfig {
    /// Authors may edit their own comments for this long
    pub edit_window_minutes: u64,
}

impl Default for CommentConfig {
    fn default() -> Self {
        Self {
            edit_window_minutes: 15,
        }
    }
}

impl CommentConfig {
    /// `None` when the configured minutes do not fit a duration
    pub fn edit_window(&self) -> Option<chrono::Duration> {
        minutes(self.edit_window_minutes)
    }
}

fn minutes(value: u64) -> Option<chrono::Duration> {
    i64::try_from(value).ok().and_then(chrono::Duration::try_minutes)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NumberingConfig {
    /// Directory of CHG-YYYY-NNNNN.json ledger files; unset disables the file source
    pub ledger_dir: Option<PathBuf>,
    /// Collision retries before allocation gives up
    pub max_attempts: u32,
}

impl Default for NumberingConfig {
    fn default() -> Self {
        Self {
            ledger_dir: None,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on any single engine operation
    pub operation_timeout_ms: u64,
    /// Upper bound on one notification delivery
    pub notification_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 5_000,
            notification_timeout_ms: 2_000,
        }
    }
}

impl RuntimeConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter directive when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Log engine counters after every operation
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ApproverAssignment {
    pub approver_id: ActorId,
    /// Set when the assigned approver is standing in for someone else
    #[serde(default)]
    pub delegated_from: Option<ActorId>,
}

impl ChangeflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. changeflow.toml in the working directory
    /// 3. Environment variables (prefixed with CHANGEFLOW__)
    pub fn load() -> Result<Self> {
        let default_file = Path::new("changeflow.toml");
        Self::build(default_file.exists().then_some(default_file))
    }

    /// Same as [`load`](Self::load) but with an explicit file that must exist
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        anyhow::ensure!(path.exists(), "config file {} does not exist", path.display());
        Self::build(Some(path))
    }

    fn build(file: Option<&Path>) -> Result<Self> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&ChangeflowConfig::default())?);

        if let Some(file) = file {
            builder = builder.add_source(File::from(file));
        }

        builder = builder.add_source(
            Environment::with_prefix("CHANGEFLOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("failed to assemble configuration")?;
        let changeflow_config: ChangeflowConfig = config
            .try_deserialize()
            .context("failed to deserialize configuration")?;
        changeflow_config.validate()?;

        Ok(changeflow_config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.approvals.token_ttl_minutes > 0,
            "approvals.token_ttl_minutes must be positive"
        );
        anyhow::ensure!(
            self.approvals.token_ttl_minutes <= MAX_TOKEN_TTL_MINUTES,
            "approvals.token_ttl_minutes must not exceed {MAX_TOKEN_TTL_MINUTES}"
        );
        anyhow::ensure!(
            self.comments.edit_window_minutes <= MAX_EDIT_WINDOW_MINUTES,
            "comments.edit_window_minutes must not exceed {MAX_EDIT_WINDOW_MINUTES}"
        );
        anyhow::ensure!(
            self.numbering.max_attempts > 0,
            "numbering.max_attempts must be at least 1"
        );
        anyhow::ensure!(
            self.runtime.operation_timeout_ms > 0,
            "runtime.operation_timeout_ms must be positive"
        );
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
