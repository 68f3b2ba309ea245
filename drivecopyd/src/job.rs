use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use drivecopy_core::{
    ApiError, Backoff, ClientCredentials, CredentialError, Credentials, DriveClient, OAuthClient,
    RobustHttp, StaticToken, TokenSource, TransportError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::storage::{CheckpointStore, JobCheckpoint, Phase};
use crate::sync::audit::{AuditSummary, Auditor};
use crate::sync::controller::AdaptiveController;
use crate::sync::cursor::CursorStore;
use crate::sync::gate::ConcurrencyGate;
use crate::sync::mirror::{Mirror, MirrorError, MirrorTarget, PassOutcome};
use crate::sync::progress::{ProgressSink, StageStatus};
use crate::sync::stats::{Stats, StatsSnapshot};
use crate::sync::transfer::{TransferClient, TransferConfig};
use crate::token_provider::TokenProvider;

const DEFAULT_ROOT_NAME: &str = "SRC_ROOT";
const DEFAULT_PARENT: &str = "root";
const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_LOGIN_URL: &str = "https://login.microsoftonline.com";
const DEFAULT_MIN_CONCURRENCY: u64 = 1;
const DEFAULT_MAX_CONCURRENCY: u64 = 4;
const DEFAULT_START_CONCURRENCY: u64 = 2;
const DEFAULT_ADAPT_SECS: u64 = 20;
const STATE_DIR_NAME: &str = "drivecopy";

pub const STAGE_FOLDERS: &str = "mirroring folder structure";
pub const STAGE_FILES: &str = "copying files to destination";
pub const STAGE_AUDIT: &str = "post job audit";
pub const STAGE_CANCELLED: &str = "cancelled";

/// Identity of a mirror job. Any field change makes a different job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSignature {
    pub tenant: String,
    pub src_drive: String,
    pub src_root: String,
    pub dest_drive: String,
    pub dest_parent: String,
    pub root_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialConfig {
    Static(String),
    ClientCredentials {
        tenant: String,
        client_id: String,
        client_secret: String,
    },
}

#[derive(Clone, Debug)]
pub struct JobConfig {
    pub tenant: String,
    pub credentials: CredentialConfig,
    pub target: MirrorTarget,
    pub transfer: TransferConfig,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub start_concurrency: usize,
    pub adapt_period: Duration,
    pub delete_extras: bool,
    pub state_dir: PathBuf,
    pub graph_url: String,
    pub login_url: String,
}

impl JobConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable lookup.
    pub fn from_vars<F>(var: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| {
            var(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let read_u64_env = |name: &str, default: u64| {
            var(name)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(default)
        };
        let read_bool_env = |name: &str, default: bool| {
            var(name)
                .map(|value| {
                    matches!(
                        value.trim().to_ascii_lowercase().as_str(),
                        "1" | "true" | "yes" | "on"
                    )
                })
                .unwrap_or(default)
        };
        let read_usize_env = |name: &str, default: u64| {
            usize::try_from(read_u64_env(name, default)).unwrap_or(usize::MAX)
        };

        let tenant = non_empty("DRIVECOPY_TENANT").unwrap_or_default();
        let credentials = match non_empty("DRIVECOPY_TOKEN") {
            Some(token) => CredentialConfig::Static(token),
            None => CredentialConfig::ClientCredentials {
                tenant: non_empty("DRIVECOPY_TENANT").context("DRIVECOPY_TENANT is not set")?,
                client_id: non_empty("DRIVECOPY_CLIENT_ID")
                    .context("DRIVECOPY_CLIENT_ID is not set")?,
                client_secret: non_empty("DRIVECOPY_CLIENT_SECRET")
                    .context("DRIVECOPY_CLIENT_SECRET is not set")?,
            },
        };

        let target = MirrorTarget {
            src_drive: non_empty("DRIVECOPY_SRC_DRIVE").context("DRIVECOPY_SRC_DRIVE is not set")?,
            src_root: non_empty("DRIVECOPY_SRC_PARENT").unwrap_or_else(|| DEFAULT_PARENT.into()),
            dest_drive: non_empty("DRIVECOPY_DEST_DRIVE")
                .context("DRIVECOPY_DEST_DRIVE is not set")?,
            dest_parent: non_empty("DRIVECOPY_DEST_PARENT")
                .unwrap_or_else(|| DEFAULT_PARENT.into()),
            // Set but empty means "copy straight into the parent".
            root_name: var("DRIVECOPY_ROOT_NAME")
                .map(|value| value.trim().to_string())
                .unwrap_or_else(|| DEFAULT_ROOT_NAME.into()),
        };

        let defaults = TransferConfig::default();
        let transfer = TransferConfig {
            chunk_bytes: read_u64_env("DRIVECOPY_CHUNK_BYTES", defaults.chunk_bytes),
            min_chunk_bytes: read_u64_env("DRIVECOPY_MIN_CHUNK_BYTES", defaults.min_chunk_bytes),
            small_file_bytes: read_u64_env("DRIVECOPY_SMALL_FILE_BYTES", defaults.small_file_bytes),
            file_retries: var("DRIVECOPY_FILE_RETRIES")
                .and_then(|value| value.trim().parse::<u32>().ok())
                .unwrap_or(defaults.file_retries),
            ..defaults
        }
        .normalized();

        let state_dir = match non_empty("DRIVECOPY_STATE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::state_dir()
                .or_else(dirs::data_local_dir)
                .context("no state directory available; set DRIVECOPY_STATE_DIR")?
                .join(STATE_DIR_NAME),
        };

        Ok(Self {
            tenant,
            credentials,
            target,
            transfer,
            min_concurrency: read_usize_env("DRIVECOPY_MIN_CONCURRENCY", DEFAULT_MIN_CONCURRENCY),
            max_concurrency: read_usize_env("DRIVECOPY_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY),
            start_concurrency: read_usize_env(
                "DRIVECOPY_START_CONCURRENCY",
                DEFAULT_START_CONCURRENCY,
            ),
            adapt_period: Duration::from_secs(read_u64_env(
                "DRIVECOPY_ADAPT_SECS",
                DEFAULT_ADAPT_SECS,
            )),
            delete_extras: read_bool_env("DRIVECOPY_DELETE_EXTRAS", false),
            state_dir,
            graph_url: non_empty("DRIVECOPY_GRAPH_URL")
                .unwrap_or_else(|| DEFAULT_GRAPH_URL.into()),
            login_url: non_empty("DRIVECOPY_LOGIN_URL")
                .unwrap_or_else(|| DEFAULT_LOGIN_URL.into()),
        })
    }

    pub fn signature(&self) -> JobSignature {
        JobSignature {
            tenant: self.tenant.clone(),
            src_drive: self.target.src_drive.clone(),
            src_root: self.target.src_root.clone(),
            dest_drive: self.target.dest_drive.clone(),
            dest_parent: self.target.dest_parent.clone(),
            root_name: self.target.root_name.clone(),
        }
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(&self.state_dir)
    }

    /// Cached credential provider over the configured token source.
    pub fn token_provider(&self) -> Result<Arc<TokenProvider>, CredentialError> {
        let source: Arc<dyn TokenSource> = match &self.credentials {
            CredentialConfig::Static(token) => Arc::new(StaticToken::new(token.clone())),
            CredentialConfig::ClientCredentials {
                tenant,
                client_id,
                client_secret,
            } => Arc::new(ClientCredentials::new(OAuthClient::with_base_url(
                &self.login_url,
                tenant.clone(),
                client_id.clone(),
                client_secret.clone(),
            )?)),
        };
        Ok(Arc::new(TokenProvider::new(source)))
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("credential acquisition failed: {0}")]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("{stage} failed: {source}")]
    Phase {
        stage: &'static str,
        #[source]
        source: MirrorError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(AuditSummary),
    /// Stopped by the cancellation token during the given phase.
    Cancelled(Phase),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub resumed: bool,
    pub stats: StatsSnapshot,
}

/// Runs one job: folders pass, files pass, audit, resuming at whatever phase
/// the checkpoint recorded.
pub struct JobRunner {
    config: JobConfig,
    credentials: Arc<dyn Credentials>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    backoff: Option<Backoff>,
}

impl JobRunner {
    pub fn new(
        config: JobConfig,
        credentials: Arc<dyn Credentials>,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            credentials,
            sink,
            cancel,
            backoff: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<RunReport, RunError> {
        let (checkpoint, resumed) =
            JobCheckpoint::open(self.config.checkpoint_store(), self.config.signature()).await;
        let checkpoint = Arc::new(checkpoint);

        let gate = Arc::new(ConcurrencyGate::new(
            self.config.min_concurrency,
            self.config.max_concurrency,
            self.config.start_concurrency,
        ));
        let stats = Arc::new(Stats::new(self.sink.clone(), gate.target()));
        if resumed {
            stats.log(format!(
                "[RESUME] Phase = {}",
                checkpoint.phase().await.as_str()
            ));
        }

        let stop = CancellationToken::new();
        let controller =
            AdaptiveController::new(gate.clone(), stats.clone(), self.config.adapt_period)
                .spawn(stop.clone());

        let result = self.run_phases(&checkpoint, &stats, gate).await;

        stop.cancel();
        if let Err(err) = controller.await {
            tracing::warn!(error = %err, "adaptive controller task failed");
        }
        stats.finish();

        match result {
            Ok(outcome) => Ok(RunReport {
                outcome,
                resumed,
                stats: stats.snapshot(),
            }),
            Err(err) => {
                stats.warn(format!("[FATAL] {err}"));
                checkpoint.save().await;
                Err(err)
            }
        }
    }

    async fn run_phases(
        &self,
        checkpoint: &Arc<JobCheckpoint>,
        stats: &Arc<Stats>,
        gate: Arc<ConcurrencyGate>,
    ) -> Result<RunOutcome, RunError> {
        let mut http = RobustHttp::new(self.credentials.clone())?
            .with_throttle_observer(stats.clone());
        if let Some(backoff) = self.backoff {
            http = http.with_backoff(backoff);
        }
        let drive = DriveClient::with_base_url(&self.config.graph_url, http)?;

        // Fail fast when no token can be had at all.
        self.credentials.bearer_token().await?;

        let target = &self.config.target;
        let cursors: Arc<dyn CursorStore> = checkpoint.clone();
        let mirror = Mirror::new(
            drive.clone(),
            TransferClient::new(drive.clone(), self.config.transfer),
            gate,
            stats.clone(),
            cursors,
            self.cancel.clone(),
        )
        .with_delete_extras(self.config.delete_extras);

        if checkpoint.phase().await == Phase::Folders {
            match run_stage(stats, STAGE_FOLDERS, mirror.mirror_folders(target)).await? {
                PassOutcome::Completed => checkpoint.set_phase(Phase::Files).await,
                PassOutcome::Cancelled => {
                    return Ok(self.cancelled(checkpoint, stats, Phase::Folders).await);
                }
            }
        }

        if checkpoint.phase().await == Phase::Files {
            match run_stage(stats, STAGE_FILES, mirror.mirror_files(target)).await? {
                PassOutcome::Completed => checkpoint.set_phase(Phase::Audit).await,
                PassOutcome::Cancelled => {
                    return Ok(self.cancelled(checkpoint, stats, Phase::Files).await);
                }
            }
        }

        let auditor = Auditor::new(drive, stats.clone(), self.cancel.clone());
        match run_stage(stats, STAGE_AUDIT, auditor.run(target)).await? {
            Some(summary) => {
                checkpoint.discard().await;
                Ok(RunOutcome::Completed(summary))
            }
            None => Ok(self.cancelled(checkpoint, stats, Phase::Audit).await),
        }
    }

    async fn cancelled(&self, checkpoint: &JobCheckpoint, stats: &Stats, phase: Phase) -> RunOutcome {
        checkpoint.save().await;
        stats.stage(STAGE_CANCELLED, StageStatus::Ok);
        stats.log(format!("[CANCEL] job stopped during {} phase", phase.as_str()));
        RunOutcome::Cancelled(phase)
    }
}

async fn run_stage<T>(
    stats: &Stats,
    stage: &'static str,
    pass: impl Future<Output = Result<T, MirrorError>>,
) -> Result<T, RunError> {
    stats.stage(stage, StageStatus::Running);
    match pass.await {
        Ok(value) => {
            stats.stage(stage, StageStatus::Ok);
            Ok(value)
        }
        Err(source) => {
            stats.stage(stage, StageStatus::Failed);
            Err(RunError::Phase { stage, source })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("DRIVECOPY_TOKEN", "static-token"),
        ("DRIVECOPY_SRC_DRIVE", "src"),
        ("DRIVECOPY_DEST_DRIVE", "dst"),
        ("DRIVECOPY_STATE_DIR", "/tmp/drivecopy-state"),
    ];

    #[test]
    fn defaults_apply_when_unset() {
        let config = JobConfig::from_vars(vars(BASE)).unwrap();
        assert_eq!(config.credentials, CredentialConfig::Static("static-token".into()));
        assert_eq!(config.target.src_root, "root");
        assert_eq!(config.target.dest_parent, "root");
        assert_eq!(config.target.root_name, "SRC_ROOT");
        assert_eq!(
            (config.min_concurrency, config.max_concurrency, config.start_concurrency),
            (1, 4, 2)
        );
        assert_eq!(config.adapt_period, Duration::from_secs(20));
        assert!(!config.delete_extras);
        assert_eq!(config.transfer, TransferConfig::default().normalized());
        assert_eq!(config.state_dir, PathBuf::from("/tmp/drivecopy-state"));
        assert_eq!(config.graph_url, "https://graph.microsoft.com/v1.0");
    }

    #[test]
    fn overrides_are_read_and_invalid_numbers_fall_back() {
        let mut pairs = BASE.to_vec();
        pairs.extend([
            ("DRIVECOPY_ROOT_NAME", ""),
            ("DRIVECOPY_MAX_CONCURRENCY", "8"),
            ("DRIVECOPY_START_CONCURRENCY", "zero"),
            ("DRIVECOPY_ADAPT_SECS", "0"),
            ("DRIVECOPY_DELETE_EXTRAS", "yes"),
            ("DRIVECOPY_CHUNK_BYTES", "1000000"),
            ("DRIVECOPY_FILE_RETRIES", "2"),
        ]);
        let config = JobConfig::from_vars(vars(&pairs)).unwrap();
        assert_eq!(config.target.root_name, "");
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.start_concurrency, 2);
        assert_eq!(config.adapt_period, Duration::from_secs(20));
        assert!(config.delete_extras);
        assert_eq!(config.transfer.chunk_bytes, 983_040);
        assert_eq!(config.transfer.file_retries, 2);
    }

    #[test]
    fn client_credentials_require_all_parts() {
        let missing = JobConfig::from_vars(vars(&[
            ("DRIVECOPY_TENANT", "contoso"),
            ("DRIVECOPY_CLIENT_ID", "app"),
            ("DRIVECOPY_SRC_DRIVE", "src"),
            ("DRIVECOPY_DEST_DRIVE", "dst"),
        ]))
        .unwrap_err();
        assert!(missing.to_string().contains("DRIVECOPY_CLIENT_SECRET"));

        let config = JobConfig::from_vars(vars(&[
            ("DRIVECOPY_TENANT", "contoso"),
            ("DRIVECOPY_CLIENT_ID", "app"),
            ("DRIVECOPY_CLIENT_SECRET", "secret"),
            ("DRIVECOPY_SRC_DRIVE", "src"),
            ("DRIVECOPY_DEST_DRIVE", "dst"),
            ("DRIVECOPY_STATE_DIR", "/tmp/state"),
        ]))
        .unwrap();
        assert_eq!(config.signature().tenant, "contoso");
        assert!(matches!(
            config.credentials,
            CredentialConfig::ClientCredentials { .. }
        ));
    }

    #[test]
    fn signature_tracks_target() {
        let config = JobConfig::from_vars(vars(BASE)).unwrap();
        let signature = config.signature();
        assert_eq!(signature.src_drive, "src");
        assert_eq!(signature.dest_drive, "dst");
        assert_eq!(signature.root_name, "SRC_ROOT");
        assert_eq!(signature.tenant, "");
    }

    #[tokio::test]
    async fn static_token_provider_serves_configured_token() {
        let config = JobConfig::from_vars(vars(BASE)).unwrap();
        let provider = config.token_provider().unwrap();
        assert_eq!(provider.valid_access_token().await.unwrap(), "static-token");
    }
}
