use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::ruleset::RulesetDump;

pub const SUPPORTED_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to run nft: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("nft exited with {status}: {stderr}")]
    Exit { status: ExitStatus, stderr: String },
    #[error("nft printed invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("nftables json schema v{0} is not supported")]
    UnsupportedSchema(u64),
    #[error("ruleset dump has no metainfo entry")]
    MissingMetainfo,
    #[error("ruleset source timed out after {0:?}")]
    Timeout(Duration),
}

#[allow(async_fn_in_trait)]
pub trait RulesetSource {
    async fn fetch(&self) -> Result<RulesetDump, SourceError>;
}

/// Reads the ruleset through `nft --json list ruleset`.
#[derive(Debug, Clone)]
pub struct NftCli {
    program: PathBuf,
}

impl NftCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for NftCli {
    fn default() -> Self {
        Self::new("nft")
    }
}

impl RulesetSource for NftCli {
    #[instrument(skip(self), fields(program = %self.program.display()))]
    async fn fetch(&self) -> Result<RulesetDump, SourceError> {
        let output = Command::new(&self.program)
            .args(["--json", "list", "ruleset"])
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(SourceError::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let dump = RulesetDump::from_slice(&output.stdout)?;
        check_schema(&dump)?;
        debug!(entries = dump.entries.len(), "Fetched ruleset");
        Ok(dump)
    }
}

pub fn check_schema(dump: &RulesetDump) -> Result<(), SourceError> {
    match dump.schema_version() {
        Some(SUPPORTED_SCHEMA_VERSION) => Ok(()),
        Some(version) => Err(SourceError::UnsupportedSchema(version)),
        None => Err(SourceError::MissingMetainfo),
    }
}
