//! Per-session job workspaces.
//!
//! Every execution gets a directory `{root}/{uuid}` where the subprocess
//! runs and drops its output files. A small `metadata.json` travels with
//! each workspace so the garbage collector can age it out and operators can
//! see what produced it.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_id: Uuid,
    pub server: String,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub job_id: Uuid,
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct JobWorkspaces {
    root: PathBuf,
}

impl JobWorkspaces {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root: PathBuf = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create jobs root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_for(&self, job_id: Uuid) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    pub async fn create(
        &self,
        server: &str,
        session_key: Option<&str>,
    ) -> anyhow::Result<Workspace> {
        let job_id = Uuid::new_v4();
        let dir = self.dir_for(job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create workspace {}", dir.display()))?;

        let metadata = JobMetadata {
            job_id,
            server: server.to_string(),
            created_at: Utc::now(),
            status: JobStatus::Processing,
            error: None,
            session_key: session_key.map(str::to_string),
        };
        write_metadata(&dir, &metadata).await?;

        Ok(Workspace { job_id, dir })
    }

    pub async fn load_metadata(&self, dir: &Path) -> Option<JobMetadata> {
        let raw = tokio::fs::read_to_string(dir.join(METADATA_FILE)).await.ok()?;
        match serde_json::from_str(&raw) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "unreadable workspace metadata");
                None
            }
        }
    }

    /// Best-effort status update; a workspace whose metadata went missing is
    /// not worth failing a request over.
    pub async fn update_status(&self, workspace: &Workspace, status: JobStatus, error: Option<&str>) {
        let Some(mut metadata) = self.load_metadata(&workspace.dir).await else {
            return;
        };
        metadata.status = status;
        metadata.error = error.map(str::to_string);
        if let Err(e) = write_metadata(&workspace.dir, &metadata).await {
            warn!(job_id = %workspace.job_id, error = %e, "failed to persist job status");
        }
    }
}

async fn write_metadata(dir: &Path, metadata: &JobMetadata) -> anyhow::Result<()> {
    let raw = serde_json::to_string_pretty(metadata).context("encode job metadata")?;
    tokio::fs::write(dir.join(METADATA_FILE), raw)
        .await
        .with_context(|| format!("write metadata in {}", dir.display()))?;
    Ok(())
}
