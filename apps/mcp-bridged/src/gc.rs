//! Periodic reclamation: idle-session reaping plus expired-workspace sweep.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::jobs::JobWorkspaces;
use crate::session::SessionRegistry;

pub struct GarbageCollector {
    jobs: Arc<JobWorkspaces>,
    registry: Arc<SessionRegistry>,
    file_expiry: Duration,
    interval: Duration,
}

impl GarbageCollector {
    pub fn new(
        jobs: Arc<JobWorkspaces>,
        registry: Arc<SessionRegistry>,
        file_expiry: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            jobs,
            registry,
            file_expiry,
            interval,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.interval.as_secs(),
            file_expiry_secs = self.file_expiry.as_secs(),
            "garbage collector running"
        );
        loop {
            tokio::time::sleep(self.interval).await;
            self.collect().await;
        }
    }

    pub async fn collect(&self) {
        let reaped = self.registry.reap(Instant::now()).await;
        let swept = self.sweep_workspaces().await;
        if reaped > 0 || swept > 0 {
            info!(reaped, swept, "garbage collection pass complete");
        }
    }

    /// Delete workspace directories older than the file-expiry window that
    /// no live session owns.
    pub async fn sweep_workspaces(&self) -> usize {
        let root = self.jobs.root().to_path_buf();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(e) => e,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "cannot scan jobs root");
                return 0;
            }
        };

        let live = self.registry.live_job_ids().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.file_expiry).unwrap_or_else(|_| chrono::Duration::zero());
        let mut deleted = 0;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(meta) = tokio::fs::symlink_metadata(&path).await else {
                continue;
            };
            if meta.file_type().is_symlink() {
                warn!(path = %path.display(), "symlink in jobs root, skipping");
                continue;
            }
            if !meta.is_dir() {
                continue;
            }
            let Some(job_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<Uuid>().ok())
            else {
                debug!(path = %path.display(), "non-workspace directory in jobs root, skipping");
                continue;
            };
            if live.contains(&job_id) {
                continue;
            }

            let created_at = match self.jobs.load_metadata(&path).await {
                Some(m) => m.created_at,
                None => match meta.modified() {
                    Ok(t) => DateTime::<Utc>::from(t),
                    Err(_) => continue,
                },
            };
            if created_at >= cutoff {
                continue;
            }

            if safe_delete(&root, &path).await {
                debug!(job_id = %job_id, "deleted expired workspace");
                deleted += 1;
            }
        }

        deleted
    }
}

/// Remove a directory tree, but only after confirming it really lives under
/// the jobs root. Canonicalization defeats `..` and symlinked parents.
async fn safe_delete(root: &Path, path: &Path) -> bool {
    let (canon_root, canon_path) = match (
        tokio::fs::canonicalize(root).await,
        tokio::fs::canonicalize(path).await,
    ) {
        (Ok(r), Ok(p)) => (r, p),
        _ => return false,
    };
    if !canon_path.starts_with(&canon_root) {
        warn!(path = %path.display(), "refusing to delete path outside jobs root");
        return false;
    }
    match tokio::fs::remove_dir_all(&canon_path).await {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %canon_path.display(), error = %e, "failed to delete workspace");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (tempfile::TempDir, Arc<JobWorkspaces>, Arc<SessionRegistry>) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let jobs = Arc::new(JobWorkspaces::new(tmp.path().join("jobs")).expect("init jobs"));
        let registry = Arc::new(SessionRegistry::new(10));
        (tmp, jobs, registry)
    }

    #[tokio::test]
    async fn sweep_deletes_only_expired_workspaces() {
        let (_tmp, jobs, registry) = setup().await;
        let old = jobs.create("pp", None).await.expect("create old");
        let fresh = jobs.create("pp", None).await.expect("create fresh");

        let gc = GarbageCollector::new(
            jobs.clone(),
            registry,
            Duration::from_secs(3600),
            Duration::from_secs(300),
        );

        // Backdate the old workspace two hours.
        let mut meta = jobs.load_metadata(&old.dir).await.expect("metadata");
        meta.created_at = Utc::now() - chrono::Duration::hours(2);
        std::fs::write(
            old.dir.join(crate::jobs::METADATA_FILE),
            serde_json::to_string(&meta).expect("encode"),
        )
        .expect("write metadata");

        let swept = gc.sweep_workspaces().await;
        assert_eq!(swept, 1);
        assert!(!old.dir.exists(), "expired workspace must be gone");
        assert!(fresh.dir.exists(), "fresh workspace must survive");
    }

    #[tokio::test]
    async fn sweep_skips_foreign_directories_and_symlinks() {
        let (_tmp, jobs, registry) = setup().await;
        let foreign = jobs.root().join("not-a-uuid");
        std::fs::create_dir(&foreign).expect("mkdir");

        #[cfg(unix)]
        {
            let target = jobs.root().join("target");
            std::fs::create_dir(&target).expect("mkdir target");
            std::os::unix::fs::symlink(&target, jobs.root().join("link")).expect("symlink");
        }

        let gc = GarbageCollector::new(
            jobs.clone(),
            registry,
            Duration::from_secs(0),
            Duration::from_secs(300),
        );
        let swept = gc.sweep_workspaces().await;
        assert_eq!(swept, 0);
        assert!(foreign.exists());
    }
}
