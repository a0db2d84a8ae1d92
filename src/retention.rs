//! Retention enforcement for transient raw media.
//!
//! Every raw audio/photo handle is registered here at ingestion with a hard
//! deadline (creation + TTL). The happy path releases the asset as soon as
//! analysis hands off; the scheduler-driven sweep force-destroys anything
//! still alive past its deadline, whatever the state of the call that was
//! supposed to consume it. Deadlines are checked against the injected clock,
//! never against request lifetimes, so a stalled analysis call cannot extend
//! an asset's life.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Photo,
}

impl MediaKind {
    pub fn label(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Photo => "photo",
        }
    }
}

/// Transient handle to raw media bytes on disk. Never persisted to durable
/// storage; exists only between ingestion and deletion.
#[derive(Debug, Clone)]
pub struct RawMediaAsset {
    pub id: String,
    pub kind: MediaKind,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// An asset the sweep had to destroy after its deadline: a systemic bug
/// signal (something upstream failed to release), not a patient condition.
#[derive(Debug, Clone)]
pub struct RetentionViolationReport {
    pub asset_id: String,
    pub kind: MediaKind,
    pub deadline: DateTime<Utc>,
    pub destroyed_at: DateTime<Utc>,
}

/// Tracks registered assets and guarantees destruction by deadline.
pub struct RetentionEnforcer {
    assets: Mutex<HashMap<String, RawMediaAsset>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl RetentionEnforcer {
    pub fn new(clock: Arc<dyn Clock>, ttl_secs: u64) -> Self {
        Self {
            assets: Mutex::new(HashMap::new()),
            clock,
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Register a freshly written media file. Returns the tracked handle
    /// with its deadline stamped.
    pub fn register(&self, kind: MediaKind, path: PathBuf) -> RawMediaAsset {
        let created_at = self.clock.now();
        let asset = RawMediaAsset {
            id: format!("asset_{}", Uuid::new_v4().simple()),
            kind,
            path,
            created_at,
            deadline: created_at + self.ttl,
        };
        self.assets.lock().insert(asset.id.clone(), asset.clone());
        log::debug!(
            "retention: registered {} ({}) ttl={}s",
            asset.id,
            kind.label(),
            self.ttl.num_seconds()
        );
        asset
    }

    /// Release an asset after successful hand-off: delete the bytes now.
    ///
    /// Idempotent: releasing an unknown or already-destroyed ID is a no-op.
    pub fn release(&self, asset_id: &str) {
        let asset = self.assets.lock().remove(asset_id);
        if let Some(asset) = asset {
            destroy_bytes(&asset);
            log::debug!("retention: released {}", asset_id);
        }
    }

    /// Destroy every registered asset whose deadline has passed, regardless
    /// of release state. Returns a report per forced destruction so the
    /// caller can audit each as an internal anomaly. Destroying an asset
    /// that was already released is a no-op and produces no report.
    pub fn sweep(&self) -> Vec<RetentionViolationReport> {
        let now = self.clock.now();
        let expired: Vec<RawMediaAsset> = {
            let mut assets = self.assets.lock();
            let ids: Vec<String> = assets
                .iter()
                .filter(|(_, a)| now >= a.deadline)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| assets.remove(id)).collect()
        };

        expired
            .into_iter()
            .map(|asset| {
                destroy_bytes(&asset);
                log::warn!(
                    "retention: force-destroyed {} past deadline {}",
                    asset.id,
                    asset.deadline
                );
                RetentionViolationReport {
                    asset_id: asset.id,
                    kind: asset.kind,
                    deadline: asset.deadline,
                    destroyed_at: now,
                }
            })
            .collect()
    }

    /// Number of live (registered, not yet destroyed) assets.
    pub fn live_count(&self) -> usize {
        self.assets.lock().len()
    }
}

fn destroy_bytes(asset: &RawMediaAsset) {
    match std::fs::remove_file(&asset.path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            // The entry is already untracked; the file will be caught by the
            // next sweep of the ephemeral dir at startup.
            log::warn!("retention: failed to delete {}: {}", asset.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ManualClock;

    fn enforcer_with_clock() -> (RetentionEnforcer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let enforcer = RetentionEnforcer::new(clock.clone(), 60);
        (enforcer, clock)
    }

    fn write_media(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"raw bytes").unwrap();
        path
    }

    #[test]
    fn sweep_respects_the_deadline_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let (enforcer, clock) = enforcer_with_clock();
        let path = write_media(&dir, "a.wav");
        enforcer.register(MediaKind::Audio, path.clone());

        // t = 59s: asset still inside its window
        clock.advance(Duration::seconds(59));
        assert!(enforcer.sweep().is_empty());
        assert!(path.exists());
        assert_eq!(enforcer.live_count(), 1);

        // t = 61s: forced destruction
        clock.advance(Duration::seconds(2));
        let violations = enforcer.sweep();
        assert_eq!(violations.len(), 1);
        assert!(!path.exists());
        assert_eq!(enforcer.live_count(), 0);
    }

    #[test]
    fn release_deletes_immediately_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (enforcer, clock) = enforcer_with_clock();
        let path = write_media(&dir, "b.png");
        let asset = enforcer.register(MediaKind::Photo, path.clone());

        enforcer.release(&asset.id);
        assert!(!path.exists());
        assert_eq!(enforcer.live_count(), 0);

        // Second release: no-op, no panic
        enforcer.release(&asset.id);

        // A later sweep reports nothing for the released asset
        clock.advance(Duration::seconds(120));
        assert!(enforcer.sweep().is_empty());
    }

    #[test]
    fn sweep_only_reports_actually_destroyed_assets() {
        let dir = tempfile::tempdir().unwrap();
        let (enforcer, clock) = enforcer_with_clock();
        let expired = write_media(&dir, "old.wav");
        enforcer.register(MediaKind::Audio, expired);

        clock.advance(Duration::seconds(70));
        let fresh = write_media(&dir, "new.wav");
        enforcer.register(MediaKind::Audio, fresh.clone());

        let violations = enforcer.sweep();
        assert_eq!(violations.len(), 1);
        assert!(fresh.exists());
        assert_eq!(enforcer.live_count(), 1);
    }

    #[test]
    fn destroying_a_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (enforcer, _clock) = enforcer_with_clock();
        let path = write_media(&dir, "gone.png");
        let asset = enforcer.register(MediaKind::Photo, path.clone());

        std::fs::remove_file(&path).unwrap();
        enforcer.release(&asset.id);
        assert_eq!(enforcer.live_count(), 0);
    }
}
