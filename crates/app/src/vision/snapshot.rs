//! Snapshot sink persisting full encoded frames, keyed by frame id.

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::vision::config::Settings;

pub struct SnapshotWriter {
    enabled: bool,
    snapshot_dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(settings: &Settings) -> Result<Self> {
        let writer = Self {
            enabled: settings.enable_telemetry_snapshots,
            snapshot_dir: settings.snapshot_dir.clone(),
        };
        if writer.enabled {
            fs::create_dir_all(&writer.snapshot_dir).with_context(|| {
                format!(
                    "Failed to create snapshot directory {}",
                    writer.snapshot_dir.display()
                )
            })?;
        }
        Ok(writer)
    }

    /// Write the encoded frame and return its path; `None` when disabled or
    /// on a write failure (logged, never escalated).
    pub fn store(&self, frame_id: u64, jpeg: &[u8]) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let path = self.snapshot_dir.join(format!("frame_{frame_id:07}.jpg"));
        match fs::write(&path, jpeg) {
            Ok(()) => Some(path.display().to_string()),
            Err(err) => {
                warn!("Failed to store snapshot for frame {frame_id}: {err}");
                None
            }
        }
    }
}
