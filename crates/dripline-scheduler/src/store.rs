//! File-based rollback artifact store.
//! Artifacts are saved as pretty JSON files, one per migration run, so an
//! operator can read them and pass one back to `rollback`.

use std::path::{Path, PathBuf};

use dripline_core::error::{DriplineError, Result};

use crate::migration::artifact::RollbackArtifact;

const CONSUMED_SUFFIX: &str = ".consumed.json";

/// Directory of rollback artifacts.
pub struct ArtifactStore {
    path: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            DriplineError::Artifact(format!("create artifact dir {}: {e}", dir.display()))
        })?;
        Ok(Self {
            path: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.path
    }

    /// Write `artifact` as `rollback-<timestamp>.json`.
    pub fn save(&self, artifact: &RollbackArtifact) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.path)?;
        let stamp = artifact.created_at.format("%Y%m%dT%H%M%SZ");
        let mut file = self.path.join(format!("rollback-{stamp}.json"));
        // Two runs in the same second get the run id appended.
        if file.exists() {
            file = self.path.join(format!("rollback-{stamp}-{}.json", artifact.run_id));
        }
        let json = serde_json::to_string_pretty(artifact)?;
        std::fs::write(&file, json)?;
        tracing::info!("💾 Rollback artifact saved to {}", file.display());
        Ok(file)
    }

    /// Rewrite an artifact saved earlier in the same run. The new content
    /// goes to a temp file first so a failed write leaves the old one intact.
    pub fn update(&self, path: &Path, artifact: &RollbackArtifact) -> Result<()> {
        let json = serde_json::to_string_pretty(artifact)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!("💾 Rollback artifact updated: {}", path.display());
        Ok(())
    }

    /// Read an artifact. Consumed artifacts are refused.
    pub fn load(path: &Path) -> Result<RollbackArtifact> {
        if is_consumed(path) {
            return Err(DriplineError::Artifact(format!(
                "{} was already rolled back",
                path.display()
            )));
        }
        let json = std::fs::read_to_string(path)
            .map_err(|e| DriplineError::Artifact(format!("read {}: {e}", path.display())))?;
        let artifact: RollbackArtifact = serde_json::from_str(&json)
            .map_err(|e| DriplineError::Artifact(format!("parse {}: {e}", path.display())))?;
        if artifact.version != crate::migration::artifact::ARTIFACT_VERSION {
            return Err(DriplineError::Artifact(format!(
                "unsupported artifact version {}",
                artifact.version
            )));
        }
        Ok(artifact)
    }

    /// Rename `rollback-X.json` to `rollback-X.consumed.json`.
    pub fn mark_consumed(path: &Path) -> Result<PathBuf> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DriplineError::Artifact(format!("bad artifact path {}", path.display())))?;
        let stem = name.strip_suffix(".json").unwrap_or(name);
        let consumed = path.with_file_name(format!("{stem}{CONSUMED_SUFFIX}"));
        std::fs::rename(path, &consumed)?;
        tracing::debug!("📦 Artifact marked consumed: {}", consumed.display());
        Ok(consumed)
    }

    /// Unconsumed artifacts, oldest first.
    pub fn list(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.path) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("rollback-") && n.ends_with(".json"))
            })
            .filter(|p| !is_consumed(p))
            .collect();
        files.sort();
        files
    }
}

fn is_consumed(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(CONSUMED_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_save_load_consume() {
        let dir = std::env::temp_dir().join("dripline-test-artifacts");
        std::fs::remove_dir_all(&dir).ok();
        let store = ArtifactStore::new(&dir).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap();
        let artifact = RollbackArtifact::new("run-1", "cleanup", at);

        let path = store.save(&artifact).unwrap();
        assert_eq!(path.file_name().unwrap(), "rollback-20240203T040506Z.json");
        assert_eq!(ArtifactStore::load(&path).unwrap(), artifact);
        assert_eq!(store.list(), vec![path.clone()]);

        let second = store.save(&artifact).unwrap();
        assert_ne!(second, path);

        let consumed = ArtifactStore::mark_consumed(&path).unwrap();
        assert!(consumed.to_string_lossy().ends_with("rollback-20240203T040506Z.consumed.json"));
        assert!(ArtifactStore::load(&consumed).is_err());
        assert!(ArtifactStore::load(&path).is_err());
        assert_eq!(store.list(), vec![second.clone()]);

        let mut grown = artifact.clone();
        grown.plan_name = "cleanup-2".into();
        store.update(&second, &grown).unwrap();
        assert_eq!(ArtifactStore::load(&second).unwrap().plan_name, "cleanup-2");
        assert_eq!(store.list(), vec![second]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_new_reports_unusable_dir() {
        let blocker = std::env::temp_dir().join("dripline-test-artifacts-blocker");
        std::fs::remove_dir_all(&blocker).ok();
        std::fs::write(&blocker, "not a directory").unwrap();

        let err = ArtifactStore::new(&blocker.join("rollbacks"));
        assert!(matches!(err, Err(DriplineError::Artifact(_))));
        std::fs::remove_file(&blocker).ok();
    }
}
