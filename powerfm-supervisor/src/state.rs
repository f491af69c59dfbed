use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::SupervisorError;

/// Station key → pid of the detached relay process, persisted so a
/// restarted supervisor can adopt stations that are still running
#[derive(Debug)]
pub struct PidStateFile {
    path: PathBuf,
    pids: BTreeMap<String, u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PidStateContent {
    stations: BTreeMap<String, u32>,
}

impl PidStateFile {
    /// Missing or unreadable file → empty state
    pub async fn load(path: &Path) -> Self {
        let pids = match tokio::fs::read_to_string(path).await {
            Ok(content) => match serde_json::from_str::<PidStateContent>(&content) {
                Ok(state) => state.stations,
                Err(e) => {
                    warn!("Ignoring corrupt state file {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path: path.to_path_buf(),
            pids,
        }
    }

    pub fn get(&self, key: &str) -> Option<u32> {
        self.pids.get(key).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &u32)> {
        self.pids.iter()
    }

    pub async fn set(&mut self, key: &str, pid: u32) -> Result<(), SupervisorError> {
        self.pids.insert(key.to_string(), pid);
        self.save().await
    }

    pub async fn remove(&mut self, key: &str) -> Result<(), SupervisorError> {
        if self.pids.remove(key).is_some() {
            self.save().await?;
        }
        Ok(())
    }

    /// Write temp file then rename
    async fn save(&self) -> Result<(), SupervisorError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(&PidStateContent {
            stations: self.pids.clone(),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/stations.json");

        let mut state = PidStateFile::load(&path).await;
        assert!(state.get("la").is_none());
        state.set("la", 4242).await.unwrap();
        state.set("nyc", 4343).await.unwrap();

        let mut reloaded = PidStateFile::load(&path).await;
        assert_eq!(reloaded.get("la"), Some(4242));
        assert_eq!(reloaded.entries().count(), 2);

        reloaded.remove("la").await.unwrap();
        let reloaded = PidStateFile::load(&path).await;
        assert!(reloaded.get("la").is_none());
        assert_eq!(reloaded.get("nyc"), Some(4343));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stations.json");
        std::fs::write(&path, "not json").unwrap();
        let state = PidStateFile::load(&path).await;
        assert_eq!(state.entries().count(), 0);
    }
}
