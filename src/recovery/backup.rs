use crate::background::{self, Stopper};
use crate::cluster::{NodeId, PartitionId};
use crate::replication::{copy_partition, PartitionStore};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// On-disk metadata written next to every backup file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupManifest {
    pub partition: PartitionId,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// SHA256 of the backup file contents, hex encoded.
    pub checksum: String,
}

/// Latest backup bookkeeping per partition. Created lazily on first backup.
#[derive(Clone, Debug, Serialize)]
pub struct BackupState {
    pub last_backup: DateTime<Utc>,
    pub size_bytes: u64,
    pub checksum: String,
    pub version: u64,
}

/// Ask a replica holder to serve partition bytes for a restore.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryRequestMsg {
    pub partition: PartitionId,
}

/// Restore-complete notification to replica holders.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryResponseMsg {
    pub partition: PartitionId,
    pub restored_onto: NodeId,
    pub success: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("No local copy of partition {0:?} to back up")]
    NoLocalCopy(PartitionId),

    #[error("Backup IO failure")]
    Io(#[from] io::Error),

    #[error("Malformed backup manifest")]
    Manifest(#[from] serde_json::Error),

    #[error("Checksum mismatch for {partition:?} backup v{version}")]
    ChecksumMismatch { partition: PartitionId, version: u64 },

    #[error("No backup available for partition {0:?}")]
    NoBackupAvailable(PartitionId),

    #[error("Replica copy of {partition:?} on {source_node:?} failed verification")]
    CorruptReplicaSource {
        partition: PartitionId,
        source_node: NodeId,
    },
}

/// Periodic checksummed backups of locally-owned partitions, and restores
/// from backup files or healthy replicas. Integrity is verified before any
/// restore is applied; corrupt data is never written.
pub struct RecoveryManager {
    logger: slog::Logger,
    backup_dir: PathBuf,
    store: Arc<dyn PartitionStore>,
    states: Mutex<HashMap<PartitionId, BackupState>>,
    retention: Duration,
}

pub struct BackupLoopHandle {
    _stopper: Stopper,
}

impl RecoveryManager {
    pub fn new(
        logger: slog::Logger,
        backup_dir: PathBuf,
        store: Arc<dyn PartitionStore>,
        retention: Duration,
    ) -> Self {
        RecoveryManager {
            logger,
            backup_dir,
            store,
            states: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Serialize the partition's bytes, checksum them, and write a new
    /// versioned backup file plus manifest.
    pub fn create_backup(
        &self,
        node: &NodeId,
        partition: &PartitionId,
    ) -> Result<BackupManifest, BackupError> {
        let data = self
            .store
            .read_all(node, partition)?
            .ok_or_else(|| BackupError::NoLocalCopy(partition.clone()))?;

        let version = self.latest_version(partition)?.map(|v| v + 1).unwrap_or(1);
        let manifest = BackupManifest {
            partition: partition.clone(),
            version,
            created_at: Utc::now(),
            size_bytes: data.len() as u64,
            checksum: calculate_checksum(&data),
        };

        let partition_dir = self.partition_dir(partition);
        fs::create_dir_all(&partition_dir)?;

        let data_path = partition_dir.join(format!("{}.bak", version));
        let mut data_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&data_path)?;
        data_file.write_all(&data)?;
        data_file.sync_data()?;

        let manifest_path = partition_dir.join(format!("{}.meta.json", version));
        let manifest_file = File::create(&manifest_path)?;
        serde_json::to_writer_pretty(manifest_file, &manifest)?;

        let mut states = self.states.lock().expect("RecoveryManager.states mutex poison");
        states.insert(
            partition.clone(),
            BackupState {
                last_backup: manifest.created_at,
                size_bytes: manifest.size_bytes,
                checksum: manifest.checksum.clone(),
                version,
            },
        );

        slog::info!(
            self.logger,
            "Backed up {:?} v{} ({} bytes)",
            partition,
            version,
            manifest.size_bytes,
        );

        Ok(manifest)
    }

    /// Restore one backup version onto `node`. Defaults to the latest
    /// version. The stored checksum is verified against a freshly computed
    /// one before anything is applied; on mismatch nothing is written.
    pub fn restore_partition(
        &self,
        node: &NodeId,
        partition: &PartitionId,
        version: Option<u64>,
    ) -> Result<BackupManifest, BackupError> {
        let version = match version {
            Some(version) => version,
            None => self
                .latest_version(partition)?
                .ok_or_else(|| BackupError::NoBackupAvailable(partition.clone()))?,
        };

        let manifest = self.read_manifest(partition, version)?;
        let data_path = self.partition_dir(partition).join(format!("{}.bak", version));
        let mut data = Vec::new();
        File::open(&data_path)?.read_to_end(&mut data)?;

        if calculate_checksum(&data) != manifest.checksum {
            slog::error!(
                self.logger,
                "Backup {:?} v{} failed checksum verification; not applying",
                partition,
                version,
            );
            return Err(BackupError::ChecksumMismatch {
                partition: partition.clone(),
                version,
            });
        }

        self.store.write_all(node, partition, Bytes::from(data))?;
        slog::info!(self.logger, "Restored {:?} v{} onto {:?}", partition, version, node);

        Ok(manifest)
    }

    /// Walk versions newest-to-oldest until one verifies. Only when every
    /// version is corrupt or missing does this report no valid backup.
    pub fn restore_latest_valid(
        &self,
        node: &NodeId,
        partition: &PartitionId,
    ) -> Result<BackupManifest, BackupError> {
        let mut versions = self.list_versions(partition)?;
        versions.reverse();

        for version in versions {
            match self.restore_partition(node, partition, Some(version)) {
                Ok(manifest) => return Ok(manifest),
                Err(BackupError::ChecksumMismatch { .. }) | Err(BackupError::Io(_)) => {
                    slog::warn!(
                        self.logger,
                        "Backup {:?} v{} unusable, trying older version",
                        partition,
                        version,
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(BackupError::NoBackupAvailable(partition.clone()))
    }

    /// Copy a healthy replica's bytes onto `target`, verifying the written
    /// copy against the source checksum before reporting success.
    pub fn restore_from_replica(
        &self,
        partition: &PartitionId,
        source: &NodeId,
        target: &NodeId,
    ) -> Result<u64, BackupError> {
        let source_data = self
            .store
            .read_all(source, partition)?
            .ok_or_else(|| BackupError::NoLocalCopy(partition.clone()))?;
        let expected_checksum = calculate_checksum(&source_data);

        let copied = copy_partition(self.store.as_ref(), partition, source, target)?;

        let written = self
            .store
            .read_all(target, partition)?
            .ok_or_else(|| BackupError::NoLocalCopy(partition.clone()))?;
        if calculate_checksum(&written) != expected_checksum {
            self.store.remove(target, partition)?;
            return Err(BackupError::CorruptReplicaSource {
                partition: partition.clone(),
                source_node: source.clone(),
            });
        }

        slog::info!(
            self.logger,
            "Restored {:?} ({} bytes) onto {:?} from replica {:?}",
            partition,
            copied,
            target,
            source,
        );

        Ok(copied)
    }

    pub fn backup_state(&self, partition: &PartitionId) -> Option<BackupState> {
        let states = self.states.lock().expect("RecoveryManager.states mutex poison");
        states.get(partition).cloned()
    }

    /// Delete backups older than the retention window. Returns how many
    /// versions were removed.
    pub fn prune_old_backups(&self) -> Result<usize, BackupError> {
        self.prune_old_backups_at(Utc::now())
    }

    pub(crate) fn prune_old_backups_at(&self, now: DateTime<Utc>) -> Result<usize, BackupError> {
        if !self.backup_dir.exists() {
            return Ok(0);
        }

        let mut pruned = 0usize;
        for dir_entry in fs::read_dir(&self.backup_dir)? {
            let partition_dir = dir_entry?.path();
            if !partition_dir.is_dir() {
                continue;
            }
            let partition = match partition_dir.file_name().and_then(|n| n.to_str()) {
                Some(name) => PartitionId::new(name),
                None => continue,
            };

            for version in self.list_versions(&partition)? {
                let manifest = match self.read_manifest(&partition, version) {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        slog::warn!(
                            self.logger,
                            "Unreadable manifest for {:?} v{}: {:?}",
                            partition,
                            version,
                            e,
                        );
                        continue;
                    }
                };

                if now.signed_duration_since(manifest.created_at) > self.retention {
                    let dir = self.partition_dir(&partition);
                    let _ = fs::remove_file(dir.join(format!("{}.bak", version)));
                    let _ = fs::remove_file(dir.join(format!("{}.meta.json", version)));
                    pruned += 1;
                    slog::info!(self.logger, "Pruned backup {:?} v{}", partition, version);
                }
            }
        }

        Ok(pruned)
    }

    /// Background loop: periodic backups of every locally-owned partition,
    /// then retention pruning.
    pub fn spawn_backup_loop<F>(
        self: &Arc<Self>,
        interval: tokio::time::Duration,
        local_node: NodeId,
        owned_partitions: F,
    ) -> BackupLoopHandle
    where
        F: Fn() -> Vec<PartitionId> + Send + 'static,
    {
        let (stopper, stop_check) = background::stop_signal();
        let manager = self.clone();

        tokio::task::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if stop_check.should_stop() {
                    return;
                }

                for partition in owned_partitions() {
                    if let Err(e) = manager.create_backup(&local_node, &partition) {
                        slog::warn!(manager.logger, "Periodic backup of {:?} failed: {:?}", partition, e);
                    }
                }
                if let Err(e) = manager.prune_old_backups() {
                    slog::warn!(manager.logger, "Backup pruning failed: {:?}", e);
                }
            }
        });

        BackupLoopHandle { _stopper: stopper }
    }

    fn partition_dir(&self, partition: &PartitionId) -> PathBuf {
        self.backup_dir.join(partition.as_str())
    }

    fn read_manifest(&self, partition: &PartitionId, version: u64) -> Result<BackupManifest, BackupError> {
        let path = self.partition_dir(partition).join(format!("{}.meta.json", version));
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    fn latest_version(&self, partition: &PartitionId) -> Result<Option<u64>, BackupError> {
        Ok(self.list_versions(partition)?.last().copied())
    }

    /// Versions with a manifest on disk, ascending.
    fn list_versions(&self, partition: &PartitionId) -> Result<Vec<u64>, BackupError> {
        let dir = self.partition_dir(partition);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut versions = Vec::new();
        for dir_entry in fs::read_dir(dir)? {
            let name = dir_entry?.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if let Some(version_str) = name.strip_suffix(".meta.json") {
                if let Ok(version) = version_str.parse::<u64>() {
                    versions.push(version);
                }
            }
        }
        versions.sort();

        Ok(versions)
    }
}

fn calculate_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::InMemoryPartitionStore;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    struct Fixture {
        manager: Arc<RecoveryManager>,
        store: Arc<InMemoryPartitionStore>,
        dir: PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn fixture(tag: &str) -> Fixture {
        let mut dir = std::env::temp_dir();
        dir.push(format!("lakegrid-backup-{}-{:016x}", tag, rand::random::<u64>()));

        let store = Arc::new(InMemoryPartitionStore::new());
        let manager = Arc::new(RecoveryManager::new(
            test_logger(),
            dir.clone(),
            store.clone(),
            Duration::days(7),
        ));

        Fixture { manager, store, dir }
    }

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn backup_restore_round_trip() {
        let f = fixture("roundtrip");
        let p = PartitionId::new("p1");
        let n = node("n1");
        f.store.write_all(&n, &p, Bytes::from_static(b"important data")).unwrap();

        let manifest = f.manager.create_backup(&n, &p).unwrap();
        assert_eq!(manifest.version, 1);
        assert_eq!(manifest.size_bytes, 14);

        // Lose the live copy, then restore it.
        f.store.remove(&n, &p).unwrap();
        let restored = f.manager.restore_partition(&n, &p, None).unwrap();
        assert_eq!(restored.version, 1);
        assert_eq!(
            f.store.read_all(&n, &p).unwrap().unwrap(),
            Bytes::from_static(b"important data")
        );
    }

    #[test]
    fn corrupted_backup_is_refused() {
        let f = fixture("corrupt");
        let p = PartitionId::new("p1");
        let n = node("n1");
        f.store.write_all(&n, &p, Bytes::from_static(b"precious")).unwrap();
        f.manager.create_backup(&n, &p).unwrap();
        f.store.remove(&n, &p).unwrap();

        // Flip one byte on disk.
        let backup_path = f.dir.join("p1").join("1.bak");
        let mut bytes = fs::read(&backup_path).unwrap();
        bytes[0] ^= 0xFF;
        fs::write(&backup_path, &bytes).unwrap();

        let err = f.manager.restore_partition(&n, &p, None).unwrap_err();
        assert!(matches!(err, BackupError::ChecksumMismatch { version: 1, .. }));
        // Nothing was applied.
        assert!(f.store.read_all(&n, &p).unwrap().is_none());
    }

    #[test]
    fn restore_falls_back_to_older_valid_version() {
        let f = fixture("fallback");
        let p = PartitionId::new("p1");
        let n = node("n1");

        f.store.write_all(&n, &p, Bytes::from_static(b"old state")).unwrap();
        f.manager.create_backup(&n, &p).unwrap();
        f.store.write_all(&n, &p, Bytes::from_static(b"new state")).unwrap();
        let v2 = f.manager.create_backup(&n, &p).unwrap();
        assert_eq!(v2.version, 2);

        // Corrupt only v2.
        let backup_path = f.dir.join("p1").join("2.bak");
        let mut bytes = fs::read(&backup_path).unwrap();
        bytes[0] ^= 0xFF;
        fs::write(&backup_path, &bytes).unwrap();

        let manifest = f.manager.restore_latest_valid(&n, &p).unwrap();
        assert_eq!(manifest.version, 1);
        assert_eq!(
            f.store.read_all(&n, &p).unwrap().unwrap(),
            Bytes::from_static(b"old state")
        );
    }

    #[test]
    fn no_backups_reports_nothing_available() {
        let f = fixture("none");
        let err = f
            .manager
            .restore_latest_valid(&node("n1"), &PartitionId::new("ghost"))
            .unwrap_err();
        assert!(matches!(err, BackupError::NoBackupAvailable(_)));
    }

    #[test]
    fn restore_from_replica_verifies_written_copy() {
        let f = fixture("replica");
        let p = PartitionId::new("p1");
        f.store
            .write_all(&node("n2"), &p, Bytes::from_static(b"replica copy"))
            .unwrap();

        let copied = f.manager.restore_from_replica(&p, &node("n2"), &node("n4")).unwrap();
        assert_eq!(copied, 12);
        assert_eq!(
            f.store.read_all(&node("n4"), &p).unwrap().unwrap(),
            Bytes::from_static(b"replica copy")
        );
    }

    #[test]
    fn retention_prunes_old_versions() {
        let f = fixture("prune");
        let p = PartitionId::new("p1");
        let n = node("n1");
        f.store.write_all(&n, &p, Bytes::from_static(b"data")).unwrap();
        f.manager.create_backup(&n, &p).unwrap();

        // Within retention: kept.
        assert_eq!(f.manager.prune_old_backups().unwrap(), 0);

        // Eight days later: pruned.
        let pruned = f
            .manager
            .prune_old_backups_at(Utc::now() + Duration::days(8))
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(f
            .manager
            .restore_partition(&n, &p, None)
            .is_err());
    }

    #[test]
    fn backup_state_tracks_latest_version() {
        let f = fixture("state");
        let p = PartitionId::new("p1");
        let n = node("n1");
        f.store.write_all(&n, &p, Bytes::from_static(b"v1")).unwrap();
        f.manager.create_backup(&n, &p).unwrap();
        f.store.write_all(&n, &p, Bytes::from_static(b"v2!")).unwrap();
        f.manager.create_backup(&n, &p).unwrap();

        let state = f.manager.backup_state(&p).unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(state.size_bytes, 3);
    }
}
