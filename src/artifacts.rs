//! Typed stage artifacts.
//!
//! Each pipeline stage declares the artifact keys it consumes and produces.
//! The record is typed per key, with an `extra` bag for anything a handler
//! wants to carry forward without a schema change.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Well-known artifact keys, used in stage declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKey {
    SnapshotName,
    VmdkPaths,
    Qcow2Path,
    S3Key,
    ScwSnapshotId,
    ScwImageId,
}

impl ArtifactKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKey::SnapshotName => "snapshot_name",
            ArtifactKey::VmdkPaths => "vmdk_paths",
            ArtifactKey::Qcow2Path => "qcow2_path",
            ArtifactKey::S3Key => "s3_key",
            ArtifactKey::ScwSnapshotId => "scw_snapshot_id",
            ArtifactKey::ScwImageId => "scw_image_id",
        }
    }

    /// Keys whose value is a path on the orchestration host. These are
    /// re-validated on resume (the files must still exist).
    pub fn is_file_backed(&self) -> bool {
        matches!(self, ArtifactKey::VmdkPaths | ArtifactKey::Qcow2Path)
    }
}

/// Artifacts produced so far by a migration, persisted with its state.
///
/// Also serves as the patch type returned by stage handlers: `None` fields
/// are left untouched on merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    /// vSphere-side snapshot reserved for this migration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmdk_paths: Option<Vec<PathBuf>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qcow2_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scw_snapshot_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scw_image_id: Option<String>,
    /// Forward-compatible bag for handler-private values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Artifacts {
    pub fn has(&self, key: ArtifactKey) -> bool {
        match key {
            ArtifactKey::SnapshotName => self.snapshot_name.is_some(),
            ArtifactKey::VmdkPaths => self.vmdk_paths.is_some(),
            ArtifactKey::Qcow2Path => self.qcow2_path.is_some(),
            ArtifactKey::S3Key => self.s3_key.is_some(),
            ArtifactKey::ScwSnapshotId => self.scw_snapshot_id.is_some(),
            ArtifactKey::ScwImageId => self.scw_image_id.is_some(),
        }
    }

    pub fn clear(&mut self, key: ArtifactKey) {
        match key {
            ArtifactKey::SnapshotName => self.snapshot_name = None,
            ArtifactKey::VmdkPaths => self.vmdk_paths = None,
            ArtifactKey::Qcow2Path => self.qcow2_path = None,
            ArtifactKey::S3Key => self.s3_key = None,
            ArtifactKey::ScwSnapshotId => self.scw_snapshot_id = None,
            ArtifactKey::ScwImageId => self.scw_image_id = None,
        }
    }

    /// Merge a handler-produced patch into this record. Set fields win;
    /// `extra` entries are merged key-by-key.
    pub fn merge(&mut self, patch: Artifacts) {
        if patch.snapshot_name.is_some() {
            self.snapshot_name = patch.snapshot_name;
        }
        if patch.vmdk_paths.is_some() {
            self.vmdk_paths = patch.vmdk_paths;
        }
        if patch.qcow2_path.is_some() {
            self.qcow2_path = patch.qcow2_path;
        }
        if patch.s3_key.is_some() {
            self.s3_key = patch.s3_key;
        }
        if patch.scw_snapshot_id.is_some() {
            self.scw_snapshot_id = patch.scw_snapshot_id;
        }
        if patch.scw_image_id.is_some() {
            self.scw_image_id = patch.scw_image_id;
        }
        self.extra.extend(patch.extra);
    }

    /// Keys currently present, in declaration order.
    pub fn keys(&self) -> Vec<ArtifactKey> {
        use ArtifactKey::*;
        [SnapshotName, VmdkPaths, Qcow2Path, S3Key, ScwSnapshotId, ScwImageId]
            .into_iter()
            .filter(|k| self.has(*k))
            .collect()
    }

    /// All file-backed paths currently recorded.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Some(paths) = &self.vmdk_paths {
            out.extend(paths.iter().cloned());
        }
        if let Some(p) = &self.qcow2_path {
            out.push(p.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_unset_fields() {
        let mut a = Artifacts {
            snapshot_name: Some("vmshift-abc".into()),
            ..Default::default()
        };
        a.merge(Artifacts {
            qcow2_path: Some(PathBuf::from("/work/abc/disk.qcow2")),
            ..Default::default()
        });
        assert_eq!(a.snapshot_name.as_deref(), Some("vmshift-abc"));
        assert!(a.has(ArtifactKey::Qcow2Path));
        assert!(!a.has(ArtifactKey::S3Key));
    }

    #[test]
    fn extra_bag_round_trips() {
        let mut a = Artifacts::default();
        a.extra.insert("scw_snapshot_ids".into(), serde_json::json!(["snap-1", "snap-2"]));
        let json = serde_json::to_string(&a).unwrap();
        let back: Artifacts = serde_json::from_str(&json).unwrap();
        assert_eq!(back.extra["scw_snapshot_ids"], serde_json::json!(["snap-1", "snap-2"]));
    }

    #[test]
    fn unset_fields_are_not_serialized() {
        let a = Artifacts::default();
        assert_eq!(serde_json::to_string(&a).unwrap(), "{}");
    }
}
