//! Cloud-provider interface: snapshot import, image creation, and the
//! instance-type listing used to reconcile the built-in catalogue.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::catalog::InstanceType;
use crate::error::{Result, VmshiftError};

/// Lifecycle of a cloud-side snapshot import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Importing,
    Available,
    Error,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Import an object-storage qcow2 as a volume snapshot. Implementations
    /// look up an existing snapshot of the same name first, making retries
    /// with an idempotency-derived name safe.
    async fn create_snapshot_from_object(
        &self,
        zone: &str,
        name: &str,
        bucket: &str,
        key: &str,
        volume_type: &str,
    ) -> Result<String>;

    async fn snapshot_status(&self, zone: &str, snapshot_id: &str) -> Result<SnapshotStatus>;

    async fn create_image(
        &self,
        zone: &str,
        name: &str,
        root_snapshot_id: &str,
        arch: &str,
    ) -> Result<String>;

    async fn get_image(&self, zone: &str, image_id: &str) -> Result<Option<String>>;

    async fn list_instance_types(&self, zone: &str) -> Result<Vec<InstanceType>>;
}

/// Poll until the snapshot import finishes, at the configured cadence and
/// bounded by the configured maximum wait.
pub async fn wait_snapshot(
    provider: &dyn CloudProvider,
    zone: &str,
    snapshot_id: &str,
    poll: Duration,
    max_wait: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        match provider.snapshot_status(zone, snapshot_id).await? {
            SnapshotStatus::Available => return Ok(()),
            SnapshotStatus::Error => {
                return Err(VmshiftError::FatalStage(format!(
                    "snapshot {snapshot_id} entered error state"
                )));
            }
            SnapshotStatus::Importing => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(VmshiftError::TransientInfra(format!(
                "snapshot {snapshot_id} not ready after {}s",
                max_wait.as_secs()
            )));
        }
        tokio::time::sleep(poll).await;
    }
}

/// In-memory provider for tests and dry runs. Snapshots become available
/// immediately.
#[derive(Default)]
pub struct MockCloudProvider {
    snapshots: Mutex<HashMap<String, String>>,
    images: Mutex<HashMap<String, String>>,
}

impl MockCloudProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CloudProvider for MockCloudProvider {
    async fn create_snapshot_from_object(
        &self,
        zone: &str,
        name: &str,
        _bucket: &str,
        _key: &str,
        _volume_type: &str,
    ) -> Result<String> {
        let mut snaps = self.snapshots.lock().unwrap();
        let id = snaps
            .entry(format!("{zone}/{name}"))
            .or_insert_with(|| format!("scw-snap-{name}"));
        Ok(id.clone())
    }

    async fn snapshot_status(&self, _zone: &str, _snapshot_id: &str) -> Result<SnapshotStatus> {
        Ok(SnapshotStatus::Available)
    }

    async fn create_image(
        &self,
        zone: &str,
        name: &str,
        root_snapshot_id: &str,
        _arch: &str,
    ) -> Result<String> {
        let mut images = self.images.lock().unwrap();
        let id = images
            .entry(format!("{zone}/{name}/{root_snapshot_id}"))
            .or_insert_with(|| format!("scw-img-{name}"));
        Ok(id.clone())
    }

    async fn get_image(&self, _zone: &str, image_id: &str) -> Result<Option<String>> {
        let images = self.images.lock().unwrap();
        Ok(images
            .values()
            .find(|v| v.as_str() == image_id)
            .map(|_| "available".to_string()))
    }

    async fn list_instance_types(&self, _zone: &str) -> Result<Vec<InstanceType>> {
        Ok(Vec::new())
    }
}
