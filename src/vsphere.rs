//! vSphere client interface.
//!
//! The orchestrator consumes this trait; a real SOAP/NFC implementation
//! lives outside this crate. [`MockVSphereClient`] backs the test suite and
//! the `--mock` CLI flag.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Result, VmshiftError};
use crate::types::VMDescriptor;

#[async_trait]
pub trait VSphereClient: Send + Sync {
    /// Finite, restartable listing of VMs visible to the configured user.
    async fn list_vms(&self, filter_hint: Option<&str>) -> Result<Vec<VMDescriptor>>;

    /// Create a snapshot and return its id. Reuses an existing snapshot of
    /// the same name if one exists (idempotent).
    async fn create_snapshot(&self, vm_uuid: &str, name: &str, quiesce: bool) -> Result<String>;

    async fn delete_snapshot(&self, vm_uuid: &str, snapshot_id: &str) -> Result<()>;

    /// Export the VM's disks at the given snapshot into `dest_dir`,
    /// returning one path per disk in disk order.
    async fn export_vmdks(
        &self,
        vm_uuid: &str,
        snapshot_id: &str,
        dest_dir: &Path,
    ) -> Result<Vec<PathBuf>>;

    async fn tag_vm(&self, vm_uuid: &str, tag: &str) -> Result<()>;

    async fn power_off(&self, vm_uuid: &str) -> Result<()>;
}

/// In-memory vSphere backend for tests and dry runs.
pub struct MockVSphereClient {
    inventory: Vec<VMDescriptor>,
    snapshots: Mutex<HashMap<String, String>>,
    tags: Mutex<Vec<(String, String)>>,
}

impl MockVSphereClient {
    pub fn new(inventory: Vec<VMDescriptor>) -> Self {
        Self {
            inventory,
            snapshots: Mutex::new(HashMap::new()),
            tags: Mutex::new(Vec::new()),
        }
    }

    fn vm(&self, vm_uuid: &str) -> Result<&VMDescriptor> {
        self.inventory
            .iter()
            .find(|vm| vm.uuid == vm_uuid)
            .ok_or_else(|| VmshiftError::Validation(format!("unknown vm uuid '{vm_uuid}'")))
    }
}

#[async_trait]
impl VSphereClient for MockVSphereClient {
    async fn list_vms(&self, _filter_hint: Option<&str>) -> Result<Vec<VMDescriptor>> {
        Ok(self.inventory.clone())
    }

    async fn create_snapshot(&self, vm_uuid: &str, name: &str, _quiesce: bool) -> Result<String> {
        self.vm(vm_uuid)?;
        let key = format!("{vm_uuid}/{name}");
        let mut snaps = self.snapshots.lock().unwrap();
        let id = snaps
            .entry(key)
            .or_insert_with(|| format!("snap-{vm_uuid}-{name}"));
        Ok(id.clone())
    }

    async fn delete_snapshot(&self, vm_uuid: &str, snapshot_id: &str) -> Result<()> {
        self.snapshots
            .lock()
            .unwrap()
            .retain(|k, v| !(k.starts_with(vm_uuid) && v == snapshot_id));
        Ok(())
    }

    async fn export_vmdks(
        &self,
        vm_uuid: &str,
        _snapshot_id: &str,
        dest_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let vm = self.vm(vm_uuid)?;
        tokio::fs::create_dir_all(dest_dir).await?;
        let mut paths = Vec::new();
        for (i, disk) in vm.disks.iter().enumerate() {
            let path = dest_dir.join(format!("disk-{i}.vmdk"));
            // Skip rewriting an existing export, matching the real client's
            // size-based skip behavior.
            if !path.exists() {
                tokio::fs::write(&path, format!("vmdk:{}:{}", vm.name, disk.path)).await?;
            }
            paths.push(path);
        }
        Ok(paths)
    }

    async fn tag_vm(&self, vm_uuid: &str, tag: &str) -> Result<()> {
        self.tags
            .lock()
            .unwrap()
            .push((vm_uuid.to_string(), tag.to_string()));
        Ok(())
    }

    async fn power_off(&self, _vm_uuid: &str) -> Result<()> {
        Ok(())
    }
}
