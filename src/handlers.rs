//! Default stage handlers.
//!
//! Each handler drives one external collaborator through its trait and
//! returns the artifacts it produced. All of them tolerate re-invocation
//! over partial outputs: existing snapshots, exports, conversions and
//! uploads are validated and reused instead of redone.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::artifacts::Artifacts;
use crate::catalog::Catalog;
use crate::convert::DiskConverter;
use crate::error::{StageError, VmshiftError};
use crate::object_storage::ObjectStorage;
use crate::scaleway::{wait_snapshot, CloudProvider};
use crate::stages::{StageContext, StageHandler, StageRegistry};
use crate::types::{Firmware, OsFamily};
use crate::vsphere::VSphereClient;

/// Map a collaborator error onto the stage failure taxonomy.
fn stage_err(e: VmshiftError) -> StageError {
    match e {
        VmshiftError::TransientInfra(m) => StageError::transient(m),
        VmshiftError::Artifact(m) => StageError::artifact(m),
        VmshiftError::FatalStage(m) => StageError::fatal(m),
        VmshiftError::Cancelled => StageError::cancelled(),
        VmshiftError::Io(e) => StageError::transient(e.to_string()),
        other => StageError::fatal(other.to_string()),
    }
}

const MAX_VOLUME_GB: f64 = 10_000.0;

/// Pre-flight validation against the catalogue and the VM's own shape.
pub struct ValidateStage {
    catalog: Arc<Catalog>,
}

#[async_trait]
impl StageHandler for ValidateStage {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Artifacts, StageError> {
        let vm = &ctx.planned.vm;

        if vm.guest_os_family == OsFamily::Other {
            return Err(StageError::preflight(format!(
                "guest OS '{}' is not supported for migration",
                vm.guest_os_full
            )));
        }
        if vm.has_rdm_disk() {
            return Err(StageError::preflight(
                "VM has raw device mapping disks; RDM is not migratable",
            ));
        }
        if let Some(disk) = vm.disks.iter().find(|d| d.size_gb > MAX_VOLUME_GB) {
            return Err(StageError::preflight(format!(
                "disk '{}' is {:.0} GiB; the block-storage limit is {MAX_VOLUME_GB:.0} GiB",
                disk.path, disk.size_gb
            )));
        }
        if vm.disks.iter().any(|d| d.is_shared) {
            return Err(StageError::preflight(
                "VM has shared disks; multi-writer volumes are not migratable",
            ));
        }

        let target = self.catalog.get(&ctx.planned.target_type).ok_or_else(|| {
            StageError::preflight(format!(
                "target type '{}' not in catalogue",
                ctx.planned.target_type
            ))
        })?;
        if target.vcpus < vm.cpu_count {
            return Err(StageError::preflight(format!(
                "target {} has {} vCPU, VM needs {}",
                target.id, target.vcpus, vm.cpu_count
            )));
        }
        if target.ram_gb < vm.memory_gb() {
            return Err(StageError::preflight(format!(
                "target {} has {:.0} GiB RAM, VM needs {:.1}",
                target.id, target.ram_gb, vm.memory_gb()
            )));
        }
        if vm.guest_os_family == OsFamily::Windows && !target.windows_allowed {
            return Err(StageError::preflight(format!(
                "target {} is not Windows-allowed",
                target.id
            )));
        }
        if (vm.disks.len() as u32) > target.max_volumes {
            return Err(StageError::preflight(format!(
                "VM has {} disks, target {} allows {}",
                vm.disks.len(),
                target.id,
                target.max_volumes
            )));
        }
        if vm.snapshot_names.len() > 3 {
            warn!(
                vm = %vm.name,
                "VM carries {} snapshots; consider consolidating before export",
                vm.snapshot_names.len()
            );
        }

        debug!(vm = %vm.name, target = %target.id, "preflight checks passed");
        Ok(Artifacts::default())
    }
}

/// Reserve a consistency snapshot named after the migration id.
pub struct SnapshotStage {
    vsphere: Arc<dyn VSphereClient>,
}

#[async_trait]
impl StageHandler for SnapshotStage {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Artifacts, StageError> {
        let vm = &ctx.planned.vm;
        let name = ctx
            .state
            .artifacts
            .snapshot_name
            .clone()
            .unwrap_or_else(|| format!("vmshift-{}", ctx.state.migration_id));
        // create_snapshot reuses an existing snapshot of the reserved name.
        let snapshot_id = self
            .vsphere
            .create_snapshot(&vm.uuid, &name, true)
            .await
            .map_err(stage_err)?;

        let mut artifacts = Artifacts {
            snapshot_name: Some(name),
            ..Default::default()
        };
        artifacts
            .extra
            .insert("vsphere_snapshot_id".into(), json!(snapshot_id));
        Ok(artifacts)
    }
}

/// Export the VM's disks over NFC into the migration's work directory.
pub struct ExportStage {
    vsphere: Arc<dyn VSphereClient>,
}

#[async_trait]
impl StageHandler for ExportStage {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Artifacts, StageError> {
        let snapshot_id = ctx
            .state
            .artifacts
            .extra
            .get("vsphere_snapshot_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StageError::artifact("snapshot id missing from artifacts"))?;

        let paths = self
            .vsphere
            .export_vmdks(&ctx.planned.vm.uuid, snapshot_id, &ctx.vm_dir)
            .await
            .map_err(stage_err)?;
        if paths.is_empty() {
            return Err(StageError::fatal("export produced no VMDK files"));
        }
        info!(vm = %ctx.planned.vm.name, disks = paths.len(), "exported VMDKs");
        Ok(Artifacts {
            vmdk_paths: Some(paths),
            ..Default::default()
        })
    }
}

/// Convert every exported VMDK to qcow2; the boot disk becomes the image
/// root.
pub struct ConvertStage {
    converter: Arc<dyn DiskConverter>,
}

#[async_trait]
impl StageHandler for ConvertStage {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Artifacts, StageError> {
        let vmdks = ctx
            .state
            .artifacts
            .vmdk_paths
            .clone()
            .ok_or_else(|| StageError::artifact("vmdk_paths missing"))?;

        let compress = ctx.config.conversion.compress_qcow2;
        let mut qcow2_paths: Vec<PathBuf> = Vec::with_capacity(vmdks.len());
        for vmdk in &vmdks {
            let output = vmdk.with_extension("qcow2");
            self.converter
                .convert_to_qcow2(vmdk, &output, compress)
                .await
                .map_err(stage_err)?;
            qcow2_paths.push(output);
        }

        let boot = qcow2_paths[0].clone();
        let mut artifacts = Artifacts {
            qcow2_path: Some(boot),
            ..Default::default()
        };
        artifacts
            .extra
            .insert("qcow2_paths".into(), json!(qcow2_paths));
        Ok(artifacts)
    }
}

fn boot_disk(ctx: &StageContext) -> std::result::Result<PathBuf, StageError> {
    ctx.state
        .artifacts
        .qcow2_path
        .clone()
        .ok_or_else(|| StageError::artifact("qcow2_path missing"))
}

/// Linux guest adaptation: serial console, VMware tools removal.
pub struct AdaptGuestStage {
    converter: Arc<dyn DiskConverter>,
}

#[async_trait]
impl StageHandler for AdaptGuestStage {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Artifacts, StageError> {
        self.converter
            .adapt_guest(&boot_disk(ctx)?, ctx.planned.vm.guest_os_family)
            .await
            .map_err(stage_err)?;
        Ok(Artifacts::default())
    }
}

/// Windows: remove VMware tools from the offline image.
pub struct CleanToolsStage {
    converter: Arc<dyn DiskConverter>,
}

#[async_trait]
impl StageHandler for CleanToolsStage {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Artifacts, StageError> {
        self.converter
            .clean_tools(&boot_disk(ctx)?)
            .await
            .map_err(stage_err)?;
        Ok(Artifacts::default())
    }
}

/// Windows: stage VirtIO drivers from the configured ISO.
pub struct InjectVirtioStage {
    converter: Arc<dyn DiskConverter>,
}

#[async_trait]
impl StageHandler for InjectVirtioStage {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Artifacts, StageError> {
        let iso = ctx
            .config
            .conversion
            .virtio_win_iso
            .clone()
            .ok_or_else(|| {
                StageError::fatal("virtio-win ISO not configured (conversion.virtio_win_iso)")
            })?;
        self.converter
            .inject_virtio(&boot_disk(ctx)?, &iso)
            .await
            .map_err(stage_err)?;
        Ok(Artifacts::default())
    }
}

/// Windows: adapt the bootloader for KVM.
pub struct FixBootloaderStage {
    converter: Arc<dyn DiskConverter>,
}

#[async_trait]
impl StageHandler for FixBootloaderStage {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Artifacts, StageError> {
        self.converter
            .fix_bootloader(&boot_disk(ctx)?)
            .await
            .map_err(stage_err)?;
        Ok(Artifacts::default())
    }
}

/// Convert BIOS images to UEFI boot; a no-op for native EFI sources unless
/// the plan forces the conversion.
pub struct EnsureUefiStage {
    converter: Arc<dyn DiskConverter>,
}

#[async_trait]
impl StageHandler for EnsureUefiStage {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Artifacts, StageError> {
        let effective = ctx.planned.force_firmware.unwrap_or(ctx.planned.vm.firmware);
        if effective == Firmware::Efi {
            debug!(vm = %ctx.planned.vm.name, "source already boots UEFI, skipping conversion");
            return Ok(Artifacts::default());
        }
        self.converter
            .ensure_uefi(&boot_disk(ctx)?, ctx.planned.vm.guest_os_family)
            .await
            .map_err(stage_err)?;
        Ok(Artifacts::default())
    }
}

/// Upload the converted image to the transit bucket, skipping an object
/// that is already there.
pub struct UploadS3Stage {
    storage: Arc<dyn ObjectStorage>,
}

#[async_trait]
impl StageHandler for UploadS3Stage {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Artifacts, StageError> {
        let qcow2 = boot_disk(ctx)?;
        let bucket = ctx.config.scaleway.s3_bucket.clone();
        let file_name = qcow2
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "disk.qcow2".to_string());
        let key = format!("vmshift/{}/{}", ctx.state.migration_id, file_name);

        if self
            .storage
            .exists(&bucket, &key)
            .await
            .map_err(stage_err)?
        {
            info!(%key, "object already uploaded, skipping");
        } else {
            let url = self
                .storage
                .upload(&qcow2, &bucket, &key, true)
                .await
                .map_err(stage_err)?;
            info!(%url, "uploaded qcow2");
        }
        Ok(Artifacts {
            s3_key: Some(key),
            ..Default::default()
        })
    }
}

/// Import the uploaded object as a cloud snapshot, wait for readiness, and
/// create the bootable image. The resource name doubles as the idempotency
/// key: retries find the prior snapshot/image instead of duplicating it.
pub struct ImportScwStage {
    cloud: Arc<dyn CloudProvider>,
}

#[async_trait]
impl StageHandler for ImportScwStage {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Artifacts, StageError> {
        let key = ctx
            .state
            .artifacts
            .s3_key
            .clone()
            .ok_or_else(|| StageError::artifact("s3_key missing"))?;
        let zone = &ctx.planned.zone;
        let name = format!("vmshift-{}", ctx.state.migration_id);
        let bucket = &ctx.config.scaleway.s3_bucket;

        let snapshot_id = self
            .cloud
            .create_snapshot_from_object(zone, &name, bucket, &key, "sbs_snapshot")
            .await
            .map_err(stage_err)?;

        let limits = &ctx.config.limits;
        wait_snapshot(
            self.cloud.as_ref(),
            zone,
            &snapshot_id,
            std::time::Duration::from_secs(limits.snapshot_poll_secs),
            std::time::Duration::from_secs(limits.snapshot_wait_max_secs),
        )
        .await
        .map_err(stage_err)?;

        let image_id = self
            .cloud
            .create_image(zone, &name, &snapshot_id, "x86_64")
            .await
            .map_err(stage_err)?;

        info!(vm = %ctx.planned.vm.name, %image_id, "image imported");
        Ok(Artifacts {
            scw_snapshot_id: Some(snapshot_id),
            scw_image_id: Some(image_id),
            ..Default::default()
        })
    }
}

/// Confirm the created image is actually visible and usable.
pub struct VerifyStage {
    cloud: Arc<dyn CloudProvider>,
}

#[async_trait]
impl StageHandler for VerifyStage {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Artifacts, StageError> {
        let image_id = ctx
            .state
            .artifacts
            .scw_image_id
            .clone()
            .ok_or_else(|| StageError::artifact("scw_image_id missing"))?;
        match self
            .cloud
            .get_image(&ctx.planned.zone, &image_id)
            .await
            .map_err(stage_err)?
        {
            Some(state) if state == "available" => Ok(Artifacts::default()),
            Some(state) => Err(StageError::transient(format!(
                "image {image_id} in state '{state}'"
            ))),
            None => Err(StageError::fatal(format!("image {image_id} not found"))),
        }
    }
}

/// Release source-side and transit resources on success. Artifacts stay on
/// failure so a resume can reuse them.
pub struct CleanupStage {
    vsphere: Arc<dyn VSphereClient>,
    storage: Arc<dyn ObjectStorage>,
}

#[async_trait]
impl StageHandler for CleanupStage {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Artifacts, StageError> {
        let artifacts = &ctx.state.artifacts;

        if let Some(snapshot_id) = artifacts
            .extra
            .get("vsphere_snapshot_id")
            .and_then(|v| v.as_str())
        {
            if let Err(e) = self
                .vsphere
                .delete_snapshot(&ctx.planned.vm.uuid, snapshot_id)
                .await
            {
                warn!(vm = %ctx.planned.vm.name, "failed to delete source snapshot: {e}");
            }
        }

        if let Some(key) = &artifacts.s3_key {
            if let Err(e) = self
                .storage
                .delete(&ctx.config.scaleway.s3_bucket, key)
                .await
            {
                warn!(%key, "failed to delete transit object: {e}");
            }
        }

        if !ctx.config.conversion.keep_intermediates {
            for path in artifacts.file_paths() {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), "failed to remove intermediate: {e}");
                    }
                }
            }
        }
        Ok(Artifacts::default())
    }
}

/// Clients every default handler set is built from.
pub struct HandlerClients {
    pub vsphere: Arc<dyn VSphereClient>,
    pub storage: Arc<dyn ObjectStorage>,
    pub cloud: Arc<dyn CloudProvider>,
    pub converter: Arc<dyn DiskConverter>,
    pub catalog: Arc<Catalog>,
}

/// Build the full registry for both OS families.
pub fn default_registry(clients: HandlerClients) -> StageRegistry {
    let mut registry = StageRegistry::new();
    registry
        .register_shared("validate", Arc::new(ValidateStage { catalog: clients.catalog }))
        .register_shared("snapshot", Arc::new(SnapshotStage { vsphere: clients.vsphere.clone() }))
        .register_shared("export", Arc::new(ExportStage { vsphere: clients.vsphere.clone() }))
        .register_shared("convert", Arc::new(ConvertStage { converter: clients.converter.clone() }))
        .register(
            OsFamily::Linux,
            "adapt_guest",
            Arc::new(AdaptGuestStage { converter: clients.converter.clone() }),
        )
        .register(
            OsFamily::Windows,
            "clean_tools",
            Arc::new(CleanToolsStage { converter: clients.converter.clone() }),
        )
        .register(
            OsFamily::Windows,
            "inject_virtio",
            Arc::new(InjectVirtioStage { converter: clients.converter.clone() }),
        )
        .register(
            OsFamily::Windows,
            "fix_bootloader",
            Arc::new(FixBootloaderStage { converter: clients.converter.clone() }),
        )
        .register_shared("ensure_uefi", Arc::new(EnsureUefiStage { converter: clients.converter }))
        .register_shared("upload_s3", Arc::new(UploadS3Stage { storage: clients.storage.clone() }))
        .register_shared("import_scw", Arc::new(ImportScwStage { cloud: clients.cloud.clone() }))
        .register_shared("verify", Arc::new(VerifyStage { cloud: clients.cloud }))
        .register_shared(
            "cleanup",
            Arc::new(CleanupStage {
                vsphere: clients.vsphere,
                storage: clients.storage,
            }),
        );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OsFamily;

    #[test]
    fn default_registry_covers_both_graphs() {
        let catalog = Arc::new(Catalog::builtin());
        let registry = default_registry(HandlerClients {
            vsphere: Arc::new(crate::vsphere::MockVSphereClient::new(vec![])),
            storage: Arc::new(crate::object_storage::MockObjectStorage::new()),
            cloud: Arc::new(crate::scaleway::MockCloudProvider::new()),
            converter: Arc::new(crate::convert::MockDiskConverter::new()),
            catalog,
        });
        assert!(registry.is_complete_for(OsFamily::Linux));
        assert!(registry.is_complete_for(OsFamily::Windows));
    }
}
