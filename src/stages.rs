//! Stage registry: the fixed per-OS stage graphs, each stage's declared
//! artifacts, semaphores, and timeout, and the handler contract.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::artifacts::{ArtifactKey, Artifacts};
use crate::config::AppConfig;
use crate::error::StageError;
use crate::plan::PlannedVm;
use crate::semaphore::ResourceClass;
use crate::state::MigrationState;
use crate::types::OsFamily;

/// Static declaration of one pipeline stage.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: &'static str,
    /// Artifact keys that must exist before the stage runs.
    pub inputs: &'static [ArtifactKey],
    /// Artifact keys the stage sets on success.
    pub outputs: &'static [ArtifactKey],
    /// Resource classes acquired for the duration of the stage. `Global`
    /// is never listed here; the pipeline holds it for its whole lifetime.
    pub semaphores: &'static [ResourceClass],
    pub retryable: bool,
    /// Whether the stage may be re-invoked over partial outputs.
    pub rerun_after_partial: bool,
    pub timeout: Duration,
}

use ArtifactKey::{Qcow2Path, S3Key, ScwImageId, ScwSnapshotId, SnapshotName, VmdkPaths};
use ResourceClass::{DiskIo, PerEsxiHost, S3Upload, ScwApi};

macro_rules! stage {
    ($name:literal, [$($in:expr),*], [$($out:expr),*], [$($sem:expr),*], $retry:expr, $partial:expr, $mins:expr) => {
        StageSpec {
            name: $name,
            inputs: &[$($in),*],
            outputs: &[$($out),*],
            semaphores: &[$($sem),*],
            retryable: $retry,
            rerun_after_partial: $partial,
            timeout: Duration::from_secs(60 * $mins),
        }
    };
}

/// Linux pipeline: ten stages.
pub static LINUX_STAGES: &[StageSpec] = &[
    stage!("validate", [], [], [ScwApi], false, true, 5),
    stage!("snapshot", [], [SnapshotName], [ScwApi], true, true, 15),
    stage!("export", [SnapshotName], [VmdkPaths], [PerEsxiHost], true, true, 240),
    stage!("convert", [VmdkPaths], [Qcow2Path], [DiskIo], true, true, 120),
    stage!("adapt_guest", [Qcow2Path], [], [DiskIo], false, true, 30),
    stage!("ensure_uefi", [Qcow2Path], [], [DiskIo], false, true, 30),
    stage!("upload_s3", [Qcow2Path], [S3Key], [S3Upload], true, true, 240),
    stage!("import_scw", [S3Key], [ScwSnapshotId, ScwImageId], [ScwApi], true, true, 60),
    stage!("verify", [ScwImageId], [], [ScwApi], true, true, 10),
    stage!("cleanup", [], [], [ScwApi], true, true, 15),
];

/// Windows pipeline: twelve stages (tools removal, VirtIO injection and
/// bootloader fixing replace the single Linux adaptation stage).
pub static WINDOWS_STAGES: &[StageSpec] = &[
    stage!("validate", [], [], [ScwApi], false, true, 5),
    stage!("snapshot", [], [SnapshotName], [ScwApi], true, true, 15),
    stage!("export", [SnapshotName], [VmdkPaths], [PerEsxiHost], true, true, 240),
    stage!("convert", [VmdkPaths], [Qcow2Path], [DiskIo], true, true, 120),
    stage!("clean_tools", [Qcow2Path], [], [DiskIo], false, true, 30),
    stage!("inject_virtio", [Qcow2Path], [], [DiskIo], false, true, 45),
    stage!("fix_bootloader", [Qcow2Path], [], [DiskIo], false, true, 30),
    stage!("ensure_uefi", [Qcow2Path], [], [DiskIo], false, true, 45),
    stage!("upload_s3", [Qcow2Path], [S3Key], [S3Upload], true, true, 240),
    stage!("import_scw", [S3Key], [ScwSnapshotId, ScwImageId], [ScwApi], true, true, 60),
    stage!("verify", [ScwImageId], [], [ScwApi], true, true, 10),
    stage!("cleanup", [], [], [ScwApi], true, true, 15),
];

/// The stage list for a guest OS family. `Other` is rejected at planning
/// time; callers never reach this with it.
pub fn stages_for(os: OsFamily) -> &'static [StageSpec] {
    match os {
        OsFamily::Windows => WINDOWS_STAGES,
        _ => LINUX_STAGES,
    }
}

pub fn stage_spec(os: OsFamily, name: &str) -> Option<&'static StageSpec> {
    stages_for(os).iter().find(|s| s.name == name)
}

/// Everything a handler may read. Handlers must not persist state or touch
/// `completed_stages`; the executor owns both.
#[derive(Clone)]
pub struct StageContext {
    pub planned: PlannedVm,
    pub state: MigrationState,
    pub config: Arc<AppConfig>,
    /// Per-migration scratch directory, `{work_dir}/work/{migration_id}`.
    pub vm_dir: PathBuf,
    pub cancel: CancellationToken,
}

/// Contract for one stage implementation.
///
/// On success the handler returns the artifacts it produced (a patch; the
/// executor merges it). On failure it returns a structured [`StageError`].
/// Handlers tolerate re-invocation over partial outputs.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(&self, ctx: &StageContext) -> std::result::Result<Artifacts, StageError>;
}

/// Maps `(os_family, stage name)` to a handler.
#[derive(Default)]
pub struct StageRegistry {
    handlers: HashMap<(OsFamily, &'static str), Arc<dyn StageHandler>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one OS family.
    pub fn register(
        &mut self,
        os: OsFamily,
        name: &'static str,
        handler: Arc<dyn StageHandler>,
    ) -> &mut Self {
        self.handlers.insert((os, name), handler);
        self
    }

    /// Register the same handler for both migratable families.
    pub fn register_shared(&mut self, name: &'static str, handler: Arc<dyn StageHandler>) -> &mut Self {
        self.handlers.insert((OsFamily::Linux, name), handler.clone());
        self.handlers.insert((OsFamily::Windows, name), handler);
        self
    }

    pub fn handler(&self, os: OsFamily, name: &str) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&(os, name)).cloned()
    }

    /// Every stage in the family's graph has a registered handler.
    pub fn is_complete_for(&self, os: OsFamily) -> bool {
        stages_for(os)
            .iter()
            .all(|s| self.handlers.contains_key(&(os, s.name)))
    }
}
