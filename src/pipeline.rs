//! Per-VM pipeline executor.
//!
//! Runs the stage graph for one VM in strict order: skip stages already in
//! `completed_stages`, acquire each stage's semaphores in the fixed global
//! order, invoke the handler with timeout and retry, and persist state at
//! every stage boundary. The executor owns all state transitions; handlers
//! only compute.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifacts::Artifacts;
use crate::config::AppConfig;
use crate::dashboard::{BatchEvent, EventSender};
use crate::error::{Result, StageError, StageErrorKind};
use crate::plan::PlannedVm;
use crate::scrub::scrub;
use crate::semaphore::ResourceSemaphores;
use crate::stages::{stages_for, StageContext, StageRegistry, StageSpec};
use crate::state::{LastError, MigrationState, StateStore, VmMigrationStatus};

pub struct PipelineExecutor {
    pub registry: Arc<StageRegistry>,
    pub semaphores: Arc<ResourceSemaphores>,
    pub store: Arc<StateStore>,
    pub config: Arc<AppConfig>,
    pub events: EventSender,
    pub cancel: CancellationToken,
}

impl PipelineExecutor {
    /// Run (or resume) the pipeline for one VM. Returns the VM's terminal
    /// status; infrastructure errors around state persistence bubble up.
    pub async fn run_vm(&self, batch_id: &str, planned: &PlannedVm) -> Result<VmMigrationStatus> {
        let migration_id = crate::state::migration_id(batch_id, &planned.vm.uuid);
        let vm_dir = self.config.vm_work_dir(&migration_id);

        let mut state = self
            .store
            .update_vm(batch_id, &migration_id, |vm| {
                vm.status = VmMigrationStatus::Running;
                vm.attempts += 1;
                vm.last_error = None;
            })
            .await?;

        // Resume safety: a completed stage whose file-backed artifacts
        // disappeared re-runs from scratch.
        state = self.revalidate_artifacts(batch_id, &state, planned).await?;

        let stages = stages_for(planned.vm.guest_os_family);
        for (index, spec) in stages.iter().enumerate() {
            if state.is_stage_complete(spec.name) {
                debug!(vm = %planned.vm.name, stage = spec.name, "already complete, skipping");
                continue;
            }

            if self.cancel.is_cancelled() {
                return self
                    .record_failure(batch_id, &migration_id, planned, spec, StageError::cancelled())
                    .await;
            }

            state = self
                .store
                .update_vm(batch_id, &migration_id, |vm| {
                    vm.current_stage = Some(spec.name.to_string());
                })
                .await?;

            self.events.emit(BatchEvent::StageStarted {
                vm_name: planned.vm.name.clone(),
                stage: spec.name.to_string(),
            });

            let ctx = StageContext {
                planned: planned.clone(),
                state: state.clone(),
                config: self.config.clone(),
                vm_dir: vm_dir.clone(),
                cancel: self.cancel.child_token(),
            };

            let started = std::time::Instant::now();
            let outcome = self.run_stage_with_retry(spec, &ctx, planned).await;
            let secs = started.elapsed().as_secs_f64();

            match outcome {
                Ok(patch) => {
                    state = self
                        .store
                        .update_vm(batch_id, &migration_id, |vm| {
                            vm.artifacts.merge(patch.clone());
                            vm.completed_stages.push(spec.name.to_string());
                            vm.stage_secs.insert(spec.name.to_string(), secs);
                            vm.current_stage = None;
                        })
                        .await?;
                    self.write_stage_log(&vm_dir, index, spec.name, &format!("ok in {secs:.1}s"))
                        .await;
                    self.events.emit(BatchEvent::StageCompleted {
                        vm_name: planned.vm.name.clone(),
                        stage: spec.name.to_string(),
                        secs,
                    });
                }
                Err(e) => {
                    self.write_stage_log(
                        &vm_dir,
                        index,
                        spec.name,
                        &format!("failed ({}): {}", e.kind, e.message),
                    )
                    .await;
                    return self
                        .record_failure(batch_id, &migration_id, planned, spec, e)
                        .await;
                }
            }
        }

        self.store
            .update_vm(batch_id, &migration_id, |vm| {
                vm.status = VmMigrationStatus::Completed;
                vm.finished_at = Some(chrono::Utc::now());
                vm.current_stage = None;
            })
            .await?;
        info!(vm = %planned.vm.name, %migration_id, "pipeline complete");
        self.events.emit(BatchEvent::VmCompleted {
            vm_name: planned.vm.name.clone(),
        });
        Ok(VmMigrationStatus::Completed)
    }

    /// Invoke the handler under its semaphores, with the registry timeout,
    /// retrying transient failures with exponential backoff.
    async fn run_stage_with_retry(
        &self,
        spec: &StageSpec,
        ctx: &StageContext,
        planned: &PlannedVm,
    ) -> std::result::Result<Artifacts, StageError> {
        let handler = self
            .registry
            .handler(planned.vm.guest_os_family, spec.name)
            .ok_or_else(|| {
                StageError::fatal(format!(
                    "no handler registered for ({}, {})",
                    planned.vm.guest_os_family, spec.name
                ))
            })?;

        for input in spec.inputs {
            if !ctx.state.artifacts.has(*input) {
                return Err(StageError::artifact(format!(
                    "required artifact '{}' missing before stage '{}'",
                    input.as_str(),
                    spec.name
                )));
            }
        }

        let limits = &self.config.limits;
        let max_attempts = limits.retry_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            // Semaphores are held only while the handler runs; a backoff
            // sleep must not hold a slot. Waiting for a permit is a
            // cancellation point.
            let _permits = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(StageError::cancelled()),
                permits = self.semaphores.acquire(spec.semaphores, &planned.vm.host) => {
                    permits.map_err(|_| StageError::cancelled())?
                }
            };

            let result = match timeout(spec.timeout, handler.run(ctx)).await {
                Ok(r) => r,
                Err(_) => Err(StageError {
                    kind: StageErrorKind::TransientInfra,
                    message: format!(
                        "stage '{}' timed out after {}s",
                        spec.name,
                        spec.timeout.as_secs()
                    ),
                    retryable: spec.retryable,
                }),
            };

            match result {
                Ok(patch) => return Ok(patch),
                Err(e) if e.retryable && spec.retryable && attempt < max_attempts => {
                    let delay = backoff_delay(
                        attempt,
                        limits.retry_backoff_base_secs,
                        limits.retry_backoff_cap_secs,
                    );
                    warn!(
                        vm = %planned.vm.name,
                        stage = spec.name,
                        attempt,
                        "retrying in {}s: {}",
                        delay.as_secs(),
                        e.message
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Check completed stages' artifacts; discard anything whose files are
    /// gone so those stages re-run from scratch.
    async fn revalidate_artifacts(
        &self,
        batch_id: &str,
        state: &MigrationState,
        planned: &PlannedVm,
    ) -> Result<MigrationState> {
        if state.completed_stages.is_empty() {
            return Ok(state.clone());
        }

        let mut invalid_stages: Vec<String> = Vec::new();
        for spec in stages_for(planned.vm.guest_os_family) {
            if !state.is_stage_complete(spec.name) {
                continue;
            }
            for key in spec.outputs {
                if !key.is_file_backed() || !state.artifacts.has(*key) {
                    continue;
                }
                let missing = match key {
                    crate::artifacts::ArtifactKey::VmdkPaths => state
                        .artifacts
                        .vmdk_paths
                        .iter()
                        .flatten()
                        .any(|p| !p.exists()),
                    crate::artifacts::ArtifactKey::Qcow2Path => state
                        .artifacts
                        .qcow2_path
                        .as_ref()
                        .is_some_and(|p| !p.exists()),
                    _ => false,
                };
                if missing {
                    invalid_stages.push(spec.name.to_string());
                }
            }
        }

        if invalid_stages.is_empty() {
            return Ok(state.clone());
        }

        warn!(
            vm = %planned.vm.name,
            stages = ?invalid_stages,
            "artifacts missing on resume; re-running their stages"
        );
        let os = planned.vm.guest_os_family;
        let updated = self
            .store
            .update_vm(batch_id, &state.migration_id, move |vm| {
                for stage_name in &invalid_stages {
                    vm.completed_stages.retain(|s| s != stage_name);
                    if let Some(spec) = crate::stages::stage_spec(os, stage_name) {
                        for key in spec.outputs {
                            vm.artifacts.clear(*key);
                        }
                    }
                }
            })
            .await?;
        Ok(updated)
    }

    async fn record_failure(
        &self,
        batch_id: &str,
        migration_id: &str,
        planned: &PlannedVm,
        spec: &StageSpec,
        error: StageError,
    ) -> Result<VmMigrationStatus> {
        let secrets = self.config.secret_values();
        let message = scrub(&error.message, &secrets);
        self.store
            .update_vm(batch_id, migration_id, |vm| {
                vm.status = VmMigrationStatus::Failed;
                vm.finished_at = Some(chrono::Utc::now());
                vm.last_error = Some(LastError {
                    stage: spec.name.to_string(),
                    kind: error.kind,
                    message: message.clone(),
                    at: chrono::Utc::now(),
                });
            })
            .await?;
        self.events.emit(BatchEvent::VmFailed {
            vm_name: planned.vm.name.clone(),
            stage: spec.name.to_string(),
            kind: error.kind,
            message,
        });
        Ok(VmMigrationStatus::Failed)
    }

    /// Best-effort per-stage log under the migration's work directory.
    async fn write_stage_log(&self, vm_dir: &std::path::Path, index: usize, stage: &str, line: &str) {
        let secrets = self.config.secret_values();
        let path = vm_dir.join(format!("stage-{}-{stage}.log", index + 1));
        let body = format!("{} {stage}: {}\n", chrono::Utc::now().to_rfc3339(), scrub(line, &secrets));
        if let Err(e) = async {
            tokio::fs::create_dir_all(vm_dir).await?;
            let mut existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            existing.push_str(&body);
            tokio::fs::write(&path, existing).await
        }
        .await
        {
            debug!("failed to write stage log {}: {e}", path.display());
        }
    }
}

fn backoff_delay(attempt: u32, base_secs: u64, cap_secs: u64) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_secs(base_secs.saturating_mul(factor).min(cap_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_with_cap() {
        assert_eq!(backoff_delay(1, 2, 60), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, 2, 60), Duration::from_secs(4));
        assert_eq!(backoff_delay(3, 2, 60), Duration::from_secs(8));
        assert_eq!(backoff_delay(10, 2, 60), Duration::from_secs(60));
    }
}
