//! Wave-driven batch executor.
//!
//! Expands a validated plan into a batch, then processes waves in declared
//! order: VM pipelines inside a wave run concurrently (each holding one
//! `global` permit for its whole lifetime), wave N finishes before wave
//! N+1 starts, and the wave's pause policy decides what happens next. The
//! dry-run path simulates the same traversal with no side effects.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::dashboard::{BatchEvent, EventSender};
use crate::error::{Result, VmshiftError};
use crate::pipeline::PipelineExecutor;
use crate::plan::{expand_plan, PauseAfter, Plan, PlannedVm, PostAction};
use crate::semaphore::ResourceSemaphores;
use crate::stages::{stages_for, StageRegistry};
use crate::state::{
    migration_id, new_batch_id, BatchState, MigrationState, StateStore, VmMigrationStatus,
    WaveState, WaveStatus,
};
use crate::types::VMDescriptor;
use crate::vsphere::VSphereClient;

/// Terminal outcome of one orchestrator invocation.
#[derive(Debug)]
pub enum BatchOutcome {
    /// All waves ran to the end (VM failures are reflected in the state).
    Completed(BatchState),
    /// A wave's pause policy stopped the batch; `batch resume` continues.
    Paused { state: BatchState, wave: String },
    /// A cooperative cancel stopped the batch.
    Cancelled(BatchState),
}

impl BatchOutcome {
    pub fn state(&self) -> &BatchState {
        match self {
            BatchOutcome::Completed(s) => s,
            BatchOutcome::Paused { state, .. } => state,
            BatchOutcome::Cancelled(s) => s,
        }
    }
}

pub struct BatchOrchestrator {
    pub config: Arc<AppConfig>,
    pub store: Arc<StateStore>,
    pub registry: Arc<StageRegistry>,
    pub events: EventSender,
    pub cancel: CancellationToken,
    /// Used for post-migration actions; `None` disables them.
    pub vsphere: Option<Arc<dyn VSphereClient>>,
}

impl BatchOrchestrator {
    /// Expand the plan and run a fresh batch.
    pub async fn start(&self, plan: &Plan, inventory: &[VMDescriptor]) -> Result<BatchOutcome> {
        let catalog = crate::catalog::Catalog::builtin();
        plan.validate(&catalog)?;
        let expansion = expand_plan(plan, inventory, &catalog, self.config.limits.sizing_headroom)?;
        for w in &expansion.warnings {
            warn!("plan: {w}");
        }
        if expansion.planned.is_empty() {
            return Err(VmshiftError::Validation(
                "plan expansion selected no migratable VMs".into(),
            ));
        }

        let batch_id = new_batch_id();
        let mut vm_states = BTreeMap::new();
        for p in &expansion.planned {
            let state = MigrationState::new(&batch_id, &p.vm.name, &p.vm.uuid);
            vm_states.insert(state.migration_id.clone(), state);
        }

        let waves = expansion
            .waves
            .iter()
            .map(|w| WaveState {
                name: w.name.clone(),
                pause_after: w.pause_after,
                status: WaveStatus::Pending,
                migration_ids: w
                    .vm_names
                    .iter()
                    .filter_map(|name| {
                        expansion
                            .planned
                            .iter()
                            .find(|p| p.vm.name == *name)
                            .map(|p| migration_id(&batch_id, &p.vm.uuid))
                    })
                    .collect(),
            })
            .collect();

        let batch = BatchState {
            batch_id: batch_id.clone(),
            created_at: Utc::now(),
            plan_digest: plan.digest(),
            waves,
            vm_states,
            planned: expansion.planned,
            concurrency: plan.concurrency.clone(),
            post_migration: plan.post_migration.clone(),
        };
        self.store.save(&batch).await?;
        info!(batch_id = %batch.batch_id, vms = batch.vm_states.len(), "batch created");

        self.run_waves(batch).await
    }

    /// Resume an existing batch: failed VMs go back to pending with their
    /// completed stages intact; completed VMs are untouched.
    pub async fn resume(&self, batch_id: &str) -> Result<BatchOutcome> {
        let batch = self.store.load(batch_id).await?;
        let failed: Vec<String> = batch
            .vm_states
            .values()
            .filter(|s| s.status == VmMigrationStatus::Failed)
            .map(|s| s.migration_id.clone())
            .collect();
        for mid in &failed {
            self.store
                .update_vm(batch_id, mid, |vm| {
                    vm.status = VmMigrationStatus::Pending;
                    vm.finished_at = None;
                })
                .await?;
        }
        let batch = self.store.load(batch_id).await?;
        info!(
            batch_id,
            reset = failed.len(),
            "resuming from first unfinished wave"
        );
        self.run_waves(batch).await
    }

    async fn run_waves(&self, mut batch: BatchState) -> Result<BatchOutcome> {
        let semaphores = Arc::new(ResourceSemaphores::new(&batch.concurrency));
        let executor = Arc::new(PipelineExecutor {
            registry: self.registry.clone(),
            semaphores: semaphores.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
        });

        self.events.emit(BatchEvent::BatchStarted {
            batch_id: batch.batch_id.clone(),
            total_vms: batch.vm_states.len(),
            waves: batch.waves.len(),
        });

        // Failed waves are revisited: their VMs were reset to pending on
        // resume and must re-run.
        let first = batch
            .waves
            .iter()
            .position(|w| w.status != WaveStatus::Completed)
            .unwrap_or(batch.waves.len());

        for wave_index in first..batch.waves.len() {
            let wave = batch.waves[wave_index].clone();
            // A wave found paused was already run; its pause is resolved by
            // the act of resuming.
            let pause_already_resolved = wave.status == WaveStatus::Paused;

            self.store
                .update_wave(&batch.batch_id, &wave.name, WaveStatus::Running)
                .await?;

            // Pending VMs, in the wave's frozen scheduling order.
            let pending: Vec<PlannedVm> = wave
                .migration_ids
                .iter()
                .filter(|mid| {
                    batch
                        .vm_states
                        .get(*mid)
                        .is_some_and(|s| s.status == VmMigrationStatus::Pending)
                })
                .filter_map(|mid| {
                    batch
                        .planned
                        .iter()
                        .find(|p| migration_id(&batch.batch_id, &p.vm.uuid) == *mid)
                        .cloned()
                })
                .collect();

            self.events.emit(BatchEvent::WaveStarted {
                wave: wave.name.clone(),
                vms: pending.len(),
            });

            let tasks: Vec<_> = pending
                .into_iter()
                .map(|planned| {
                    let executor = executor.clone();
                    let semaphores = semaphores.clone();
                    let batch_id = batch.batch_id.clone();
                    tokio::spawn(async move {
                        // One global slot per pipeline, held to the end.
                        let _slot = semaphores.acquire_global().await?;
                        executor.run_vm(&batch_id, &planned).await
                    })
                })
                .collect();

            for joined in join_all(tasks).await {
                match joined {
                    Ok(Ok(_status)) => {}
                    Ok(Err(e)) => warn!("pipeline error: {e}"),
                    Err(e) => warn!("pipeline task panicked: {e}"),
                }
            }

            batch = self.store.load(&batch.batch_id).await?;
            let wave_snapshot = batch.waves[wave_index].clone();
            let (succeeded, failed) = wave_counts(&batch, &wave_snapshot);
            self.events.emit(BatchEvent::WaveCompleted {
                wave: wave.name.clone(),
                succeeded,
                failed,
            });

            self.apply_post_actions(&batch, &wave_snapshot).await;

            if self.cancel.is_cancelled() {
                let status = if failed > 0 { WaveStatus::Failed } else { WaveStatus::Completed };
                self.store
                    .update_wave(&batch.batch_id, &wave.name, status)
                    .await?;
                let batch = self.store.load(&batch.batch_id).await?;
                return Ok(BatchOutcome::Cancelled(batch));
            }

            let should_pause = !pause_already_resolved
                && match wave.pause_after {
                    PauseAfter::Continue => false,
                    PauseAfter::Pause => true,
                    PauseAfter::PauseOnFailure => failed > 0,
                }
                && wave_index + 1 < batch.waves.len();

            if should_pause {
                self.store
                    .update_wave(&batch.batch_id, &wave.name, WaveStatus::Paused)
                    .await?;
                let reason = format!("{succeeded} ok, {failed} failed; waiting for confirmation");
                self.events.emit(BatchEvent::WavePaused {
                    wave: wave.name.clone(),
                    reason,
                });
                let batch = self.store.load(&batch.batch_id).await?;
                return Ok(BatchOutcome::Paused {
                    state: batch,
                    wave: wave.name.clone(),
                });
            }

            let status = if failed > 0 { WaveStatus::Failed } else { WaveStatus::Completed };
            self.store
                .update_wave(&batch.batch_id, &wave.name, status)
                .await?;
            batch = self.store.load(&batch.batch_id).await?;
        }

        let (succeeded, failed, _) = batch.counts();
        self.events.emit(BatchEvent::BatchCompleted {
            batch_id: batch.batch_id.clone(),
            succeeded,
            failed,
        });
        Ok(BatchOutcome::Completed(batch))
    }

    /// Source-side follow-ups for VMs that completed in this wave.
    async fn apply_post_actions(&self, batch: &BatchState, wave: &WaveState) {
        let Some(vsphere) = &self.vsphere else {
            return;
        };
        if batch.post_migration.is_empty() {
            return;
        }
        for mid in &wave.migration_ids {
            let Some(state) = batch.vm_states.get(mid) else {
                continue;
            };
            if state.status != VmMigrationStatus::Completed {
                continue;
            }
            for action in &batch.post_migration {
                let result = match action {
                    PostAction::PowerOffSource => vsphere.power_off(&state.vm_uuid).await,
                    PostAction::TagSource { tag } => vsphere.tag_vm(&state.vm_uuid, tag).await,
                    // Snapshot removal already happens in the cleanup stage.
                    PostAction::DeleteSourceSnapshot => Ok(()),
                };
                if let Err(e) = result {
                    warn!(vm = %state.vm_name, "post-migration action failed: {e}");
                }
            }
        }
    }
}

fn wave_counts(batch: &BatchState, wave: &WaveState) -> (usize, usize) {
    let mut succeeded = 0;
    let mut failed = 0;
    for mid in &wave.migration_ids {
        match batch.vm_states.get(mid).map(|s| s.status) {
            Some(VmMigrationStatus::Completed) => succeeded += 1,
            Some(VmMigrationStatus::Failed) => failed += 1,
            _ => {}
        }
    }
    (succeeded, failed)
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

/// Simulated traversal: same events and report shape, but nothing is
/// persisted, no handler runs, and no semaphore is acquired.
pub fn dry_run(
    plan: &Plan,
    inventory: &[VMDescriptor],
    config: &AppConfig,
    events: &EventSender,
) -> Result<BatchState> {
    let catalog = crate::catalog::Catalog::builtin();
    plan.validate(&catalog)?;
    let expansion = expand_plan(plan, inventory, &catalog, config.limits.sizing_headroom)?;

    let batch_id = format!("dry-{}", new_batch_id());
    events.emit(BatchEvent::BatchStarted {
        batch_id: batch_id.clone(),
        total_vms: expansion.planned.len(),
        waves: expansion.waves.len(),
    });

    let mut vm_states = BTreeMap::new();
    for p in &expansion.planned {
        let mut state = MigrationState::new(&batch_id, &p.vm.name, &p.vm.uuid);
        for spec in stages_for(p.vm.guest_os_family) {
            info!(
                "[dry-run] {} -> {} would run stage {}",
                p.vm.name, p.target_type, spec.name
            );
            state.completed_stages.push(spec.name.to_string());
        }
        state.status = VmMigrationStatus::Completed;
        state.finished_at = Some(Utc::now());
        vm_states.insert(state.migration_id.clone(), state);
    }

    let waves = expansion
        .waves
        .iter()
        .map(|w| {
            events.emit(BatchEvent::WaveCompleted {
                wave: w.name.clone(),
                succeeded: w.vm_names.len(),
                failed: 0,
            });
            WaveState {
                name: w.name.clone(),
                pause_after: w.pause_after,
                status: WaveStatus::Completed,
                migration_ids: w
                    .vm_names
                    .iter()
                    .filter_map(|name| {
                        expansion
                            .planned
                            .iter()
                            .find(|p| p.vm.name == *name)
                            .map(|p| migration_id(&batch_id, &p.vm.uuid))
                    })
                    .collect(),
            }
        })
        .collect();

    Ok(BatchState {
        batch_id,
        created_at: Utc::now(),
        plan_digest: plan.digest(),
        waves,
        vm_states,
        planned: expansion.planned,
        concurrency: plan.concurrency.clone(),
        post_migration: plan.post_migration.clone(),
    })
}
