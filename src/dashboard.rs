//! Progress events and the post-migration report.
//!
//! The orchestrator and pipelines emit [`BatchEvent`]s through an
//! [`EventSender`]; the CLI attaches a logger task for live progress. The
//! Markdown report is rendered from the final batch state.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::StageErrorKind;
use crate::state::{BatchState, VmMigrationStatus};

#[derive(Debug, Clone)]
pub enum BatchEvent {
    BatchStarted {
        batch_id: String,
        total_vms: usize,
        waves: usize,
    },
    WaveStarted {
        wave: String,
        vms: usize,
    },
    StageStarted {
        vm_name: String,
        stage: String,
    },
    StageCompleted {
        vm_name: String,
        stage: String,
        secs: f64,
    },
    VmCompleted {
        vm_name: String,
    },
    VmFailed {
        vm_name: String,
        stage: String,
        kind: StageErrorKind,
        message: String,
    },
    WaveCompleted {
        wave: String,
        succeeded: usize,
        failed: usize,
    },
    WavePaused {
        wave: String,
        reason: String,
    },
    BatchCompleted {
        batch_id: String,
        succeeded: usize,
        failed: usize,
    },
}

/// Cheap cloneable event sink. A disabled sender drops everything, which
/// keeps the library usable without a consumer.
#[derive(Clone)]
pub struct EventSender(Option<mpsc::UnboundedSender<BatchEvent>>);

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(Some(tx)), rx)
    }

    pub fn disabled() -> Self {
        Self(None)
    }

    pub fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.0 {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(event);
        }
    }
}

/// Log events as they arrive; used by the CLI for live progress.
pub fn spawn_event_logger(mut rx: mpsc::UnboundedReceiver<BatchEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                BatchEvent::BatchStarted { batch_id, total_vms, waves } => {
                    info!("batch {batch_id}: {total_vms} VMs in {waves} wave(s)");
                }
                BatchEvent::WaveStarted { wave, vms } => {
                    info!("wave '{wave}' started ({vms} VMs)");
                }
                BatchEvent::StageStarted { vm_name, stage } => {
                    info!("{vm_name}: {stage}...");
                }
                BatchEvent::StageCompleted { vm_name, stage, secs } => {
                    info!("{vm_name}: {stage} done in {secs:.1}s");
                }
                BatchEvent::VmCompleted { vm_name } => {
                    info!("{vm_name}: migration complete");
                }
                BatchEvent::VmFailed { vm_name, stage, kind, message } => {
                    error!("{vm_name}: failed at {stage} ({kind}): {message}");
                }
                BatchEvent::WaveCompleted { wave, succeeded, failed } => {
                    info!("wave '{wave}' complete: {succeeded} ok, {failed} failed");
                }
                BatchEvent::WavePaused { wave, reason } => {
                    warn!("wave '{wave}' paused: {reason}");
                }
                BatchEvent::BatchCompleted { batch_id, succeeded, failed } => {
                    info!("batch {batch_id} finished: {succeeded} ok, {failed} failed");
                }
            }
        }
    })
}

fn fmt_duration(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> String {
    let end = end.unwrap_or_else(Utc::now);
    let secs = (end - start).num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{:.1}m", secs as f64 / 60.0)
    }
}

/// Render the post-migration Markdown report.
pub fn render_report(batch: &BatchState) -> String {
    let (completed, failed, pending) = batch.counts();
    let mut lines = vec![
        format!("# Migration Report — Batch `{}`", batch.batch_id),
        String::new(),
        format!("**Date:** {}", batch.created_at.format("%Y-%m-%d %H:%M")),
        format!("**Plan digest:** `{}`", &batch.plan_digest[..batch.plan_digest.len().min(12)]),
        String::new(),
        "## Summary".to_string(),
        String::new(),
        "| Metric | Value |".to_string(),
        "|--------|-------|".to_string(),
        format!("| Total VMs | {} |", batch.vm_states.len()),
        format!("| Succeeded | {completed} |"),
        format!("| Failed | {failed} |"),
        format!("| Not run | {pending} |"),
        String::new(),
        "## Waves".to_string(),
        String::new(),
        "| Wave | Status | VMs |".to_string(),
        "|------|--------|-----|".to_string(),
    ];
    for wave in &batch.waves {
        lines.push(format!(
            "| {} | {:?} | {} |",
            wave.name,
            wave.status,
            wave.migration_ids.len()
        ));
    }
    lines.push(String::new());

    let succeeded: Vec<_> = batch
        .vm_states
        .values()
        .filter(|s| s.status == VmMigrationStatus::Completed)
        .collect();
    if !succeeded.is_empty() {
        lines.push("## Successful Migrations".to_string());
        lines.push(String::new());
        lines.push("| VM | Duration | Image |".to_string());
        lines.push("|----|----------|-------|".to_string());
        for s in &succeeded {
            lines.push(format!(
                "| {} | {} | `{}` |",
                s.vm_name,
                fmt_duration(s.started_at, s.finished_at),
                s.artifacts.scw_image_id.as_deref().unwrap_or("—"),
            ));
        }
        lines.push(String::new());
    }

    let failures: Vec<_> = batch
        .vm_states
        .values()
        .filter(|s| s.status == VmMigrationStatus::Failed)
        .collect();
    if !failures.is_empty() {
        lines.push("## Failed Migrations".to_string());
        lines.push(String::new());
        lines.push("| VM | Stage | Kind | Error |".to_string());
        lines.push("|----|-------|------|-------|".to_string());
        for s in &failures {
            let (stage, kind, msg) = s
                .last_error
                .as_ref()
                .map(|e| (e.stage.as_str(), e.kind.to_string(), e.message.as_str()))
                .unwrap_or(("?", "?".to_string(), ""));
            let msg: String = msg.replace('|', "\\|").chars().take(80).collect();
            lines.push(format!("| {} | {stage} | {kind} | {msg} |", s.vm_name));
        }
        lines.push(String::new());
        lines.push(format!(
            "Resume with: `vmshift batch resume --batch-id {}`",
            batch.batch_id
        ));
        lines.push(String::new());
    }

    // Per-stage timing across successful VMs.
    let mut stage_names: Vec<&str> = Vec::new();
    for s in &succeeded {
        for name in s.stage_secs.keys() {
            if !stage_names.contains(&name.as_str()) {
                stage_names.push(name);
            }
        }
    }
    if !stage_names.is_empty() {
        lines.push("## Stage Timing".to_string());
        lines.push(String::new());
        lines.push("| Stage | Avg | Min | Max |".to_string());
        lines.push("|-------|-----|-----|-----|".to_string());
        stage_names.sort();
        for name in stage_names {
            let timings: Vec<f64> = succeeded
                .iter()
                .filter_map(|s| s.stage_secs.get(name))
                .copied()
                .collect();
            if timings.is_empty() {
                continue;
            }
            let avg = timings.iter().sum::<f64>() / timings.len() as f64;
            let min = timings.iter().copied().fold(f64::INFINITY, f64::min);
            let max = timings.iter().copied().fold(0.0f64, f64::max);
            lines.push(format!("| {name} | {avg:.1}s | {min:.1}s | {max:.1}s |"));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PauseAfter;
    use crate::state::{MigrationState, WaveState, WaveStatus};
    use std::collections::BTreeMap;

    #[test]
    fn report_lists_successes_and_failures() {
        let mut vm_states = BTreeMap::new();

        let mut ok = MigrationState::new("b1", "web-01", "u1");
        ok.status = VmMigrationStatus::Completed;
        ok.artifacts.scw_image_id = Some("img-123".into());
        ok.stage_secs.insert("convert".into(), 42.0);
        vm_states.insert(ok.migration_id.clone(), ok);

        let mut bad = MigrationState::new("b1", "db-01", "u2");
        bad.status = VmMigrationStatus::Failed;
        bad.last_error = Some(crate::state::LastError {
            stage: "upload_s3".into(),
            kind: StageErrorKind::TransientInfra,
            message: "connection reset".into(),
            at: Utc::now(),
        });
        vm_states.insert(bad.migration_id.clone(), bad);

        let batch = BatchState {
            batch_id: "b1".into(),
            created_at: Utc::now(),
            plan_digest: "abcdef0123456789".into(),
            waves: vec![WaveState {
                name: "default".into(),
                pause_after: PauseAfter::Continue,
                status: WaveStatus::Completed,
                migration_ids: vec![],
            }],
            vm_states,
            planned: vec![],
            concurrency: Default::default(),
            post_migration: vec![],
        };

        let report = render_report(&batch);
        assert!(report.contains("web-01"));
        assert!(report.contains("img-123"));
        assert!(report.contains("upload_s3"));
        assert!(report.contains("connection reset"));
        assert!(report.contains("batch resume --batch-id b1"));
        assert!(report.contains("| convert | 42.0s"));
    }
}
