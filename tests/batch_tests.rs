//! End-to-end batch scenarios over mock backends: success path, Windows
//! without a VirtIO ISO, wave pauses, failure plus resume, concurrency
//! caps, and dry-run purity.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use vmshift::artifacts::Artifacts;
use vmshift::catalog::Catalog;
use vmshift::config::AppConfig;
use vmshift::convert::MockDiskConverter;
use vmshift::dashboard::{BatchEvent, EventSender};
use vmshift::error::StageError;
use vmshift::handlers::{default_registry, HandlerClients};
use vmshift::object_storage::MockObjectStorage;
use vmshift::orchestrator::{dry_run, BatchOrchestrator, BatchOutcome};
use vmshift::plan::Plan;
use vmshift::scaleway::MockCloudProvider;
use vmshift::stages::{StageContext, StageHandler, StageRegistry};
use vmshift::state::{StateStore, VmMigrationStatus, WaveStatus};
use vmshift::types::{DiskInfo, Firmware, NicInfo, OsFamily, PowerState, VMDescriptor};
use vmshift::vsphere::MockVSphereClient;

fn linux_vm(name: &str, host: &str) -> VMDescriptor {
    VMDescriptor {
        name: name.into(),
        uuid: format!("4211-{name}"),
        cpu_count: 2,
        memory_mb: 4096,
        power_state: PowerState::PoweredOn,
        guest_os_family: OsFamily::Linux,
        guest_os_full: "debian12_64Guest".into(),
        firmware: Firmware::Bios,
        disks: vec![DiskInfo {
            size_gb: 40.0,
            thin_provisioned: true,
            controller: "pvscsi".into(),
            path: format!("[ds1] {name}/{name}.vmdk"),
            is_rdm: false,
            is_shared: false,
        }],
        nics: vec![NicInfo {
            mac: "00:50:56:aa:bb:01".into(),
            network: "prod".into(),
            adapter: "vmxnet3".into(),
            connected: true,
        }],
        tools_status: "toolsOk".into(),
        snapshot_names: vec![],
        datacenter: "dc1".into(),
        cluster: "cl1".into(),
        host: host.into(),
        folder_path: "/prod".into(),
    }
}

fn windows_vm(name: &str) -> VMDescriptor {
    VMDescriptor {
        guest_os_family: OsFamily::Windows,
        guest_os_full: "windows2019srv_64Guest".into(),
        ..linux_vm(name, "esxi-01")
    }
}

fn test_config(tmp: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.conversion.work_dir = tmp.path().to_path_buf();
    // Retries stay but without real sleeps.
    config.limits.retry_backoff_base_secs = 0;
    config
}

struct Harness {
    orchestrator: BatchOrchestrator,
    store: Arc<StateStore>,
    events: UnboundedReceiver<BatchEvent>,
    _tmp: TempDir,
}

fn harness(inventory: Vec<VMDescriptor>, tweak: impl FnOnce(&mut AppConfig, &mut StageRegistry)) -> Harness {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);

    let catalog = Arc::new(Catalog::builtin());
    let vsphere = Arc::new(MockVSphereClient::new(inventory));
    let mut registry = default_registry(HandlerClients {
        vsphere: vsphere.clone(),
        storage: Arc::new(MockObjectStorage::new()),
        cloud: Arc::new(MockCloudProvider::new()),
        converter: Arc::new(MockDiskConverter::new()),
        catalog,
    });
    tweak(&mut config, &mut registry);

    let config = Arc::new(config);
    let store = Arc::new(StateStore::new(config.batch_state_dir()));
    let (events_tx, events_rx) = EventSender::channel();
    let orchestrator = BatchOrchestrator {
        config,
        store: store.clone(),
        registry: Arc::new(registry),
        events: events_tx,
        cancel: CancellationToken::new(),
        vsphere: Some(vsphere),
    };
    Harness {
        orchestrator,
        store,
        events: events_rx,
        _tmp: tmp,
    }
}

fn drain_events(rx: &mut UnboundedReceiver<BatchEvent>) -> Vec<BatchEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

const LINUX_STAGE_ORDER: [&str; 10] = [
    "validate", "snapshot", "export", "convert", "adapt_guest", "ensure_uefi", "upload_s3",
    "import_scw", "verify", "cleanup",
];

// Scenario: a single Linux VM runs the whole ten-stage pipeline.
#[tokio::test]
async fn single_linux_vm_success_path() {
    let plan = Plan::from_yaml_str(
        r#"
version: 1
migrations:
  - vm_name: web-01
    target_type: PRO2-XS
    wave: w1
waves:
  - name: w1
    pause_after: continue
"#,
    )
    .unwrap();

    let mut h = harness(vec![linux_vm("web-01", "esxi-01")], |_, _| {});
    let outcome = h.orchestrator.start(&plan, &[linux_vm("web-01", "esxi-01")]).await.unwrap();

    let state = match outcome {
        BatchOutcome::Completed(state) => state,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(state.vm_states.len(), 1);
    let vm = state.vm_states.values().next().unwrap();
    assert_eq!(vm.status, VmMigrationStatus::Completed);
    assert_eq!(vm.completed_stages, LINUX_STAGE_ORDER);
    assert!(vm.finished_at.is_some());

    let artifacts = &vm.artifacts;
    assert!(artifacts.vmdk_paths.is_some());
    assert!(artifacts.qcow2_path.is_some());
    assert!(artifacts.s3_key.is_some());
    assert!(artifacts.scw_snapshot_id.is_some());
    assert!(artifacts.scw_image_id.is_some());

    let events = drain_events(&mut h.events);
    let wave_completions: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            BatchEvent::WaveCompleted { wave, succeeded, failed } => {
                Some((wave.clone(), *succeeded, *failed))
            }
            _ => None,
        })
        .collect();
    assert_eq!(wave_completions, vec![("w1".to_string(), 1, 0)]);
}

// Scenario: a Windows VM with no virtio-win ISO configured fails exactly
// at inject_virtio with a fatal error; the batch reports partial failure.
#[tokio::test]
async fn windows_vm_without_virtio_iso_fails_at_inject() {
    let plan = Plan::from_yaml_str(
        r#"
version: 1
migrations:
  - vm_name: win-01
    target_type: POP2-4C-16G-WIN
"#,
    )
    .unwrap();

    let mut h = harness(vec![windows_vm("win-01")], |config, _| {
        config.conversion.virtio_win_iso = None;
    });
    let outcome = h.orchestrator.start(&plan, &[windows_vm("win-01")]).await.unwrap();

    let state = match outcome {
        BatchOutcome::Completed(state) => state,
        other => panic!("expected completion, got {other:?}"),
    };
    let vm = state.vm_states.values().next().unwrap();
    assert_eq!(vm.status, VmMigrationStatus::Failed);
    let err = vm.last_error.as_ref().unwrap();
    assert_eq!(err.stage, "inject_virtio");
    assert_eq!(err.kind, vmshift::error::StageErrorKind::Fatal);
    // Everything before the failing stage completed.
    assert_eq!(
        vm.completed_stages,
        vec!["validate", "snapshot", "export", "convert", "clean_tools"]
    );
    let (_, failed, _) = state.counts();
    assert_eq!(failed, 1);

    let events = drain_events(&mut h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        BatchEvent::VmFailed { stage, .. } if stage == "inject_virtio"
    )));
}

/// Records which VM names reach the validate stage, in order.
struct RecordingValidate {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl StageHandler for RecordingValidate {
    async fn run(&self, ctx: &StageContext) -> Result<Artifacts, StageError> {
        self.seen.lock().unwrap().push(ctx.planned.vm.name.clone());
        Ok(Artifacts::default())
    }
}

// Scenario: two waves, the first pauses; resume finishes the second.
#[tokio::test]
async fn pause_between_waves_and_resume() {
    let plan = Plan::from_yaml_str(
        r#"
version: 1
migrations:
  - vm_name: canary-01
    target_type: PRO2-XS
    wave: canary
  - vm_name: prod-01
    target_type: PRO2-XS
    wave: prod
waves:
  - name: canary
    pause_after: pause
  - name: prod
    pause_after: continue
"#,
    )
    .unwrap();

    let inventory = vec![linux_vm("canary-01", "esxi-01"), linux_vm("prod-01", "esxi-02")];
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_handler = seen.clone();
    let h = harness(inventory.clone(), move |_, registry| {
        registry.register_shared("validate", Arc::new(RecordingValidate { seen: seen_handler }));
    });

    let outcome = h.orchestrator.start(&plan, &inventory).await.unwrap();
    let (state, wave) = match outcome {
        BatchOutcome::Paused { state, wave } => (state, wave),
        other => panic!("expected pause, got {other:?}"),
    };
    assert_eq!(wave, "canary");
    assert_eq!(state.waves[0].status, WaveStatus::Paused);
    assert_eq!(state.waves[1].status, WaveStatus::Pending);

    // The canary VM completed; prod has not started.
    let canary = state.vm_states.values().find(|s| s.vm_name == "canary-01").unwrap();
    assert_eq!(canary.status, VmMigrationStatus::Completed);
    let prod = state.vm_states.values().find(|s| s.vm_name == "prod-01").unwrap();
    assert_eq!(prod.status, VmMigrationStatus::Pending);
    assert_eq!(seen.lock().unwrap().as_slice(), ["canary-01"]);

    // Explicit resume continues with prod and finishes cleanly.
    let outcome = h.orchestrator.resume(&state.batch_id).await.unwrap();
    let state = match outcome {
        BatchOutcome::Completed(state) => state,
        other => panic!("expected completion after resume, got {other:?}"),
    };
    assert!(state
        .vm_states
        .values()
        .all(|s| s.status == VmMigrationStatus::Completed));
    assert_eq!(state.waves[0].status, WaveStatus::Completed);
    assert_eq!(state.waves[1].status, WaveStatus::Completed);
    assert_eq!(seen.lock().unwrap().as_slice(), ["canary-01", "prod-01"]);
}

/// Fails with a transient error until released, then produces the key.
struct FlakyUpload {
    ok: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl StageHandler for FlakyUpload {
    async fn run(&self, ctx: &StageContext) -> Result<Artifacts, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.ok.load(Ordering::SeqCst) {
            return Err(StageError::transient("connection reset by peer"));
        }
        Ok(Artifacts {
            s3_key: Some(format!("vmshift/{}/disk-0.qcow2", ctx.state.migration_id)),
            ..Default::default()
        })
    }
}

struct CountingValidate {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl StageHandler for CountingValidate {
    async fn run(&self, _ctx: &StageContext) -> Result<Artifacts, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Artifacts::default())
    }
}

// Scenario: upload_s3 keeps failing past the retry cap; state shows the
// prior stages completed. A resume picks up at upload_s3 without
// re-running anything earlier and finishes.
#[tokio::test]
async fn failure_at_upload_then_resume_from_last_stage() {
    let plan = Plan::from_yaml_str(
        "version: 1\nmigrations:\n  - vm_name: web-01\n    target_type: PRO2-XS\n",
    )
    .unwrap();
    let inventory = vec![linux_vm("web-01", "esxi-01")];

    let upload_ok = Arc::new(AtomicBool::new(false));
    let upload_calls = Arc::new(AtomicUsize::new(0));
    let validate_calls = Arc::new(AtomicUsize::new(0));

    let (ok, calls, vcalls) = (upload_ok.clone(), upload_calls.clone(), validate_calls.clone());
    let h = harness(inventory.clone(), move |_, registry| {
        registry.register_shared("upload_s3", Arc::new(FlakyUpload { ok, calls }));
        registry.register_shared("validate", Arc::new(CountingValidate { calls: vcalls }));
    });

    let outcome = h.orchestrator.start(&plan, &inventory).await.unwrap();
    let state = match outcome {
        BatchOutcome::Completed(state) => state,
        other => panic!("expected completion, got {other:?}"),
    };
    let vm = state.vm_states.values().next().unwrap();
    assert_eq!(vm.status, VmMigrationStatus::Failed);
    assert_eq!(
        vm.completed_stages,
        vec!["validate", "snapshot", "export", "convert", "adapt_guest", "ensure_uefi"]
    );
    let err = vm.last_error.as_ref().unwrap();
    assert_eq!(err.stage, "upload_s3");
    // Retried up to the configured cap.
    assert_eq!(upload_calls.load(Ordering::SeqCst), 3);
    assert_eq!(validate_calls.load(Ordering::SeqCst), 1);

    // The handler recovers; resume continues from upload_s3 only.
    upload_ok.store(true, Ordering::SeqCst);
    let outcome = h.orchestrator.resume(&state.batch_id).await.unwrap();
    let state = match outcome {
        BatchOutcome::Completed(state) => state,
        other => panic!("expected completion, got {other:?}"),
    };
    let vm = state.vm_states.values().next().unwrap();
    assert_eq!(vm.status, VmMigrationStatus::Completed);
    assert_eq!(vm.completed_stages, LINUX_STAGE_ORDER);
    assert_eq!(validate_calls.load(Ordering::SeqCst), 1, "validate must not re-run");
    assert_eq!(upload_calls.load(Ordering::SeqCst), 4);
}

// Resume equivalence: a failed-then-resumed run ends with the same
// completed stages and artifact keys as an uninterrupted run.
#[tokio::test]
async fn resume_equivalence_with_uninterrupted_run() {
    let plan = Plan::from_yaml_str(
        "version: 1\nmigrations:\n  - vm_name: web-01\n    target_type: PRO2-XS\n",
    )
    .unwrap();
    let inventory = vec![linux_vm("web-01", "esxi-01")];

    // Uninterrupted reference run.
    let h1 = harness(inventory.clone(), |_, _| {});
    let reference = match h1.orchestrator.start(&plan, &inventory).await.unwrap() {
        BatchOutcome::Completed(state) => state,
        other => panic!("unexpected {other:?}"),
    };
    let ref_vm = reference.vm_states.values().next().unwrap();

    // Interrupted run: upload fails once past the cap, then recovers.
    let upload_ok = Arc::new(AtomicBool::new(false));
    let (ok, calls) = (upload_ok.clone(), Arc::new(AtomicUsize::new(0)));
    let h2 = harness(inventory.clone(), move |_, registry| {
        registry.register_shared("upload_s3", Arc::new(FlakyUpload { ok, calls }));
    });
    let first = h2.orchestrator.start(&plan, &inventory).await.unwrap();
    upload_ok.store(true, Ordering::SeqCst);
    let resumed = match h2.orchestrator.resume(first.state().batch_id.as_str()).await.unwrap() {
        BatchOutcome::Completed(state) => state,
        other => panic!("unexpected {other:?}"),
    };
    let res_vm = resumed.vm_states.values().next().unwrap();

    assert_eq!(ref_vm.completed_stages, res_vm.completed_stages);
    assert_eq!(ref_vm.artifacts.keys(), res_vm.artifacts.keys());
    assert_eq!(res_vm.status, VmMigrationStatus::Completed);
}

// Replaying a cleanly completed batch changes nothing.
#[tokio::test]
async fn replaying_completed_batch_is_a_no_op() {
    let plan = Plan::from_yaml_str(
        "version: 1\nmigrations:\n  - vm_name: web-01\n    target_type: PRO2-XS\n",
    )
    .unwrap();
    let inventory = vec![linux_vm("web-01", "esxi-01")];
    let h = harness(inventory.clone(), |_, _| {});

    let state = match h.orchestrator.start(&plan, &inventory).await.unwrap() {
        BatchOutcome::Completed(state) => state,
        other => panic!("unexpected {other:?}"),
    };
    let before = serde_json::to_string(&state.vm_states).unwrap();

    let replayed = match h.orchestrator.resume(&state.batch_id).await.unwrap() {
        BatchOutcome::Completed(state) => state,
        other => panic!("unexpected {other:?}"),
    };
    let after = serde_json::to_string(&replayed.vm_states).unwrap();
    assert_eq!(before, after);
}

/// Tracks how many invocations run concurrently.
struct GaugedConvert {
    in_flight: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
}

#[async_trait]
impl StageHandler for GaugedConvert {
    async fn run(&self, _ctx: &StageContext) -> Result<Artifacts, StageError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Artifacts {
            qcow2_path: Some(std::path::PathBuf::from("/tmp/does-not-matter.qcow2")),
            ..Default::default()
        })
    }
}

/// Terminates the pipeline right after convert so the cap measurement
/// stays focused.
struct StopAfterConvert;

#[async_trait]
impl StageHandler for StopAfterConvert {
    async fn run(&self, _ctx: &StageContext) -> Result<Artifacts, StageError> {
        Err(StageError::fatal("stop here"))
    }
}

// Invariant: at no point do more than `disk_io` stages hold that
// semaphore, across 20 VMs in one wave.
#[tokio::test]
async fn disk_io_cap_is_honored_across_twenty_vms() {
    let plan = Plan::from_yaml_str(
        r#"
version: 1
concurrency:
  global: 20
  disk_io: 2
migrations:
  - vm_pattern: "vm-*"
    target_type: PRO2-XS
"#,
    )
    .unwrap();
    let inventory: Vec<VMDescriptor> = (0..20)
        .map(|i| linux_vm(&format!("vm-{i:02}"), &format!("esxi-{:02}", i % 4)))
        .collect();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let (f, m) = (in_flight.clone(), max_seen.clone());
    let h = harness(inventory.clone(), move |_, registry| {
        registry.register_shared("convert", Arc::new(GaugedConvert { in_flight: f, max_seen: m }));
        registry.register_shared("adapt_guest", Arc::new(StopAfterConvert));
    });

    let _ = h.orchestrator.start(&plan, &inventory).await.unwrap();
    assert!(
        max_seen.load(Ordering::SeqCst) <= 2,
        "observed {} concurrent disk_io stages",
        max_seen.load(Ordering::SeqCst)
    );
}

// Dry-run purity: no batch-state files, no handler calls.
#[tokio::test]
async fn dry_run_writes_nothing_and_calls_no_handlers() {
    let plan = Plan::from_yaml_str(
        "version: 1\nmigrations:\n  - vm_name: web-01\n    target_type: PRO2-XS\n",
    )
    .unwrap();
    let inventory = vec![linux_vm("web-01", "esxi-01")];

    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let events = EventSender::disabled();
    let state = dry_run(&plan, &inventory, &config, &events).unwrap();

    assert!(state.batch_id.starts_with("dry-"));
    assert!(state
        .vm_states
        .values()
        .all(|s| s.status == VmMigrationStatus::Completed));
    // Nothing persisted, nothing exported.
    assert!(!config.batch_state_dir().exists());
    assert!(!config.conversion.work_dir.join("work").exists());
}

// Post-state is inspectable through the store after the process "exits".
#[tokio::test]
async fn batch_state_survives_for_status_and_report() {
    let plan = Plan::from_yaml_str(
        "version: 1\nmigrations:\n  - vm_name: web-01\n    target_type: PRO2-XS\n",
    )
    .unwrap();
    let inventory = vec![linux_vm("web-01", "esxi-01")];
    let h = harness(inventory.clone(), |_, _| {});
    let state = match h.orchestrator.start(&plan, &inventory).await.unwrap() {
        BatchOutcome::Completed(state) => state,
        other => panic!("unexpected {other:?}"),
    };

    let reloaded = h.store.load(&state.batch_id).await.unwrap();
    assert_eq!(reloaded.plan_digest, plan.digest());
    let report = vmshift::dashboard::render_report(&reloaded);
    assert!(report.contains("web-01"));
    assert!(report.contains("Succeeded | 1"));
}
