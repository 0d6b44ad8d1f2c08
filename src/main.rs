use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmshift::catalog::Catalog;
use vmshift::cli::{parse_filters, parse_strategy, BatchCommands, Cli, Commands, InventoryArgs};
use vmshift::config::AppConfig;
use vmshift::convert::MockDiskConverter;
use vmshift::dashboard::{render_report, spawn_event_logger, EventSender};
use vmshift::error::{Result, VmshiftError};
use vmshift::estimate::{estimate, render_estimate};
use vmshift::filter::FilterSet;
use vmshift::handlers::{default_registry, HandlerClients};
use vmshift::object_storage::MockObjectStorage;
use vmshift::orchestrator::{dry_run, BatchOrchestrator, BatchOutcome};
use vmshift::plan::{
    expand_plan, generate_plan, GeneratePlanOptions, MigrationEntry, Plan, PLAN_VERSION,
};
use vmshift::scaleway::{CloudProvider, MockCloudProvider};
use vmshift::state::{StateStore, VmMigrationStatus};
use vmshift::types::VMDescriptor;
use vmshift::vsphere::MockVSphereClient;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage problems exit 1; --help/--version are not errors.
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            exit(code);
        }
    };

    match run(cli).await {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{e}");
            exit(exit_code(&e));
        }
    }
}

/// Map library errors onto the documented exit codes: 2 for plan/config
/// validation, 130 for cooperative cancel, 4 for everything
/// infrastructure-shaped.
fn exit_code(e: &VmshiftError) -> i32 {
    match e {
        VmshiftError::Validation(_) | VmshiftError::Config(_) => 2,
        VmshiftError::Cancelled => 130,
        _ => 4,
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::from_yaml_file(path)?,
        None => {
            let mut c = AppConfig::default();
            c.overlay_env();
            c
        }
    };
    if let Some(dir) = &cli.work_dir {
        config.conversion.work_dir = dir.clone();
    }
    let config = Arc::new(config);

    match cli.command {
        Commands::Inventory { inventory, json } => cmd_inventory(&inventory, json).await,
        Commands::InventoryPlan {
            inventory,
            output,
            strategy,
            zone,
            no_auto_map,
        } => cmd_inventory_plan(&config, &inventory, output, &strategy, zone, no_auto_map).await,
        Commands::Migrate {
            inventory,
            vm,
            target_type,
            zone,
            mock,
        } => cmd_migrate(config, &inventory, vm, target_type, zone, mock).await,
        Commands::Batch { command } => match command {
            BatchCommands::Estimate {
                plan,
                inventory,
                available_disk,
            } => cmd_estimate(&config, plan, &inventory, available_disk).await,
            BatchCommands::Run {
                plan,
                inventory,
                dry_run: dry,
                mock,
            } => cmd_run(config, plan, &inventory, dry, mock).await,
            BatchCommands::Resume { batch_id, mock } => {
                cmd_resume(config, batch_id, mock).await
            }
            BatchCommands::Status { batch_id } => cmd_status(&config, batch_id).await,
            BatchCommands::Report { batch_id, output } => {
                cmd_report(&config, batch_id, output).await
            }
        },
    }
}

/// Source inventory for planning and mock runs. The live vSphere client is
/// an external collaborator; a JSON descriptor dump stands in for it here.
async fn load_inventory(args: &InventoryArgs) -> Result<Vec<VMDescriptor>> {
    let Some(path) = &args.inventory_file else {
        return Err(VmshiftError::Config(
            "no vSphere backend configured; pass --inventory-file with a VM descriptor dump"
                .into(),
        ));
    };
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        VmshiftError::Config(format!("cannot read inventory {}: {e}", path.display()))
    })?;
    let mut inventory: Vec<VMDescriptor> = serde_json::from_str(&text)?;
    // The family is derived, never trusted from the dump: collapse the raw
    // guest id to linux/windows/other before anything consumes it.
    for vm in &mut inventory {
        vm.normalize_guest_os();
    }
    Ok(inventory)
}

async fn filtered_inventory(args: &InventoryArgs) -> Result<(Vec<VMDescriptor>, FilterSet)> {
    let inventory = load_inventory(args).await?;
    let filter = FilterSet::compile(parse_filters(args)?)?;
    Ok((inventory, filter))
}

async fn clients_for(
    mock: bool,
    inventory: Vec<VMDescriptor>,
    config: &AppConfig,
) -> Result<HandlerClients> {
    if !mock {
        // The SOAP/NFC, S3 and provider-API clients live outside this
        // crate and are wired in by the packaging layer.
        return Err(VmshiftError::Config(
            "no live backends configured in this build; use --mock or --dry-run".into(),
        ));
    }
    let cloud = Arc::new(MockCloudProvider::new());
    let mut catalog = Catalog::builtin();
    match cloud.list_instance_types(&config.scaleway.default_zone).await {
        Ok(fetched) => catalog.reconcile(fetched),
        Err(e) => warn!("could not refresh instance-type catalogue: {e}"),
    }
    Ok(HandlerClients {
        vsphere: Arc::new(MockVSphereClient::new(inventory)),
        storage: Arc::new(MockObjectStorage::new()),
        cloud,
        converter: Arc::new(MockDiskConverter::new()),
        catalog: Arc::new(catalog),
    })
}

fn orchestrator_for(
    config: Arc<AppConfig>,
    clients: HandlerClients,
    events: EventSender,
) -> (BatchOrchestrator, CancellationToken) {
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; letting running stages finish");
            signal_token.cancel();
        }
    });

    let store = Arc::new(StateStore::new(config.batch_state_dir()));
    let vsphere = clients.vsphere.clone();
    let registry = Arc::new(default_registry(clients));
    (
        BatchOrchestrator {
            config,
            store,
            registry,
            events,
            cancel: cancel.clone(),
            vsphere: Some(vsphere),
        },
        cancel,
    )
}

fn outcome_exit_code(outcome: &BatchOutcome) -> i32 {
    match outcome {
        BatchOutcome::Cancelled(_) => 130,
        BatchOutcome::Paused { state, wave } => {
            info!(
                "wave '{wave}' paused; continue with: vmshift batch resume --batch-id {}",
                state.batch_id
            );
            0
        }
        BatchOutcome::Completed(state) => {
            let (_, failed, _) = state.counts();
            if failed > 0 {
                3
            } else {
                0
            }
        }
    }
}

async fn cmd_inventory(args: &InventoryArgs, json: bool) -> Result<i32> {
    let (inventory, filter) = filtered_inventory(args).await?;
    let outcome = filter.apply(&inventory);

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.accepted)?);
        return Ok(0);
    }

    println!(
        "{:<24} {:>4} {:>8} {:>9} {:<8} {:<8} {}",
        "NAME", "CPU", "RAM(GB)", "DISK(GB)", "OS", "FW", "HOST"
    );
    for vm in &outcome.accepted {
        println!(
            "{:<24} {:>4} {:>8.1} {:>9.0} {:<8} {:<8?} {}",
            vm.name,
            vm.cpu_count,
            vm.memory_gb(),
            vm.total_disk_gb(),
            vm.guest_os_family.to_string(),
            vm.firmware,
            vm.host
        );
    }
    if !outcome.rejected.is_empty() {
        println!();
        println!("{} VM(s) filtered out:", outcome.rejected.len());
        for r in &outcome.rejected {
            println!("  {} (failed {})", r.vm_name, r.failed_predicate);
        }
    }
    Ok(0)
}

async fn cmd_inventory_plan(
    config: &AppConfig,
    args: &InventoryArgs,
    output: PathBuf,
    strategy: &str,
    zone: Option<String>,
    no_auto_map: bool,
) -> Result<i32> {
    let (inventory, filter) = filtered_inventory(args).await?;
    let accepted = filter.apply(&inventory).accepted;
    if accepted.is_empty() {
        return Err(VmshiftError::Validation(
            "no VMs left after filtering; nothing to plan".into(),
        ));
    }

    let catalog = Catalog::builtin();
    let opts = GeneratePlanOptions {
        zone: zone.unwrap_or_else(|| config.scaleway.default_zone.clone()),
        strategy: parse_strategy(strategy)?,
        auto_map: !no_auto_map,
        default_tags: vec!["vmshift".to_string()],
        headroom: config.limits.sizing_headroom,
    };
    let plan = generate_plan(&accepted, &catalog, &opts);
    plan.validate(&catalog)?;

    tokio::fs::write(&output, plan.to_yaml_string()?).await?;
    info!(
        "wrote plan with {} migration(s) to {}",
        plan.migrations.len(),
        output.display()
    );
    Ok(0)
}

async fn cmd_migrate(
    config: Arc<AppConfig>,
    args: &InventoryArgs,
    vm: String,
    target_type: Option<String>,
    zone: Option<String>,
    mock: bool,
) -> Result<i32> {
    let inventory = load_inventory(args).await?;
    let plan = Plan {
        version: PLAN_VERSION,
        metadata: Default::default(),
        defaults: Default::default(),
        concurrency: Default::default(),
        migrations: vec![MigrationEntry {
            vm_name: Some(vm),
            target_type,
            zone,
            ..Default::default()
        }],
        exclude: vec![],
        waves: vec![],
        post_migration: vec![],
    };

    let (events, rx) = EventSender::channel();
    let logger = spawn_event_logger(rx);
    let clients = clients_for(mock, inventory.clone(), &config).await?;
    let (orchestrator, _cancel) = orchestrator_for(config, clients, events);
    let outcome = orchestrator.start(&plan, &inventory).await?;
    drop(orchestrator);
    let _ = logger.await;
    Ok(outcome_exit_code(&outcome))
}

async fn cmd_estimate(
    config: &AppConfig,
    plan_path: PathBuf,
    args: &InventoryArgs,
    available_disk: Option<f64>,
) -> Result<i32> {
    let plan = Plan::from_yaml_file(&plan_path)?;
    let catalog = Catalog::builtin();
    plan.validate(&catalog)?;
    let inventory = load_inventory(args).await?;
    let expansion = expand_plan(&plan, &inventory, &catalog, config.limits.sizing_headroom)?;
    let est = estimate(&expansion, &plan.concurrency, &catalog, config, available_disk);
    println!("{}", render_estimate(&est));
    Ok(0)
}

async fn cmd_run(
    config: Arc<AppConfig>,
    plan_path: PathBuf,
    args: &InventoryArgs,
    dry: bool,
    mock: bool,
) -> Result<i32> {
    let plan = Plan::from_yaml_file(&plan_path)?;
    let inventory = load_inventory(args).await?;

    if dry {
        let (events, rx) = EventSender::channel();
        let logger = spawn_event_logger(rx);
        let state = dry_run(&plan, &inventory, &config, &events)?;
        drop(events);
        let _ = logger.await;
        println!("{}", render_report(&state));
        return Ok(0);
    }

    let (events, rx) = EventSender::channel();
    let logger = spawn_event_logger(rx);
    let clients = clients_for(mock, inventory.clone(), &config).await?;
    let (orchestrator, _cancel) = orchestrator_for(config, clients, events);
    let outcome = orchestrator.start(&plan, &inventory).await?;
    drop(orchestrator);
    let _ = logger.await;

    println!("{}", render_report(outcome.state()));
    Ok(outcome_exit_code(&outcome))
}

async fn cmd_resume(
    config: Arc<AppConfig>,
    batch_id: Option<String>,
    mock: bool,
) -> Result<i32> {
    let store = StateStore::new(config.batch_state_dir());
    let batch_id = match batch_id {
        Some(id) => id,
        None => store
            .latest_batch()
            .await?
            .map(|b| b.batch_id)
            .ok_or_else(|| VmshiftError::Validation("no batches found to resume".into()))?,
    };

    // The frozen expansion carries the inventory the batch was started
    // with; resume never re-queries vCenter.
    let batch = store.load(&batch_id).await?;
    let inventory: Vec<VMDescriptor> = batch.planned.iter().map(|p| p.vm.clone()).collect();

    let (events, rx) = EventSender::channel();
    let logger = spawn_event_logger(rx);
    let clients = clients_for(mock, inventory, &config).await?;
    let (orchestrator, _cancel) = orchestrator_for(config, clients, events);
    let outcome = orchestrator.resume(&batch_id).await?;
    drop(orchestrator);
    let _ = logger.await;

    println!("{}", render_report(outcome.state()));
    Ok(outcome_exit_code(&outcome))
}

async fn cmd_status(config: &AppConfig, batch_id: Option<String>) -> Result<i32> {
    let store = StateStore::new(config.batch_state_dir());
    let batch = match batch_id {
        Some(id) => store.load(&id).await?,
        None => store
            .latest_batch()
            .await?
            .ok_or_else(|| VmshiftError::Validation("no batches found".into()))?,
    };

    let (completed, failed, pending) = batch.counts();
    println!(
        "batch {} — {} VM(s): {} completed, {} failed, {} pending",
        batch.batch_id,
        batch.vm_states.len(),
        completed,
        failed,
        pending
    );
    for wave in &batch.waves {
        println!("  wave {:<16} {:?} ({} VMs)", wave.name, wave.status, wave.migration_ids.len());
    }
    for state in batch.vm_states.values() {
        let detail = match (&state.status, &state.last_error) {
            (VmMigrationStatus::Failed, Some(e)) => format!(" [{} at {}]", e.kind, e.stage),
            (_, _) => state
                .current_stage
                .as_ref()
                .map(|s| format!(" [{s}]"))
                .unwrap_or_default(),
        };
        println!(
            "  {:<24} {:?} ({}/{} stages){detail}",
            state.vm_name,
            state.status,
            state.completed_stages.len(),
            vmshift::stages::stages_for(
                batch
                    .planned
                    .iter()
                    .find(|p| p.vm.uuid == state.vm_uuid)
                    .map(|p| p.vm.guest_os_family)
                    .unwrap_or(vmshift::types::OsFamily::Linux)
            )
            .len(),
        );
    }
    Ok(if failed > 0 { 3 } else { 0 })
}

async fn cmd_report(
    config: &AppConfig,
    batch_id: Option<String>,
    output: Option<PathBuf>,
) -> Result<i32> {
    let store = StateStore::new(config.batch_state_dir());
    let batch = match batch_id {
        Some(id) => store.load(&id).await?,
        None => store
            .latest_batch()
            .await?
            .ok_or_else(|| VmshiftError::Validation("no batches found".into()))?,
    };
    let report = render_report(&batch);
    match output {
        Some(path) => {
            tokio::fs::write(&path, &report).await?;
            info!("report written to {}", path.display());
        }
        None => println!("{report}"),
    }
    Ok(0)
}
