//! Command-line surface.
//!
//! The CLI stays thin: it parses arguments, loads config and credentials,
//! wires clients, and hands everything to the library. Filter strings use
//! the `key:value` shorthand (`name:web-*`, `os:linux`, `host:esxi-0?`).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::error::{Result, VmshiftError};
use crate::filter::Predicate;
use crate::types::{Firmware, OsFamily, PowerState};

#[derive(Parser, Debug)]
#[command(
    name = "vmshift",
    version,
    about = "Batch migration of VMware vSphere VMs to Scaleway"
)]
pub struct Cli {
    /// Path to the YAML config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the configured work directory.
    #[arg(long, global = true)]
    pub work_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Shared inventory-source options. The vSphere connection itself is an
/// external collaborator; a JSON descriptor dump stands in for it.
#[derive(Args, Debug, Clone)]
pub struct InventoryArgs {
    /// JSON file with an array of VM descriptors (as produced by
    /// `inventory --json`).
    #[arg(long)]
    pub inventory_file: Option<PathBuf>,

    /// Filter expression, repeatable: name:GLOB, regex:RE, folder:/path,
    /// os:linux|windows, host:GLOB, cluster:GLOB, dc:NAME,
    /// state:poweredOn|poweredOff|suspended, firmware:bios|efi.
    #[arg(long = "filter", value_name = "KEY:VALUE")]
    pub filters: Vec<String>,

    #[arg(long)]
    pub min_cpu: Option<u32>,
    #[arg(long)]
    pub max_cpu: Option<u32>,
    #[arg(long)]
    pub min_ram_gb: Option<u32>,
    #[arg(long)]
    pub max_disk_gb: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List and filter the source inventory.
    Inventory {
        #[command(flatten)]
        inventory: InventoryArgs,

        /// Emit machine-readable JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Filter the inventory and generate a reviewable migration plan.
    InventoryPlan {
        #[command(flatten)]
        inventory: InventoryArgs,

        /// Output plan path.
        #[arg(long, default_value = "plan.yaml")]
        output: PathBuf,

        /// Sizing strategy: exact, optimize or cost.
        #[arg(long, default_value = "optimize")]
        strategy: String,

        /// Target zone for the generated defaults.
        #[arg(long)]
        zone: Option<String>,

        /// Do not auto-map instance types.
        #[arg(long)]
        no_auto_map: bool,
    },

    /// Migrate a single VM (a one-entry batch).
    Migrate {
        #[command(flatten)]
        inventory: InventoryArgs,

        /// Source VM name.
        #[arg(long)]
        vm: String,

        /// Target instance type; auto-sized when omitted.
        #[arg(long)]
        target_type: Option<String>,

        #[arg(long)]
        zone: Option<String>,

        /// Use in-memory mock backends (no vCenter, no cloud side).
        #[arg(long)]
        mock: bool,
    },

    /// Batch operations over a migration plan.
    Batch {
        #[command(subcommand)]
        command: BatchCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum BatchCommands {
    /// Project cost, duration and disk needs for a plan.
    Estimate {
        #[arg(long)]
        plan: PathBuf,

        #[command(flatten)]
        inventory: InventoryArgs,

        /// Available work-space on this host, GiB.
        #[arg(long)]
        available_disk: Option<f64>,
    },

    /// Execute a plan.
    Run {
        #[arg(long)]
        plan: PathBuf,

        #[command(flatten)]
        inventory: InventoryArgs,

        /// Simulate only: no state writes, no subprocesses, no network.
        #[arg(long)]
        dry_run: bool,

        /// Use in-memory mock backends.
        #[arg(long)]
        mock: bool,
    },

    /// Resume a paused or partially failed batch.
    Resume {
        /// Batch to resume; defaults to the most recent one.
        #[arg(long)]
        batch_id: Option<String>,

        /// Use in-memory mock backends.
        #[arg(long)]
        mock: bool,
    },

    /// Show the state of a batch.
    Status {
        #[arg(long)]
        batch_id: Option<String>,
    },

    /// Render the post-migration Markdown report.
    Report {
        #[arg(long)]
        batch_id: Option<String>,

        /// Write the report here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

/// Parse `key:value` filter strings plus the numeric range flags into
/// predicates. A bare string is a name glob.
pub fn parse_filters(args: &InventoryArgs) -> Result<Vec<Predicate>> {
    let mut preds = Vec::new();
    for raw in &args.filters {
        let (key, value) = match raw.split_once(':') {
            Some((k, v)) => (k.trim().to_lowercase(), v.trim().to_string()),
            None => ("name".to_string(), raw.trim().to_string()),
        };
        let pred = match key.as_str() {
            "name" => Predicate::NameGlob(value),
            "regex" => Predicate::NameRegex(value),
            "folder" => Predicate::FolderPrefix(value),
            "os" => Predicate::OsFamily(parse_os_family(&value)?),
            "host" => Predicate::HostGlob(value),
            "cluster" => Predicate::ClusterGlob(value),
            "dc" | "datacenter" => Predicate::Datacenter(value),
            "state" => Predicate::PowerState(parse_power_state(&value)?),
            "firmware" => Predicate::Firmware(parse_firmware(&value)?),
            other => {
                return Err(VmshiftError::Validation(format!(
                    "unknown filter key '{other}' (in '{raw}')"
                )));
            }
        };
        preds.push(pred);
    }
    if let Some(n) = args.min_cpu {
        preds.push(Predicate::MinCpu(n));
    }
    if let Some(n) = args.max_cpu {
        preds.push(Predicate::MaxCpu(n));
    }
    if let Some(n) = args.min_ram_gb {
        preds.push(Predicate::MinRamGb(n));
    }
    if let Some(n) = args.max_disk_gb {
        preds.push(Predicate::MaxDiskTotalGb(n));
    }
    Ok(preds)
}

fn parse_os_family(value: &str) -> Result<OsFamily> {
    match value.to_lowercase().as_str() {
        "linux" => Ok(OsFamily::Linux),
        "windows" => Ok(OsFamily::Windows),
        "other" => Ok(OsFamily::Other),
        other => Err(VmshiftError::Validation(format!(
            "unknown os family '{other}' (expected linux, windows or other)"
        ))),
    }
}

fn parse_power_state(value: &str) -> Result<PowerState> {
    match value {
        "poweredOn" => Ok(PowerState::PoweredOn),
        "poweredOff" => Ok(PowerState::PoweredOff),
        "suspended" => Ok(PowerState::Suspended),
        other => Err(VmshiftError::Validation(format!(
            "unknown power state '{other}'"
        ))),
    }
}

fn parse_firmware(value: &str) -> Result<Firmware> {
    match value.to_lowercase().as_str() {
        "bios" => Ok(Firmware::Bios),
        "efi" | "uefi" => Ok(Firmware::Efi),
        other => Err(VmshiftError::Validation(format!(
            "unknown firmware '{other}' (expected bios or efi)"
        ))),
    }
}

pub fn parse_strategy(value: &str) -> Result<crate::sizing::SizingStrategy> {
    match value.to_lowercase().as_str() {
        "exact" => Ok(crate::sizing::SizingStrategy::Exact),
        "optimize" => Ok(crate::sizing::SizingStrategy::Optimize),
        "cost" => Ok(crate::sizing::SizingStrategy::Cost),
        other => Err(VmshiftError::Validation(format!(
            "unknown sizing strategy '{other}' (expected exact, optimize or cost)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(filters: &[&str]) -> InventoryArgs {
        InventoryArgs {
            inventory_file: None,
            filters: filters.iter().map(|s| s.to_string()).collect(),
            min_cpu: None,
            max_cpu: None,
            min_ram_gb: None,
            max_disk_gb: None,
        }
    }

    #[test]
    fn parses_key_value_filters() {
        let preds = parse_filters(&args(&["name:web-*", "os:linux", "firmware:efi"])).unwrap();
        assert_eq!(preds.len(), 3);
        assert_eq!(preds[0], Predicate::NameGlob("web-*".into()));
        assert_eq!(preds[1], Predicate::OsFamily(OsFamily::Linux));
        assert_eq!(preds[2], Predicate::Firmware(Firmware::Efi));
    }

    #[test]
    fn bare_string_is_a_name_glob() {
        let preds = parse_filters(&args(&["db-??"])).unwrap();
        assert_eq!(preds, vec![Predicate::NameGlob("db-??".into())]);
    }

    #[test]
    fn numeric_flags_become_predicates() {
        let mut a = args(&[]);
        a.min_cpu = Some(4);
        a.max_disk_gb = Some(500);
        let preds = parse_filters(&a).unwrap();
        assert!(preds.contains(&Predicate::MinCpu(4)));
        assert!(preds.contains(&Predicate::MaxDiskTotalGb(500)));
    }

    #[test]
    fn unknown_filter_key_is_rejected() {
        let err = parse_filters(&args(&["flavor:large"])).unwrap_err();
        assert!(err.to_string().contains("unknown filter key"));
    }

    #[test]
    fn cli_parses_batch_run() {
        let cli = Cli::try_parse_from([
            "vmshift", "batch", "run", "--plan", "plan.yaml", "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Batch {
                command: BatchCommands::Run { dry_run, plan, .. },
            } => {
                assert!(dry_run);
                assert_eq!(plan, PathBuf::from("plan.yaml"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
