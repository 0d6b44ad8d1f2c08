//! Predicate-based inventory filtering.
//!
//! Predicates compose with implicit AND. Evaluation is pure over a
//! [`VMDescriptor`]; no I/O. For debuggability the filter reports, for each
//! rejected VM, the first predicate that failed.

use globset::{Glob, GlobMatcher};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VmshiftError};
use crate::types::{Firmware, OsFamily, PowerState, VMDescriptor};

/// A single filter clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Shell-style glob (`*`, `?`, `[set]`), anchored to the whole name.
    NameGlob(String),
    /// ERE-compatible regex, anchored only if the author writes `^`/`$`.
    NameRegex(String),
    /// Matches if the VM's folder path equals, or is a child of, the path.
    FolderPrefix(String),
    OsFamily(OsFamily),
    HostGlob(String),
    ClusterGlob(String),
    Datacenter(String),
    PowerState(PowerState),
    Firmware(Firmware),
    MinCpu(u32),
    MaxCpu(u32),
    MinRamGb(u32),
    MaxDiskTotalGb(u64),
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::NameGlob(p) => write!(f, "name_glob({p})"),
            Predicate::NameRegex(p) => write!(f, "name_regex({p})"),
            Predicate::FolderPrefix(p) => write!(f, "folder_prefix({p})"),
            Predicate::OsFamily(v) => write!(f, "os_family({v})"),
            Predicate::HostGlob(p) => write!(f, "host_glob({p})"),
            Predicate::ClusterGlob(p) => write!(f, "cluster_glob({p})"),
            Predicate::Datacenter(v) => write!(f, "datacenter({v})"),
            Predicate::PowerState(v) => write!(f, "power_state({v:?})"),
            Predicate::Firmware(v) => write!(f, "firmware({v:?})"),
            Predicate::MinCpu(n) => write!(f, "min_cpu({n})"),
            Predicate::MaxCpu(n) => write!(f, "max_cpu({n})"),
            Predicate::MinRamGb(n) => write!(f, "min_ram_gb({n})"),
            Predicate::MaxDiskTotalGb(n) => write!(f, "max_disk_total_gb({n})"),
        }
    }
}

enum Compiled {
    Glob(GlobMatcher),
    Regex(Regex),
    Plain,
}

/// A compiled set of predicates, ready for evaluation.
pub struct FilterSet {
    preds: Vec<(Predicate, Compiled)>,
}

/// A VM rejected by the filter, with the first predicate that failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedVm {
    pub vm_name: String,
    pub failed_predicate: String,
}

/// Outcome of filtering an inventory. Order of `accepted` follows the
/// input order, making filtering deterministic.
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub accepted: Vec<VMDescriptor>,
    pub rejected: Vec<RejectedVm>,
}

impl FilterSet {
    /// Compile predicates; bad glob or regex syntax is a validation error.
    pub fn compile(preds: Vec<Predicate>) -> Result<Self> {
        let mut compiled = Vec::with_capacity(preds.len());
        for p in preds {
            let c = match &p {
                Predicate::NameGlob(pat)
                | Predicate::HostGlob(pat)
                | Predicate::ClusterGlob(pat) => Compiled::Glob(compile_glob(pat)?),
                Predicate::NameRegex(pat) => Compiled::Regex(
                    Regex::new(pat)
                        .map_err(|e| VmshiftError::Validation(format!("bad regex '{pat}': {e}")))?,
                ),
                _ => Compiled::Plain,
            };
            compiled.push((p, c));
        }
        Ok(Self { preds: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.preds.is_empty()
    }

    /// True if every predicate matches the VM.
    pub fn matches(&self, vm: &VMDescriptor) -> bool {
        self.first_failing(vm).is_none()
    }

    /// The first predicate the VM fails, if any.
    pub fn first_failing(&self, vm: &VMDescriptor) -> Option<&Predicate> {
        for (pred, compiled) in &self.preds {
            if !eval(pred, compiled, vm) {
                return Some(pred);
            }
        }
        None
    }

    /// Partition an inventory into accepted and rejected VMs.
    pub fn apply(&self, inventory: &[VMDescriptor]) -> FilterOutcome {
        let mut out = FilterOutcome::default();
        for vm in inventory {
            match self.first_failing(vm) {
                None => out.accepted.push(vm.clone()),
                Some(pred) => out.rejected.push(RejectedVm {
                    vm_name: vm.name.clone(),
                    failed_predicate: pred.to_string(),
                }),
            }
        }
        out
    }
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| VmshiftError::Validation(format!("bad glob '{pattern}': {e}")))
}

fn eval(pred: &Predicate, compiled: &Compiled, vm: &VMDescriptor) -> bool {
    match (pred, compiled) {
        (Predicate::NameGlob(_), Compiled::Glob(g)) => g.is_match(&vm.name),
        (Predicate::NameRegex(_), Compiled::Regex(r)) => r.is_match(&vm.name),
        (Predicate::HostGlob(_), Compiled::Glob(g)) => g.is_match(&vm.host),
        (Predicate::ClusterGlob(_), Compiled::Glob(g)) => g.is_match(&vm.cluster),
        (Predicate::FolderPrefix(prefix), _) => folder_matches(prefix, &vm.folder_path),
        (Predicate::OsFamily(family), _) => vm.guest_os_family == *family,
        (Predicate::Datacenter(dc), _) => vm.datacenter == *dc,
        (Predicate::PowerState(state), _) => vm.power_state == *state,
        (Predicate::Firmware(fw), _) => vm.firmware == *fw,
        (Predicate::MinCpu(n), _) => vm.cpu_count >= *n,
        (Predicate::MaxCpu(n), _) => vm.cpu_count <= *n,
        (Predicate::MinRamGb(n), _) => vm.memory_mb >= (*n as u64) * 1024,
        (Predicate::MaxDiskTotalGb(n), _) => vm.total_disk_gb() <= *n as f64,
        // Unreachable: compile() pairs each predicate with its matcher kind.
        _ => false,
    }
}

/// Equal to the prefix, or a slash-separated child of it.
fn folder_matches(prefix: &str, folder: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    let folder = folder.trim_end_matches('/');
    folder == prefix || folder.starts_with(&format!("{prefix}/"))
}
