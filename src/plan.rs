//! Migration plan: YAML model, validation, and expansion against a
//! filtered inventory.
//!
//! A plan is produced once (by hand or by `inventory-plan`) and is
//! immutable for a given batch; pattern entries are frozen into concrete
//! VM entries at expansion time, so a running batch never re-queries
//! vCenter for identity.

use std::collections::BTreeMap;
use std::path::Path;

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::catalog::Catalog;
use crate::error::{Result, VmshiftError};
use crate::sizing::{select_instance_type, SizingStrategy};
use crate::types::{normalize_guest_id, Firmware, OsFamily, VMDescriptor};

pub const PLAN_VERSION: u32 = 1;
pub const DEFAULT_ZONE: &str = "fr-par-1";
/// Name of the implicit wave holding entries assigned to no declared wave.
pub const DEFAULT_WAVE: &str = "default";

/// Per-resource-class concurrency caps (see the semaphore module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConcurrencyCaps {
    /// Concurrent VM pipelines.
    pub global: usize,
    /// NFC export leases per ESXi host.
    pub per_esxi_host: usize,
    /// Local disk throughput slots (conversion and adaptation).
    pub disk_io: usize,
    /// Concurrent S3 uploads.
    pub s3_upload: usize,
    /// Concurrent cloud API calls.
    pub scw_api: usize,
}

impl Default for ConcurrencyCaps {
    fn default() -> Self {
        Self {
            global: 10,
            per_esxi_host: 4,
            disk_io: 3,
            s3_upload: 6,
            scw_api: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PlanDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sizing_strategy: Option<SizingStrategy>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Explicit per-entry overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EntryOverrides {
    /// Force the firmware handling regardless of what the source reports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<Firmware>,
}

impl EntryOverrides {
    fn is_empty(&self) -> bool {
        self.firmware.is_none()
    }
}

/// One planned migration. Exactly one of `vm_name`/`vm_pattern` selects
/// the source VM(s).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MigrationEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sizing_strategy: Option<SizingStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "EntryOverrides::is_empty")]
    pub overrides: EntryOverrides,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

pub const DEFAULT_PRIORITY: i32 = 5;

/// Exclusion selector, same shape as an entry selector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Selector {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseAfter {
    #[default]
    Continue,
    Pause,
    PauseOnFailure,
}

/// An ordered cohort of migrations sharing a pause policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WaveSpec {
    pub name: String,
    /// Glob patterns over VM names; a VM may also join by its entry's
    /// `wave` field.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<String>,
    pub pause_after: PauseAfter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostAction {
    PowerOffSource,
    TagSource { tag: String },
    DeleteSourceSnapshot,
}

/// Root plan object (YAML file format, version 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub version: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "is_default_defaults")]
    pub defaults: PlanDefaults,
    #[serde(default, skip_serializing_if = "is_default_caps")]
    pub concurrency: ConcurrencyCaps,
    pub migrations: Vec<MigrationEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<Selector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waves: Vec<WaveSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_migration: Vec<PostAction>,
}

fn is_default_defaults(d: &PlanDefaults) -> bool {
    *d == PlanDefaults::default()
}

fn is_default_caps(c: &ConcurrencyCaps) -> bool {
    *c == ConcurrencyCaps::default()
}

impl Plan {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let plan: Plan = serde_yaml::from_str(text)
            .map_err(|e| VmshiftError::Validation(format!("plan parse error: {e}")))?;
        Ok(plan)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VmshiftError::Validation(format!("cannot read plan {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// SHA-256 over the plan's canonical JSON; stored in batch state so a
    /// resume can detect a swapped plan file.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex_string(&Sha256::digest(&canonical))
    }

    /// Static plan invariants (everything checkable without an inventory).
    pub fn validate(&self, catalog: &Catalog) -> Result<()> {
        if self.version != PLAN_VERSION {
            return Err(VmshiftError::Validation(format!(
                "unsupported plan version {} (expected {PLAN_VERSION})",
                self.version
            )));
        }
        if self.migrations.is_empty() {
            return Err(VmshiftError::Validation("plan has no migrations".into()));
        }

        let mut wave_names = Vec::new();
        for wave in &self.waves {
            if wave.name.is_empty() {
                return Err(VmshiftError::Validation("wave with empty name".into()));
            }
            if wave_names.contains(&wave.name) {
                return Err(VmshiftError::Validation(format!(
                    "duplicate wave name '{}'",
                    wave.name
                )));
            }
            for sel in &wave.selectors {
                compile_glob(sel)?;
            }
            wave_names.push(wave.name.clone());
        }

        for (i, entry) in self.migrations.iter().enumerate() {
            match (&entry.vm_name, &entry.vm_pattern) {
                (Some(_), Some(_)) => {
                    return Err(VmshiftError::Validation(format!(
                        "migration #{i}: vm_name and vm_pattern are mutually exclusive"
                    )));
                }
                (None, None) => {
                    return Err(VmshiftError::Validation(format!(
                        "migration #{i}: one of vm_name or vm_pattern is required"
                    )));
                }
                (None, Some(p)) => {
                    compile_glob(p)?;
                }
                _ => {}
            }
            if let Some(t) = &entry.target_type {
                if !catalog.contains(t) {
                    return Err(VmshiftError::Validation(format!(
                        "migration #{i}: unknown instance type '{t}'"
                    )));
                }
            }
            if let Some(w) = &entry.wave {
                if !wave_names.iter().any(|n| n == w) && w != DEFAULT_WAVE {
                    return Err(VmshiftError::Validation(format!(
                        "migration #{i}: wave '{w}' is not declared"
                    )));
                }
            }
        }

        for (i, sel) in self.exclude.iter().enumerate() {
            match (&sel.vm_name, &sel.vm_pattern) {
                (Some(_), Some(_)) | (None, None) => {
                    return Err(VmshiftError::Validation(format!(
                        "exclude #{i}: exactly one of vm_name or vm_pattern is required"
                    )));
                }
                (None, Some(p)) => {
                    compile_glob(p)?;
                }
                _ => {}
            }
        }

        let caps = &self.concurrency;
        for (name, value) in [
            ("global", caps.global),
            ("per_esxi_host", caps.per_esxi_host),
            ("disk_io", caps.disk_io),
            ("s3_upload", caps.s3_upload),
            ("scw_api", caps.scw_api),
        ] {
            if value == 0 {
                return Err(VmshiftError::Validation(format!(
                    "concurrency.{name} must be at least 1"
                )));
            }
        }

        Ok(())
    }
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| VmshiftError::Validation(format!("bad glob '{pattern}': {e}")))
}

pub(crate) fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Expansion
// ---------------------------------------------------------------------------

/// One concrete VM scheduled for migration, produced by expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedVm {
    pub vm: VMDescriptor,
    /// Index of the plan entry this VM was selected by.
    pub entry_index: usize,
    pub target_type: String,
    pub zone: String,
    pub strategy: SizingStrategy,
    pub priority: i32,
    pub wave: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_firmware: Option<Firmware>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// A VM that could not be mapped to any instance type; planning continues
/// but the entry is quarantined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmappableVm {
    pub vm_name: String,
    pub reason: String,
}

/// A wave with its resolved, ordered membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedWave {
    pub name: String,
    pub pause_after: PauseAfter,
    /// VM names in scheduling order (priority, then plan order).
    pub vm_names: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Expansion {
    /// Scheduling order: priority ascending, then plan order.
    pub planned: Vec<PlannedVm>,
    pub waves: Vec<PlannedWave>,
    pub unmappable: Vec<UnmappableVm>,
    /// Names dropped by exclusion selectors.
    pub excluded: Vec<String>,
    pub warnings: Vec<String>,
}

/// Expand a validated plan against a filtered inventory.
pub fn expand_plan(
    plan: &Plan,
    inventory: &[VMDescriptor],
    catalog: &Catalog,
    headroom: f64,
) -> Result<Expansion> {
    let mut out = Expansion::default();

    let excludes: Vec<(Option<&str>, Option<GlobMatcher>)> = plan
        .exclude
        .iter()
        .map(|sel| match (&sel.vm_name, &sel.vm_pattern) {
            (Some(name), _) => Ok((Some(name.as_str()), None)),
            (_, Some(pattern)) => Ok((None, Some(compile_glob(pattern)?))),
            _ => Err(VmshiftError::Validation("empty exclude selector".into())),
        })
        .collect::<Result<_>>()?;

    let is_excluded = |name: &str| -> bool {
        excludes.iter().any(|(exact, glob)| match (exact, glob) {
            (Some(n), _) => *n == name,
            (_, Some(g)) => g.is_match(name),
            _ => false,
        })
    };

    // Selection: uuid -> (priority, entry_index, vm). Lowest priority wins;
    // ties resolve to the earliest plan entry.
    let mut selected: BTreeMap<String, (i32, usize, VMDescriptor)> = BTreeMap::new();

    for (idx, entry) in plan.migrations.iter().enumerate() {
        let priority = entry.priority.unwrap_or(DEFAULT_PRIORITY);
        let matches: Vec<&VMDescriptor> = match (&entry.vm_name, &entry.vm_pattern) {
            (Some(name), _) => {
                if is_excluded(name) {
                    return Err(VmshiftError::Validation(format!(
                        "migration #{idx}: vm '{name}' is both selected by name and excluded"
                    )));
                }
                let found: Vec<_> = inventory.iter().filter(|vm| vm.name == *name).collect();
                if found.is_empty() {
                    out.warnings
                        .push(format!("vm '{name}' not found in inventory"));
                }
                found
            }
            (_, Some(pattern)) => {
                let glob = compile_glob(pattern)?;
                inventory
                    .iter()
                    .filter(|vm| glob.is_match(&vm.name))
                    .filter(|vm| {
                        if is_excluded(&vm.name) {
                            if !out.excluded.contains(&vm.name) {
                                out.excluded.push(vm.name.clone());
                            }
                            false
                        } else {
                            true
                        }
                    })
                    .collect()
            }
            _ => {
                return Err(VmshiftError::Validation(format!(
                    "migration #{idx}: one of vm_name or vm_pattern is required"
                )));
            }
        };

        for vm in matches {
            let keep_existing = selected
                .get(&vm.uuid)
                .is_some_and(|(prev_priority, prev_idx, _)| (*prev_priority, *prev_idx) <= (priority, idx));
            if !keep_existing {
                selected.insert(vm.uuid.clone(), (priority, idx, vm.clone()));
            }
        }
    }

    // Stable scheduling order: priority, then plan order, then name.
    let mut chosen: Vec<(i32, usize, VMDescriptor)> = selected.into_values().collect();
    chosen.sort_by(|a, b| (a.0, a.1, &a.2.name).cmp(&(b.0, b.1, &b.2.name)));

    let wave_matchers: Vec<(String, Vec<GlobMatcher>)> = plan
        .waves
        .iter()
        .map(|w| {
            let globs = w
                .selectors
                .iter()
                .map(|s| compile_glob(s))
                .collect::<Result<Vec<_>>>()?;
            Ok((w.name.clone(), globs))
        })
        .collect::<Result<_>>()?;

    for (priority, entry_index, vm) in chosen {
        let entry = &plan.migrations[entry_index];
        let mut warnings = Vec::new();

        if vm.guest_os_family == OsFamily::Other {
            out.unmappable.push(UnmappableVm {
                vm_name: vm.name.clone(),
                reason: format!("guest OS '{}' is not auto-migratable", vm.guest_os_full),
            });
            continue;
        }

        let strategy = entry
            .sizing_strategy
            .or(plan.defaults.sizing_strategy)
            .unwrap_or_default();

        let target_type = match &entry.target_type {
            Some(t) => {
                let spec = catalog.get(t).ok_or_else(|| {
                    VmshiftError::Validation(format!("unknown instance type '{t}'"))
                })?;
                if vm.guest_os_family == OsFamily::Windows && !spec.windows_allowed {
                    return Err(VmshiftError::Validation(format!(
                        "vm '{}' is Windows but target type '{t}' is not Windows-allowed",
                        vm.name
                    )));
                }
                t.clone()
            }
            None => {
                let sized = select_instance_type(&vm, strategy, catalog, headroom);
                if sized.fell_back_to_exact {
                    warnings.push(format!(
                        "vm '{}': no type with {headroom:.1}x headroom, fell back to exact sizing",
                        vm.name
                    ));
                }
                match sized.chosen {
                    Some(t) => t,
                    None => {
                        out.unmappable.push(UnmappableVm {
                            vm_name: vm.name.clone(),
                            reason: format!(
                                "no instance type fits {} vCPU / {:.0} GiB RAM / {:.0} GiB disk",
                                vm.cpu_count,
                                vm.memory_gb(),
                                vm.total_disk_gb()
                            ),
                        });
                        continue;
                    }
                }
            }
        };

        // Wave membership: explicit entry wave first, then wave selectors,
        // which must be disjoint after exclusions.
        let wave = match &entry.wave {
            Some(w) => w.clone(),
            None => {
                let hits: Vec<&str> = wave_matchers
                    .iter()
                    .filter(|(_, globs)| globs.iter().any(|g| g.is_match(&vm.name)))
                    .map(|(name, _)| name.as_str())
                    .collect();
                match hits.as_slice() {
                    [] => DEFAULT_WAVE.to_string(),
                    [one] => one.to_string(),
                    many => {
                        return Err(VmshiftError::Validation(format!(
                            "vm '{}' matches selectors of multiple waves: {}",
                            vm.name,
                            many.join(", ")
                        )));
                    }
                }
            }
        };

        let mut tags = plan.defaults.tags.clone();
        tags.extend(entry.tags.iter().cloned());

        out.planned.push(PlannedVm {
            zone: entry
                .zone
                .clone()
                .or_else(|| plan.defaults.zone.clone())
                .unwrap_or_else(|| DEFAULT_ZONE.to_string()),
            vm,
            entry_index,
            target_type,
            strategy,
            priority,
            wave,
            tags,
            force_firmware: entry.overrides.firmware,
            warnings,
        });
    }

    // Wave order: declared order, plus the implicit default wave at the end
    // when anything landed there.
    let mut wave_order: Vec<(String, PauseAfter)> = plan
        .waves
        .iter()
        .map(|w| (w.name.clone(), w.pause_after))
        .collect();
    if out.planned.iter().any(|p| p.wave == DEFAULT_WAVE)
        && !wave_order.iter().any(|(n, _)| n == DEFAULT_WAVE)
    {
        wave_order.push((DEFAULT_WAVE.to_string(), PauseAfter::Continue));
    }

    for (name, pause_after) in wave_order {
        let vm_names: Vec<String> = out
            .planned
            .iter()
            .filter(|p| p.wave == name)
            .map(|p| p.vm.name.clone())
            .collect();
        if vm_names.is_empty() {
            out.warnings.push(format!("wave '{name}' matches no VMs"));
        }
        out.waves.push(PlannedWave {
            name,
            pause_after,
            vm_names,
        });
    }

    Ok(out)
}

// ---------------------------------------------------------------------------
// Plan generation from a filtered inventory
// ---------------------------------------------------------------------------

/// Options for [`generate_plan`].
#[derive(Debug, Clone)]
pub struct GeneratePlanOptions {
    pub zone: String,
    pub strategy: SizingStrategy,
    pub auto_map: bool,
    pub default_tags: Vec<String>,
    pub headroom: f64,
}

impl Default for GeneratePlanOptions {
    fn default() -> Self {
        Self {
            zone: DEFAULT_ZONE.to_string(),
            strategy: SizingStrategy::default(),
            auto_map: true,
            default_tags: Vec::new(),
            headroom: crate::sizing::DEFAULT_HEADROOM,
        }
    }
}

/// Build a reviewable plan from a filtered inventory, one exact-name entry
/// per VM, with auto-mapped target types and human-readable notes.
pub fn generate_plan(
    vms: &[VMDescriptor],
    catalog: &Catalog,
    opts: &GeneratePlanOptions,
) -> Plan {
    let mut migrations = Vec::with_capacity(vms.len());
    let mut total_disk = 0.0;
    let mut windows = 0usize;
    let mut linux = 0usize;

    for vm in vms {
        let mut notes = Vec::new();
        if vm.firmware == Firmware::Bios {
            notes.push("BIOS to UEFI conversion needed".to_string());
        }
        match vm.guest_os_family {
            OsFamily::Windows => {
                notes.push("Windows: VirtIO driver injection required".to_string());
                windows += 1;
            }
            OsFamily::Linux => linux += 1,
            OsFamily::Other => notes.push("unsupported guest OS".to_string()),
        }
        notes.push(format!(
            "{}vCPU/{:.0}GB/{:.0}GB",
            vm.cpu_count,
            vm.memory_gb(),
            vm.total_disk_gb()
        ));
        if !vm.guest_os_full.is_empty() {
            notes.push(normalize_guest_id(&vm.guest_os_full).1);
        }
        total_disk += vm.total_disk_gb();

        let target_type = if opts.auto_map && vm.guest_os_family != OsFamily::Other {
            select_instance_type(vm, opts.strategy, catalog, opts.headroom).chosen
        } else {
            None
        };

        migrations.push(MigrationEntry {
            vm_name: Some(vm.name.clone()),
            target_type,
            priority: Some(DEFAULT_PRIORITY),
            notes: Some(notes.join(" | ")),
            ..Default::default()
        });
    }

    let mut metadata = BTreeMap::new();
    metadata.insert("total_vms".to_string(), serde_json::json!(vms.len()));
    metadata.insert("linux_vms".to_string(), serde_json::json!(linux));
    metadata.insert("windows_vms".to_string(), serde_json::json!(windows));
    metadata.insert(
        "total_disk_gb".to_string(),
        serde_json::json!((total_disk * 10.0).round() / 10.0),
    );

    Plan {
        version: PLAN_VERSION,
        metadata,
        defaults: PlanDefaults {
            zone: Some(opts.zone.clone()),
            sizing_strategy: Some(opts.strategy),
            tags: opts.default_tags.clone(),
        },
        concurrency: ConcurrencyCaps::default(),
        migrations,
        exclude: Vec::new(),
        waves: Vec::new(),
        post_migration: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiskInfo, PowerState};

    fn vm(name: &str, family: OsFamily) -> VMDescriptor {
        VMDescriptor {
            name: name.into(),
            uuid: format!("uuid-{name}"),
            cpu_count: 2,
            memory_mb: 4096,
            power_state: PowerState::PoweredOn,
            guest_os_family: family,
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
            nics: vec![],
            tools_status: "toolsOk".into(),
            snapshot_names: vec![],
            datacenter: "dc1".into(),
            cluster: "cl1".into(),
            host: "esxi-01".into(),
            folder_path: "/prod".into(),
        }
    }

    fn sample_plan_yaml() -> &'static str {
        r#"
version: 1
defaults:
  zone: fr-par-1
  sizing_strategy: optimize
migrations:
  - vm_name: web-prod-01
    target_type: POP2-4C-16G
    priority: 1
  - vm_pattern: "dev-*"
    target_type: PLAY2-MICRO
    priority: 5
exclude:
  - vm_pattern: "template-*"
"#
    }

    #[test]
    fn parse_and_validate_sample_plan() {
        let plan = Plan::from_yaml_str(sample_plan_yaml()).unwrap();
        plan.validate(&Catalog::builtin()).unwrap();
        assert_eq!(plan.migrations.len(), 2);
        assert_eq!(plan.defaults.zone.as_deref(), Some("fr-par-1"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Plan::from_yaml_str("version: 1\nmigrations: []\nbogus_key: 1\n").unwrap_err();
        assert!(matches!(err, VmshiftError::Validation(_)));
    }

    #[test]
    fn both_selectors_rejected() {
        let plan = Plan::from_yaml_str(
            "version: 1\nmigrations:\n  - vm_name: a\n    vm_pattern: 'b-*'\n",
        )
        .unwrap();
        let err = plan.validate(&Catalog::builtin()).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn undeclared_wave_rejected() {
        let plan =
            Plan::from_yaml_str("version: 1\nmigrations:\n  - vm_name: a\n    wave: canary\n")
                .unwrap();
        let err = plan.validate(&Catalog::builtin()).unwrap_err();
        assert!(err.to_string().contains("not declared"));
    }

    #[test]
    fn yaml_round_trip_is_stable() {
        let plan = Plan::from_yaml_str(sample_plan_yaml()).unwrap();
        let serialized = plan.to_yaml_string().unwrap();
        let reparsed = Plan::from_yaml_str(&serialized).unwrap();
        assert_eq!(plan, reparsed);
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let a = Plan::from_yaml_str(sample_plan_yaml()).unwrap();
        let b = Plan::from_yaml_str(sample_plan_yaml()).unwrap();
        assert_eq!(a.digest(), b.digest());

        let mut c = a.clone();
        c.migrations[0].priority = Some(2);
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn exclusion_overrides_pattern_match() {
        let plan = Plan::from_yaml_str(
            r#"
version: 1
migrations:
  - vm_pattern: "prod-*"
    target_type: PRO2-XS
exclude:
  - vm_name: prod-legacy
"#,
        )
        .unwrap();
        let inventory = vec![
            vm("prod-a", OsFamily::Linux),
            vm("prod-b", OsFamily::Linux),
            vm("prod-legacy", OsFamily::Linux),
        ];
        let exp = expand_plan(&plan, &inventory, &Catalog::builtin(), 1.2).unwrap();
        let names: Vec<_> = exp.planned.iter().map(|p| p.vm.name.as_str()).collect();
        assert_eq!(names, vec!["prod-a", "prod-b"]);
        assert_eq!(exp.excluded, vec!["prod-legacy".to_string()]);
    }

    #[test]
    fn exact_name_excluded_is_an_error() {
        let plan = Plan::from_yaml_str(
            r#"
version: 1
migrations:
  - vm_name: prod-legacy
    target_type: PRO2-XS
exclude:
  - vm_name: prod-legacy
"#,
        )
        .unwrap();
        let err = expand_plan(&plan, &[vm("prod-legacy", OsFamily::Linux)], &Catalog::builtin(), 1.2)
            .unwrap_err();
        assert!(err.to_string().contains("excluded"));
    }

    #[test]
    fn duplicate_selection_resolved_by_priority_then_order() {
        let plan = Plan::from_yaml_str(
            r#"
version: 1
migrations:
  - vm_pattern: "web-*"
    target_type: PRO2-XS
    priority: 5
  - vm_name: web-01
    target_type: PRO2-S
    priority: 1
"#,
        )
        .unwrap();
        let inventory = vec![vm("web-01", OsFamily::Linux), vm("web-02", OsFamily::Linux)];
        let exp = expand_plan(&plan, &inventory, &Catalog::builtin(), 1.2).unwrap();
        let web01 = exp.planned.iter().find(|p| p.vm.name == "web-01").unwrap();
        // Priority 1 entry wins over the pattern entry.
        assert_eq!(web01.target_type, "PRO2-S");
        assert_eq!(web01.priority, 1);
        // And priority orders the schedule.
        assert_eq!(exp.planned[0].vm.name, "web-01");
    }

    #[test]
    fn windows_vm_on_linux_type_is_rejected() {
        let plan = Plan::from_yaml_str(
            "version: 1\nmigrations:\n  - vm_name: win-01\n    target_type: PRO2-S\n",
        )
        .unwrap();
        let err = expand_plan(&plan, &[vm("win-01", OsFamily::Windows)], &Catalog::builtin(), 1.2)
            .unwrap_err();
        assert!(err.to_string().contains("Windows-allowed"));
    }

    #[test]
    fn other_os_is_quarantined() {
        let plan = Plan::from_yaml_str(
            "version: 1\nmigrations:\n  - vm_pattern: '*'\n",
        )
        .unwrap();
        let exp = expand_plan(&plan, &[vm("bsd-01", OsFamily::Other)], &Catalog::builtin(), 1.2)
            .unwrap();
        assert!(exp.planned.is_empty());
        assert_eq!(exp.unmappable.len(), 1);
    }

    #[test]
    fn wave_membership_and_implicit_default() {
        let plan = Plan::from_yaml_str(
            r#"
version: 1
migrations:
  - vm_pattern: "*"
    target_type: PRO2-XS
waves:
  - name: canary
    selectors: ["web-01"]
    pause_after: pause
"#,
        )
        .unwrap();
        let inventory = vec![vm("web-01", OsFamily::Linux), vm("db-01", OsFamily::Linux)];
        let exp = expand_plan(&plan, &inventory, &Catalog::builtin(), 1.2).unwrap();
        assert_eq!(exp.waves.len(), 2);
        assert_eq!(exp.waves[0].name, "canary");
        assert_eq!(exp.waves[0].vm_names, vec!["web-01"]);
        assert_eq!(exp.waves[1].name, DEFAULT_WAVE);
        assert_eq!(exp.waves[1].vm_names, vec!["db-01"]);
    }

    #[test]
    fn overlapping_wave_selectors_rejected() {
        let plan = Plan::from_yaml_str(
            r#"
version: 1
migrations:
  - vm_pattern: "*"
    target_type: PRO2-XS
waves:
  - name: a
    selectors: ["web-*"]
  - name: b
    selectors: ["*-01"]
"#,
        )
        .unwrap();
        let err = expand_plan(&plan, &[vm("web-01", OsFamily::Linux)], &Catalog::builtin(), 1.2)
            .unwrap_err();
        assert!(err.to_string().contains("multiple waves"));
    }

    #[test]
    fn generated_plan_validates_and_expands() {
        let inventory = vec![vm("app-01", OsFamily::Linux), vm("app-02", OsFamily::Linux)];
        let catalog = Catalog::builtin();
        let plan = generate_plan(&inventory, &catalog, &GeneratePlanOptions::default());
        plan.validate(&catalog).unwrap();
        let exp = expand_plan(&plan, &inventory, &catalog, 1.2).unwrap();
        assert_eq!(exp.planned.len(), 2);
        assert!(exp.planned.iter().all(|p| !p.target_type.is_empty()));
    }
}
