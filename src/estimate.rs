//! Pre-flight projection of work space, duration and cost for a plan.
//!
//! Pure over the expanded plan and the catalogue; the CLI prints the
//! result before anything touches vCenter.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::config::AppConfig;
use crate::plan::{ConcurrencyCaps, Expansion};
use crate::types::OsFamily;

/// Stage-time model constants, minutes.
const EXPORT_MIN_PER_10GIB: f64 = 3.0;
const CONVERT_MIN_PER_10GIB: f64 = 1.0;
const UPLOAD_MIN_PER_GIB: f64 = 1.0;
const OVERHEAD_MIN_PER_LINUX_VM: f64 = 4.0;
const OVERHEAD_MIN_PER_WINDOWS_VM: f64 = 12.0;

/// Intermediate-space model: exports keep a 20% margin over the source
/// size; compressed qcow2 lands around 70% of it.
const EXPORT_SPACE_FACTOR: f64 = 1.2;
const QCOW2_COMPRESSED_FACTOR: f64 = 0.7;
const QCOW2_RAW_FACTOR: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimateWarning {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Estimate {
    pub total_vms: usize,
    pub linux_vms: usize,
    pub windows_vms: usize,
    pub total_disk_gb: f64,
    pub work_space_gb: f64,
    pub duration_minutes: f64,
    pub monthly_cost_eur: f64,
    pub warnings: Vec<EstimateWarning>,
}

fn warning(kind: &str, message: String) -> EstimateWarning {
    EstimateWarning {
        kind: kind.to_string(),
        message,
    }
}

/// Project cost, time and disk needs for an expanded plan.
pub fn estimate(
    expansion: &Expansion,
    caps: &ConcurrencyCaps,
    catalog: &Catalog,
    config: &AppConfig,
    available_disk_gb: Option<f64>,
) -> Estimate {
    let mut total_disk = 0.0;
    let mut linux = 0usize;
    let mut windows = 0usize;
    let mut monthly_cost = 0.0;
    let mut hosts: BTreeSet<&str> = BTreeSet::new();

    for p in &expansion.planned {
        total_disk += p.vm.total_disk_gb();
        hosts.insert(p.vm.host.as_str());
        match p.vm.guest_os_family {
            OsFamily::Windows => windows += 1,
            _ => linux += 1,
        }
        if let Some(t) = catalog.get(&p.target_type) {
            monthly_cost += t.monthly_price_eur();
        }
    }

    let qcow2_factor = if config.conversion.compress_qcow2 {
        QCOW2_COMPRESSED_FACTOR
    } else {
        QCOW2_RAW_FACTOR
    };
    let work_space = total_disk * EXPORT_SPACE_FACTOR + total_disk * qcow2_factor;

    // Throughput scales with the per-resource slot counts; the global cap
    // bounds how many pipelines feed them at once.
    let export_slots = (caps.per_esxi_host * hosts.len().max(1)).min(caps.global).max(1);
    let convert_slots = caps.disk_io.min(caps.global).max(1);
    let upload_slots = caps.s3_upload.min(caps.global).max(1);

    let export_min = total_disk / 10.0 * EXPORT_MIN_PER_10GIB / export_slots as f64;
    let convert_min = total_disk / 10.0 * CONVERT_MIN_PER_10GIB / convert_slots as f64;
    let upload_min = total_disk * qcow2_factor * UPLOAD_MIN_PER_GIB / upload_slots as f64;
    let overhead_min = linux as f64 * OVERHEAD_MIN_PER_LINUX_VM
        + windows as f64 * OVERHEAD_MIN_PER_WINDOWS_VM;
    let overhead_parallel = overhead_min / (caps.global.min(caps.scw_api).max(1)) as f64;

    let duration = export_min + convert_min + upload_min + overhead_parallel;

    let mut warnings = Vec::new();
    if windows > 0 {
        warnings.push(warning(
            "windows_requires_kvm",
            format!(
                "{windows} Windows VM(s) require /dev/kvm and OVMF on the orchestration host"
            ),
        ));
        if config.conversion.virtio_win_iso.is_none() {
            warnings.push(warning(
                "missing_virtio_iso",
                "conversion.virtio_win_iso is not set; Windows driver injection will fail"
                    .to_string(),
            ));
        }
    }
    for u in &expansion.unmappable {
        warnings.push(warning(
            "unmappable",
            format!("{}: {}", u.vm_name, u.reason),
        ));
    }
    for w in &expansion.waves {
        if w.vm_names.is_empty() {
            warnings.push(warning("empty_wave", format!("wave '{}' matches no VMs", w.name)));
        }
    }
    if let Some(available) = available_disk_gb {
        if work_space > available {
            warnings.push(warning(
                "insufficient_disk",
                format!(
                    "need {work_space:.0} GiB of work space, only {available:.0} GiB available; \
                     consider migrating in waves"
                ),
            ));
        }
    }

    Estimate {
        total_vms: expansion.planned.len(),
        linux_vms: linux,
        windows_vms: windows,
        total_disk_gb: total_disk,
        work_space_gb: work_space,
        duration_minutes: duration,
        monthly_cost_eur: monthly_cost,
        warnings,
    }
}

/// Human-oriented rendering for the CLI.
pub fn render_estimate(est: &Estimate) -> String {
    let mut out = vec![
        "Migration estimate".to_string(),
        format!("  VMs:            {} ({} linux, {} windows)", est.total_vms, est.linux_vms, est.windows_vms),
        format!("  Source disk:    {:.0} GiB", est.total_disk_gb),
        format!("  Work space:     {:.0} GiB", est.work_space_gb),
        format!("  Duration:       ~{:.0} min", est.duration_minutes),
        format!("  Monthly cost:   {:.2} EUR", est.monthly_cost_eur),
    ];
    if !est.warnings.is_empty() {
        out.push("  Warnings:".to_string());
        for w in &est.warnings {
            out.push(format!("    [{}] {}", w.kind, w.message));
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{expand_plan, Plan};
    use crate::types::{DiskInfo, Firmware, PowerState, VMDescriptor};

    fn vm(name: &str, family: OsFamily, disk_gb: f64) -> VMDescriptor {
        VMDescriptor {
            name: name.into(),
            uuid: format!("uuid-{name}"),
            cpu_count: 2,
            memory_mb: 4096,
            power_state: PowerState::PoweredOn,
            guest_os_family: family,
            guest_os_full: String::new(),
            firmware: Firmware::Bios,
            disks: vec![DiskInfo {
                size_gb: disk_gb,
                thin_provisioned: true,
                controller: "pvscsi".into(),
                path: format!("[ds1] {name}.vmdk"),
                is_rdm: false,
                is_shared: false,
            }],
            nics: vec![],
            tools_status: String::new(),
            snapshot_names: vec![],
            datacenter: "dc".into(),
            cluster: "cl".into(),
            host: "esxi-01".into(),
            folder_path: "/".into(),
        }
    }

    fn expansion_for(vms: &[VMDescriptor]) -> Expansion {
        let plan = Plan::from_yaml_str("version: 1\nmigrations:\n  - vm_pattern: '*'\n").unwrap();
        expand_plan(&plan, vms, &Catalog::builtin(), 1.2).unwrap()
    }

    #[test]
    fn estimate_counts_and_cost() {
        let inventory = vec![vm("a", OsFamily::Linux, 100.0), vm("b", OsFamily::Linux, 50.0)];
        let exp = expansion_for(&inventory);
        let est = estimate(
            &exp,
            &ConcurrencyCaps::default(),
            &Catalog::builtin(),
            &AppConfig::default(),
            None,
        );
        assert_eq!(est.total_vms, 2);
        assert_eq!(est.total_disk_gb, 150.0);
        // 150 * 1.2 + 150 * 0.7 (compression on by default)
        assert!((est.work_space_gb - 285.0).abs() < 1e-9);
        assert!(est.monthly_cost_eur > 0.0);
        assert!(est.duration_minutes > 0.0);
    }

    #[test]
    fn missing_virtio_iso_warning_for_windows() {
        let inventory = vec![vm("win-01", OsFamily::Windows, 80.0)];
        let exp = expansion_for(&inventory);
        let est = estimate(
            &exp,
            &ConcurrencyCaps::default(),
            &Catalog::builtin(),
            &AppConfig::default(),
            None,
        );
        assert!(est.warnings.iter().any(|w| w.kind == "missing_virtio_iso"));
        assert!(est.warnings.iter().any(|w| w.kind == "windows_requires_kvm"));
    }

    #[test]
    fn insufficient_disk_warning() {
        let inventory = vec![vm("big", OsFamily::Linux, 1000.0)];
        let exp = expansion_for(&inventory);
        let est = estimate(
            &exp,
            &ConcurrencyCaps::default(),
            &Catalog::builtin(),
            &AppConfig::default(),
            Some(500.0),
        );
        assert!(est.warnings.iter().any(|w| w.kind == "insufficient_disk"));
    }
}
