//! Maps a source VM onto a target instance type.
//!
//! Candidates are every catalogue type that can actually run the VM
//! (architecture, Windows licensing, CPU, RAM, storage attachment); the
//! strategy then orders them and picks the head.

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, InstanceType};
use crate::types::{OsFamily, VMDescriptor};

/// Default headroom multiplier for the `Optimize` strategy.
pub const DEFAULT_HEADROOM: f64 = 1.2;

const SOURCE_ARCH: &str = "x86_64";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SizingStrategy {
    /// Minimal type whose capacity covers the source.
    Exact,
    /// Like `Exact` but requires headroom on CPU and RAM, falling back to
    /// `Exact` (with a warning) when nothing qualifies.
    #[default]
    Optimize,
    /// Minimum-price viable type.
    Cost,
}

impl std::fmt::Display for SizingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizingStrategy::Exact => f.write_str("exact"),
            SizingStrategy::Optimize => f.write_str("optimize"),
            SizingStrategy::Cost => f.write_str("cost"),
        }
    }
}

/// Result of sizing one VM: the ordered candidate list (best first) and the
/// chosen type. `chosen == None` marks the entry unmappable; planning
/// continues but the entry is quarantined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingOutcome {
    pub candidates: Vec<String>,
    pub chosen: Option<String>,
    /// Set when `Optimize` found no headroom-qualified type and fell back
    /// to `Exact`.
    pub fell_back_to_exact: bool,
}

/// Select a target type for `vm` under `strategy`.
pub fn select_instance_type(
    vm: &VMDescriptor,
    strategy: SizingStrategy,
    catalog: &Catalog,
    headroom: f64,
) -> SizingOutcome {
    let viable: Vec<&InstanceType> = catalog.iter().filter(|t| is_viable(t, vm)).collect();

    let ordered = match strategy {
        SizingStrategy::Exact => order_exact(viable),
        SizingStrategy::Cost => order_cost(viable),
        SizingStrategy::Optimize => {
            let need_cpu = ((vm.cpu_count as f64) * headroom).ceil() as u32;
            let need_ram = vm.memory_gb() * headroom;
            let headroomy: Vec<&InstanceType> = viable
                .iter()
                .copied()
                .filter(|t| t.vcpus >= need_cpu && t.ram_gb >= need_ram)
                .collect();
            if headroomy.is_empty() {
                let ordered = order_exact(viable);
                return SizingOutcome {
                    chosen: ordered.first().map(|t| t.id.clone()),
                    candidates: ordered.iter().map(|t| t.id.clone()).collect(),
                    fell_back_to_exact: true,
                };
            }
            order_optimize(headroomy)
        }
    };

    SizingOutcome {
        chosen: ordered.first().map(|t| t.id.clone()),
        candidates: ordered.iter().map(|t| t.id.clone()).collect(),
        fell_back_to_exact: false,
    }
}

fn is_viable(t: &InstanceType, vm: &VMDescriptor) -> bool {
    if t.arch != SOURCE_ARCH {
        return false;
    }
    // Windows licensing is two-way: Windows guests need a licensed type,
    // and licensed types are never picked for Linux guests.
    let is_windows = vm.guest_os_family == OsFamily::Windows;
    if is_windows != t.windows_allowed {
        return false;
    }
    if t.vcpus < vm.cpu_count {
        return false;
    }
    if t.ram_gb < vm.memory_gb() {
        return false;
    }
    // Every current family supports SBS block volumes, so a VM fits if its
    // disks fit on local NVMe or can be attached as block volumes.
    t.local_storage_gb >= vm.total_disk_gb() || t.max_volumes >= vm.disks.len() as u32
}

fn order_exact(mut v: Vec<&InstanceType>) -> Vec<&InstanceType> {
    v.sort_by(|a, b| {
        a.vcpus
            .cmp(&b.vcpus)
            .then(a.ram_gb.total_cmp(&b.ram_gb))
            .then(a.hourly_price_eur.total_cmp(&b.hourly_price_eur))
            .then(a.id.cmp(&b.id))
    });
    v
}

// Optimize orders like exact within the headroom-qualified set, breaking
// capacity ties toward the lower price.
fn order_optimize(v: Vec<&InstanceType>) -> Vec<&InstanceType> {
    order_exact(v)
}

fn order_cost(mut v: Vec<&InstanceType>) -> Vec<&InstanceType> {
    v.sort_by(|a, b| {
        a.hourly_price_eur
            .total_cmp(&b.hourly_price_eur)
            .then(a.vcpus.cmp(&b.vcpus))
            .then(a.ram_gb.total_cmp(&b.ram_gb))
            .then(a.id.cmp(&b.id))
    });
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiskInfo, Firmware, PowerState};

    fn vm(cpu: u32, mem_mb: u64, disk_gb: f64, family: OsFamily) -> VMDescriptor {
        VMDescriptor {
            name: "vm".into(),
            uuid: "u".into(),
            cpu_count: cpu,
            memory_mb: mem_mb,
            power_state: PowerState::PoweredOff,
            guest_os_family: family,
            guest_os_full: String::new(),
            firmware: Firmware::Bios,
            disks: vec![DiskInfo {
                size_gb: disk_gb,
                thin_provisioned: true,
                controller: "pvscsi".into(),
                path: "[ds] vm/vm.vmdk".into(),
                is_rdm: false,
                is_shared: false,
            }],
            nics: vec![],
            tools_status: String::new(),
            snapshot_names: vec![],
            datacenter: "dc".into(),
            cluster: "cl".into(),
            host: "h".into(),
            folder_path: "/".into(),
        }
    }

    #[test]
    fn exact_picks_minimal_fit() {
        let cat = Catalog::builtin();
        let out = select_instance_type(&vm(2, 4096, 40.0, OsFamily::Linux), SizingStrategy::Exact, &cat, DEFAULT_HEADROOM);
        // Smallest viable by (vcpu, ram, price): PLAY2-SMALL (2c/4G).
        assert_eq!(out.chosen.as_deref(), Some("PLAY2-SMALL"));
        assert!(!out.fell_back_to_exact);
    }

    #[test]
    fn optimize_requires_headroom() {
        let cat = Catalog::builtin();
        let out = select_instance_type(&vm(2, 4096, 40.0, OsFamily::Linux), SizingStrategy::Optimize, &cat, DEFAULT_HEADROOM);
        // Needs >= ceil(2.4)=3 vCPU and >= 4.8 GiB: PLAY2-MEDIUM (4c/8G).
        assert_eq!(out.chosen.as_deref(), Some("PLAY2-MEDIUM"));
    }

    #[test]
    fn optimize_falls_back_to_exact_when_nothing_qualifies() {
        let cat = Catalog::builtin();
        // 64 vCPU is the catalogue ceiling; 1.2x cannot be satisfied.
        let out = select_instance_type(
            &vm(64, 512 * 1024, 100.0, OsFamily::Linux),
            SizingStrategy::Optimize,
            &cat,
            DEFAULT_HEADROOM,
        );
        assert!(out.fell_back_to_exact);
        assert_eq!(out.chosen.as_deref(), Some("POP2-HM-64C-512G"));
    }

    #[test]
    fn cost_picks_cheapest_viable() {
        let cat = Catalog::builtin();
        let out = select_instance_type(&vm(1, 1024, 10.0, OsFamily::Linux), SizingStrategy::Cost, &cat, DEFAULT_HEADROOM);
        assert_eq!(out.chosen.as_deref(), Some("PLAY2-NANO"));
    }

    #[test]
    fn windows_vm_only_gets_windows_types() {
        let cat = Catalog::builtin();
        let out = select_instance_type(&vm(4, 8192, 80.0, OsFamily::Windows), SizingStrategy::Exact, &cat, DEFAULT_HEADROOM);
        let chosen = out.chosen.unwrap();
        assert!(chosen.ends_with("-WIN"), "chosen {chosen}");
        assert!(out.candidates.iter().all(|c| c.ends_with("-WIN")));
    }

    #[test]
    fn unmappable_vm_is_quarantined() {
        let cat = Catalog::builtin();
        let out = select_instance_type(
            &vm(128, 1024 * 1024, 100.0, OsFamily::Linux),
            SizingStrategy::Exact,
            &cat,
            DEFAULT_HEADROOM,
        );
        assert!(out.chosen.is_none());
        assert!(out.candidates.is_empty());
    }

    #[test]
    fn sizing_is_monotone_in_cpu_and_ram() {
        let cat = Catalog::builtin();
        for strategy in [SizingStrategy::Exact, SizingStrategy::Optimize] {
            let small = select_instance_type(&vm(2, 2048, 20.0, OsFamily::Linux), strategy, &cat, DEFAULT_HEADROOM);
            let big = select_instance_type(&vm(8, 16384, 20.0, OsFamily::Linux), strategy, &cat, DEFAULT_HEADROOM);
            let s = cat.get(small.chosen.as_deref().unwrap()).unwrap();
            let b = cat.get(big.chosen.as_deref().unwrap()).unwrap();
            assert!(s.vcpus <= b.vcpus);
            assert!(s.ram_gb <= b.ram_gb);
        }
    }
}
