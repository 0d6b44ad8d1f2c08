//! Target instance-type catalogue.
//!
//! Ships a built-in table of Scaleway instance types (capacities, prices,
//! Windows support) and supports runtime reconciliation against the
//! provider's `list_instance_types` API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const HOURS_PER_MONTH: f64 = 730.0;

/// One catalogue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceType {
    pub id: String,
    /// Commercial family, e.g. "PRO2", "POP2", "POP2-HM".
    pub family: String,
    pub vcpus: u32,
    pub ram_gb: f64,
    /// Local NVMe in GiB; 0 means block-storage only.
    pub local_storage_gb: f64,
    /// Maximum attached block volumes.
    pub max_volumes: u32,
    pub hourly_price_eur: f64,
    pub windows_allowed: bool,
    pub arch: String,
}

impl InstanceType {
    pub fn monthly_price_eur(&self) -> f64 {
        self.hourly_price_eur * HOURS_PER_MONTH
    }

    /// Block-only types (no local NVMe) take their root volume from SBS.
    pub fn block_storage_only(&self) -> bool {
        self.local_storage_gb == 0.0
    }
}

/// The instance-type catalogue, keyed by type id.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    types: BTreeMap<String, InstanceType>,
}

impl Catalog {
    pub fn new(types: impl IntoIterator<Item = InstanceType>) -> Self {
        Self {
            types: types.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&InstanceType> {
        self.types.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.types.contains_key(id)
    }

    /// Iterate in id order (deterministic for sizing tie-breaks).
    pub fn iter(&self) -> impl Iterator<Item = &InstanceType> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Overlay entries fetched from the provider API over the built-in
    /// table. Known ids are replaced, new ids added; built-in ids the API no
    /// longer reports are kept (the API listing can be zone-partial).
    pub fn reconcile(&mut self, fetched: impl IntoIterator<Item = InstanceType>) {
        for t in fetched {
            self.types.insert(t.id.clone(), t);
        }
    }

    /// The built-in catalogue of migration-relevant Scaleway families.
    pub fn builtin() -> Self {
        fn entry(
            id: &str,
            family: &str,
            vcpus: u32,
            ram_gb: f64,
            local_gb: f64,
            max_volumes: u32,
            hourly: f64,
            windows: bool,
        ) -> InstanceType {
            InstanceType {
                id: id.to_string(),
                family: family.to_string(),
                vcpus,
                ram_gb,
                local_storage_gb: local_gb,
                max_volumes,
                hourly_price_eur: hourly,
                windows_allowed: windows,
                arch: "x86_64".to_string(),
            }
        }

        Self::new([
            // PLAY2: shared-vCPU development types
            entry("PLAY2-NANO", "PLAY2", 1, 1.0, 0.0, 1, 0.0070, false),
            entry("PLAY2-MICRO", "PLAY2", 2, 2.0, 0.0, 2, 0.0140, false),
            entry("PLAY2-SMALL", "PLAY2", 2, 4.0, 0.0, 4, 0.0280, false),
            entry("PLAY2-MEDIUM", "PLAY2", 4, 8.0, 0.0, 4, 0.0560, false),
            // PRO2: general purpose, block-storage only
            entry("PRO2-XXS", "PRO2", 2, 8.0, 0.0, 16, 0.0660, false),
            entry("PRO2-XS", "PRO2", 4, 16.0, 0.0, 16, 0.1320, false),
            entry("PRO2-S", "PRO2", 8, 32.0, 0.0, 16, 0.2640, false),
            entry("PRO2-M", "PRO2", 16, 64.0, 0.0, 16, 0.5280, false),
            entry("PRO2-L", "PRO2", 32, 128.0, 0.0, 16, 1.0560, false),
            // POP2: dedicated vCPU with local NVMe
            entry("POP2-2C-8G", "POP2", 2, 8.0, 50.0, 16, 0.0770, false),
            entry("POP2-4C-16G", "POP2", 4, 16.0, 100.0, 16, 0.1540, false),
            entry("POP2-8C-32G", "POP2", 8, 32.0, 200.0, 16, 0.3080, false),
            entry("POP2-16C-64G", "POP2", 16, 64.0, 400.0, 16, 0.6160, false),
            entry("POP2-32C-128G", "POP2", 32, 128.0, 800.0, 16, 1.2320, false),
            // POP2-HM: memory optimized
            entry("POP2-HM-2C-16G", "POP2-HM", 2, 16.0, 50.0, 16, 0.0990, false),
            entry("POP2-HM-4C-32G", "POP2-HM", 4, 32.0, 100.0, 16, 0.1980, false),
            entry("POP2-HM-8C-64G", "POP2-HM", 8, 64.0, 200.0, 16, 0.3960, false),
            entry("POP2-HM-16C-128G", "POP2-HM", 16, 128.0, 400.0, 16, 0.7920, false),
            entry("POP2-HM-32C-256G", "POP2-HM", 32, 256.0, 800.0, 16, 1.5840, false),
            entry("POP2-HM-64C-512G", "POP2-HM", 64, 512.0, 1600.0, 16, 3.1680, false),
            // Windows variants (UEFI + VirtIO preinstalled, license included)
            entry("POP2-4C-16G-WIN", "POP2", 4, 16.0, 100.0, 16, 0.2200, true),
            entry("POP2-8C-32G-WIN", "POP2", 8, 32.0, 200.0, 16, 0.4400, true),
            entry("POP2-16C-64G-WIN", "POP2", 16, 64.0, 400.0, 16, 0.8800, true),
            entry("POP2-32C-128G-WIN", "POP2", 32, 128.0, 800.0, 16, 1.7600, true),
            entry("POP2-HM-4C-32G-WIN", "POP2-HM", 4, 32.0, 100.0, 16, 0.2860, true),
            entry("POP2-HM-8C-64G-WIN", "POP2-HM", 8, 64.0, 200.0, 16, 0.5720, true),
            entry("POP2-HM-16C-128G-WIN", "POP2-HM", 16, 128.0, 400.0, 16, 1.1440, true),
        ])
    }
}
