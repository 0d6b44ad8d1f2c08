//! Core domain types: the immutable description of a source VM as observed
//! in vCenter, and the small enums shared across the planning and pipeline
//! layers.

use serde::{Deserialize, Serialize};

/// Power state of a source VM, using vSphere's wire spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    #[serde(rename = "poweredOn")]
    PoweredOn,
    #[serde(rename = "poweredOff")]
    PoweredOff,
    #[serde(rename = "suspended")]
    Suspended,
}

/// Normalized guest OS family. The many opaque vSphere guest-id strings
/// collapse to these three; `Other` is never auto-migratable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    Windows,
    Other,
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OsFamily::Linux => f.write_str("linux"),
            OsFamily::Windows => f.write_str("windows"),
            OsFamily::Other => f.write_str("other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    Bios,
    Efi,
}

/// A virtual disk attached to the source VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInfo {
    pub size_gb: f64,
    pub thin_provisioned: bool,
    /// Controller class, e.g. "lsilogic", "pvscsi", "ide".
    pub controller: String,
    /// Datastore-relative path, e.g. "[ds1] web-01/web-01.vmdk".
    pub path: String,
    #[serde(default)]
    pub is_rdm: bool,
    #[serde(default)]
    pub is_shared: bool,
}

/// A network interface attached to the source VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicInfo {
    pub mac: String,
    pub network: String,
    /// Adapter type, e.g. "vmxnet3", "e1000".
    pub adapter: String,
    pub connected: bool,
}

/// Immutable snapshot of a source VM's observable attributes.
///
/// Collected once at inventory time; planning and pipeline code never
/// re-query vCenter for identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VMDescriptor {
    pub name: String,
    /// Stable vCenter instance UUID.
    pub uuid: String,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub power_state: PowerState,
    /// Normalized from `guest_os_full`; raw dumps may omit it and rely on
    /// [`VMDescriptor::normalize_guest_os`] at load time.
    #[serde(default = "default_os_family")]
    pub guest_os_family: OsFamily,
    /// Raw vSphere guest id, e.g. "debian12_64Guest".
    pub guest_os_full: String,
    pub firmware: Firmware,
    pub disks: Vec<DiskInfo>,
    pub nics: Vec<NicInfo>,
    /// vSphere tools status string, e.g. "toolsOk".
    #[serde(default)]
    pub tools_status: String,
    #[serde(default)]
    pub snapshot_names: Vec<String>,
    pub datacenter: String,
    pub cluster: String,
    pub host: String,
    /// Slash-separated vCenter folder path, e.g. "/prod/web".
    pub folder_path: String,
}

impl VMDescriptor {
    pub fn total_disk_gb(&self) -> f64 {
        self.disks.iter().map(|d| d.size_gb).sum()
    }

    pub fn memory_gb(&self) -> f64 {
        self.memory_mb as f64 / 1024.0
    }

    pub fn has_rdm_disk(&self) -> bool {
        self.disks.iter().any(|d| d.is_rdm)
    }

    /// Re-derive the OS family from the raw guest id. Inventory loaders
    /// call this so the family never disagrees with what vSphere reported.
    pub fn normalize_guest_os(&mut self) {
        if !self.guest_os_full.is_empty() {
            self.guest_os_family = normalize_guest_id(&self.guest_os_full).0;
        }
    }
}

fn default_os_family() -> OsFamily {
    OsFamily::Other
}

/// Exact guest-id matches, checked before the substring heuristics.
const GUEST_ID_TABLE: &[(&str, OsFamily, &str)] = &[
    ("windows9Server64Guest", OsFamily::Windows, "Windows Server 2016+"),
    ("windows2019srv_64Guest", OsFamily::Windows, "Windows Server 2019"),
    ("windows2019srvNext_64Guest", OsFamily::Windows, "Windows Server 2022"),
    ("windows9_64Guest", OsFamily::Windows, "Windows 10"),
    ("windows11_64Guest", OsFamily::Windows, "Windows 11"),
    ("debian10_64Guest", OsFamily::Linux, "Debian 10"),
    ("debian11_64Guest", OsFamily::Linux, "Debian 11"),
    ("debian12_64Guest", OsFamily::Linux, "Debian 12"),
    ("ubuntu64Guest", OsFamily::Linux, "Ubuntu"),
    ("rhel7_64Guest", OsFamily::Linux, "RHEL 7"),
    ("rhel8_64Guest", OsFamily::Linux, "RHEL 8"),
    ("rhel9_64Guest", OsFamily::Linux, "RHEL 9"),
    ("centos7_64Guest", OsFamily::Linux, "CentOS 7"),
    ("centos8_64Guest", OsFamily::Linux, "CentOS 8"),
    ("centos9_64Guest", OsFamily::Linux, "CentOS Stream 9"),
    ("rockylinux_64Guest", OsFamily::Linux, "Rocky Linux"),
    ("almalinux_64Guest", OsFamily::Linux, "AlmaLinux"),
    ("sles15_64Guest", OsFamily::Linux, "SLES 15"),
    ("amazonlinux3_64Guest", OsFamily::Linux, "Amazon Linux"),
    ("other3xLinux64Guest", OsFamily::Linux, "Linux (generic 3.x)"),
    ("other4xLinux64Guest", OsFamily::Linux, "Linux (generic 4.x)"),
    ("other5xLinux64Guest", OsFamily::Linux, "Linux (generic 5.x)"),
    ("otherLinux64Guest", OsFamily::Linux, "Linux (generic)"),
];

const LINUX_HINTS: &[&str] = &[
    "linux", "ubuntu", "debian", "centos", "rhel", "suse", "rocky", "alma", "fedora",
];

/// Normalize a raw vSphere guest id to an OS family plus a human-readable
/// description.
pub fn normalize_guest_id(guest_id: &str) -> (OsFamily, String) {
    for (id, family, desc) in GUEST_ID_TABLE {
        if *id == guest_id {
            return (*family, desc.to_string());
        }
    }
    let lower = guest_id.to_lowercase();
    if lower.contains("win") {
        return (OsFamily::Windows, format!("Windows ({guest_id})"));
    }
    if LINUX_HINTS.iter().any(|h| lower.contains(h)) {
        return (OsFamily::Linux, format!("Linux ({guest_id})"));
    }
    (OsFamily::Other, format!("Unknown ({guest_id})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_id_exact_match() {
        let (family, desc) = normalize_guest_id("debian12_64Guest");
        assert_eq!(family, OsFamily::Linux);
        assert_eq!(desc, "Debian 12");

        let (family, _) = normalize_guest_id("windows2019srv_64Guest");
        assert_eq!(family, OsFamily::Windows);
    }

    #[test]
    fn guest_id_substring_fallback() {
        assert_eq!(normalize_guest_id("winXPProGuest").0, OsFamily::Windows);
        assert_eq!(normalize_guest_id("fedora64Guest").0, OsFamily::Linux);
        assert_eq!(normalize_guest_id("freebsd13_64Guest").0, OsFamily::Other);
    }

    #[test]
    fn descriptor_normalization_follows_guest_id() {
        let json = r#"{
            "name": "db-01", "uuid": "4211-db", "cpu_count": 2, "memory_mb": 2048,
            "power_state": "poweredOff", "guest_os_full": "rhel9_64Guest",
            "firmware": "bios", "disks": [], "nics": [],
            "datacenter": "dc1", "cluster": "cl1", "host": "esxi-01",
            "folder_path": "/db"
        }"#;
        let mut vm: VMDescriptor = serde_json::from_str(json).unwrap();
        // A raw dump without the family field defaults to Other until
        // normalized from the guest id.
        assert_eq!(vm.guest_os_family, OsFamily::Other);
        vm.normalize_guest_os();
        assert_eq!(vm.guest_os_family, OsFamily::Linux);

        vm.guest_os_full = "windows11_64Guest".into();
        vm.normalize_guest_os();
        assert_eq!(vm.guest_os_family, OsFamily::Windows);
    }

    #[test]
    fn power_state_uses_vsphere_spelling() {
        let json = serde_json::to_string(&PowerState::PoweredOn).unwrap();
        assert_eq!(json, "\"poweredOn\"");
    }

    #[test]
    fn total_disk_sums_all_disks() {
        let vm = VMDescriptor {
            name: "web-01".into(),
            uuid: "4211aa-bb".into(),
            cpu_count: 2,
            memory_mb: 4096,
            power_state: PowerState::PoweredOn,
            guest_os_family: OsFamily::Linux,
            guest_os_full: "debian12_64Guest".into(),
            firmware: Firmware::Bios,
            disks: vec![
                DiskInfo {
                    size_gb: 20.0,
                    thin_provisioned: true,
                    controller: "pvscsi".into(),
                    path: "[ds1] web-01/web-01.vmdk".into(),
                    is_rdm: false,
                    is_shared: false,
                },
                DiskInfo {
                    size_gb: 100.0,
                    thin_provisioned: false,
                    controller: "pvscsi".into(),
                    path: "[ds1] web-01/web-01_1.vmdk".into(),
                    is_rdm: false,
                    is_shared: false,
                },
            ],
            nics: vec![],
            tools_status: "toolsOk".into(),
            snapshot_names: vec![],
            datacenter: "dc1".into(),
            cluster: "cl1".into(),
            host: "esxi-01".into(),
            folder_path: "/prod/web".into(),
        };
        assert_eq!(vm.total_disk_gb(), 120.0);
        assert_eq!(vm.memory_gb(), 4.0);
    }
}
