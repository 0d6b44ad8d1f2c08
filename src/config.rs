//! Application configuration.
//!
//! Loaded from a YAML file, then overlaid with credentials from the
//! environment (`VCENTER_PASSWORD`, `SCW_ACCESS_KEY`, `SCW_SECRET_KEY`).
//! Secrets never round-trip to disk: [`AppConfig::to_redacted_yaml`]
//! replaces them before serialization.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmshiftError};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VmwareConfig {
    /// vCenter hostname or IP.
    pub vcenter: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Skip TLS verification.
    pub insecure: bool,
    pub datacenter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalewayConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    pub project_id: String,
    pub default_zone: String,
    pub s3_region: String,
    pub s3_bucket: String,
    pub s3_endpoint: String,
}

impl Default for ScalewayConfig {
    fn default() -> Self {
        Self {
            access_key: None,
            secret_key: None,
            project_id: String::new(),
            default_zone: "fr-par-1".to_string(),
            s3_region: "fr-par".to_string(),
            s3_bucket: "vmshift-transit".to_string(),
            s3_endpoint: "https://s3.fr-par.scw.cloud".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub work_dir: PathBuf,
    /// Path to the virtio-win ISO; required for Windows guests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtio_win_iso: Option<PathBuf>,
    pub ovmf_path: PathBuf,
    pub compress_qcow2: bool,
    pub keep_intermediates: bool,
    pub qemu_img_path: String,
    pub virt_customize_path: String,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/var/lib/vmshift/work"),
            virtio_win_iso: None,
            ovmf_path: PathBuf::from("/usr/share/OVMF/OVMF_CODE.fd"),
            compress_qcow2: true,
            keep_intermediates: false,
            qemu_img_path: "qemu-img".to_string(),
            virt_customize_path: "virt-customize".to_string(),
        }
    }
}

/// Retry and polling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Attempts per stage for retryable failures.
    pub retry_attempts: u32,
    /// Exponential backoff base, seconds.
    pub retry_backoff_base_secs: u64,
    /// Backoff cap, seconds.
    pub retry_backoff_cap_secs: u64,
    /// Cloud snapshot readiness poll cadence, seconds.
    pub snapshot_poll_secs: u64,
    /// Maximum wait for cloud snapshot readiness, seconds.
    pub snapshot_wait_max_secs: u64,
    /// Optimize-strategy headroom multiplier.
    pub sizing_headroom: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff_base_secs: 2,
            retry_backoff_cap_secs: 60,
            snapshot_poll_secs: 10,
            snapshot_wait_max_secs: 1800,
            sizing_headroom: 1.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub vmware: VmwareConfig,
    pub scaleway: ScalewayConfig,
    pub conversion: ConversionConfig,
    pub limits: LimitsConfig,
}

impl AppConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VmshiftError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let mut config: AppConfig = serde_yaml::from_str(&text)
            .map_err(|e| VmshiftError::Config(format!("bad config {}: {e}", path.display())))?;
        config.overlay_env();
        Ok(config)
    }

    /// Credentials come from the environment, never from the config file
    /// when both are present.
    pub fn overlay_env(&mut self) {
        if let Ok(v) = std::env::var("VCENTER_PASSWORD") {
            if !v.is_empty() {
                self.vmware.password = Some(v);
            }
        }
        if let Ok(v) = std::env::var("SCW_ACCESS_KEY") {
            if !v.is_empty() {
                self.scaleway.access_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("SCW_SECRET_KEY") {
            if !v.is_empty() {
                self.scaleway.secret_key = Some(v);
            }
        }
    }

    /// Secret values that must never appear in logs or reports.
    pub fn secret_values(&self) -> Vec<String> {
        [
            self.vmware.password.as_deref(),
            self.scaleway.access_key.as_deref(),
            self.scaleway.secret_key.as_deref(),
        ]
        .iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
    }

    /// YAML rendering with secrets replaced, safe to write to disk.
    pub fn to_redacted_yaml(&self) -> Result<String> {
        let mut clone = self.clone();
        if clone.vmware.password.is_some() {
            clone.vmware.password = Some("***REDACTED***".to_string());
        }
        if clone.scaleway.access_key.is_some() {
            clone.scaleway.access_key = Some("***REDACTED***".to_string());
        }
        if clone.scaleway.secret_key.is_some() {
            clone.scaleway.secret_key = Some("***REDACTED***".to_string());
        }
        Ok(serde_yaml::to_string(&clone)?)
    }

    pub fn batch_state_dir(&self) -> PathBuf {
        self.conversion.work_dir.join("batch-state")
    }

    pub fn vm_work_dir(&self, migration_id: &str) -> PathBuf {
        self.conversion.work_dir.join("work").join(migration_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = AppConfig::default();
        assert_eq!(c.limits.retry_attempts, 3);
        assert_eq!(c.limits.retry_backoff_base_secs, 2);
        assert_eq!(c.scaleway.default_zone, "fr-par-1");
        assert!(c.conversion.compress_qcow2);
    }

    #[test]
    fn redacted_yaml_hides_secrets() {
        let mut c = AppConfig::default();
        c.vmware.password = Some("hunter2".into());
        c.scaleway.secret_key = Some("00000000-dead-beef".into());
        let yaml = c.to_redacted_yaml().unwrap();
        assert!(!yaml.contains("hunter2"));
        assert!(!yaml.contains("dead-beef"));
        assert!(yaml.contains("***REDACTED***"));
    }

    #[test]
    fn work_dir_layout() {
        let c = AppConfig::default();
        assert_eq!(
            c.vm_work_dir("abc123"),
            PathBuf::from("/var/lib/vmshift/work/work/abc123")
        );
        assert!(c.batch_state_dir().ends_with("batch-state"));
    }
}
