//! Installer settings file.
//!
//! ```toml
//! [bootloader]
//! target = "/dev/sda"
//! root_dir = "/run/cos/active"
//! boot_dir = "/run/cos/state"
//! efi = true
//! state_label = "COS_STATE"
//!
//! [stages]
//! strict = false
//! cloud_init_paths = ["/system/oem", "/oem"]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::bootloader::GrubInstall;
use crate::fs::Fs;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSettings {
    pub strict: bool,
    pub cloud_init_paths: Vec<String>,
}

impl StageSettings {
    pub fn paths(&self) -> Vec<&str> {
        self.cloud_init_paths.iter().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallSettings {
    pub bootloader: GrubInstall,
    pub stages: StageSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstallSettingsToml {
    bootloader: Option<BootloaderToml>,
    stages: Option<StagesToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BootloaderToml {
    target: Option<String>,
    root_dir: Option<PathBuf>,
    boot_dir: Option<PathBuf>,
    grub_conf: Option<PathBuf>,
    tty: Option<String>,
    efi: Option<bool>,
    state_label: Option<String>,
    disable_boot_entry: Option<bool>,
    clear_boot_entries: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StagesToml {
    strict: Option<bool>,
    cloud_init_paths: Option<Vec<String>>,
}

/// Parse settings text. `origin` names the source in error messages.
pub fn parse_settings(origin: &str, text: &str) -> Result<InstallSettings> {
    let parsed: InstallSettingsToml =
        toml::from_str(text).with_context(|| format!("parsing installer settings '{}'", origin))?;

    let defaults = GrubInstall::default();
    let boot = parsed.bootloader.unwrap_or_default();
    let bootloader = GrubInstall {
        target: boot.target.unwrap_or_default().trim().to_string(),
        root_dir: boot.root_dir.unwrap_or(defaults.root_dir),
        boot_dir: boot.boot_dir.unwrap_or(defaults.boot_dir),
        grub_conf: boot.grub_conf.unwrap_or(defaults.grub_conf),
        tty: boot.tty.unwrap_or_default().trim().to_string(),
        efi: boot.efi.unwrap_or(defaults.efi),
        state_label: boot.state_label.unwrap_or(defaults.state_label),
        disable_boot_entry: boot.disable_boot_entry.unwrap_or_default(),
        clear_boot_entries: boot.clear_boot_entries.unwrap_or_default(),
    };

    if !bootloader.efi && bootloader.target.is_empty() {
        bail!(
            "invalid installer settings '{}': bootloader.target is required when efi = false",
            origin
        );
    }
    if bootloader.state_label.trim().is_empty() {
        bail!("invalid installer settings '{}': bootloader.state_label must not be empty", origin);
    }
    for (field, path) in [
        ("root_dir", &bootloader.root_dir),
        ("boot_dir", &bootloader.boot_dir),
    ] {
        if !path.is_absolute() {
            bail!(
                "invalid installer settings '{}': bootloader.{} must be absolute, got '{}'",
                origin,
                field,
                path.display()
            );
        }
    }

    let stages = parsed.stages.unwrap_or_default();
    let stages = StageSettings {
        strict: stages.strict.unwrap_or_default(),
        cloud_init_paths: stages
            .cloud_init_paths
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
    };

    Ok(InstallSettings { bootloader, stages })
}

/// Load settings from `path` on `fs`.
pub fn load_settings(fs: &dyn Fs, path: &Path) -> Result<InstallSettings> {
    let text = fs
        .read_to_string(path)
        .with_context(|| format!("reading installer settings '{}'", path.display()))?;
    parse_settings(&path.display().to_string(), &text)
}
