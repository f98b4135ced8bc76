//! Host tool checks run before an install.
//!
//! The installer shells out to grub, util-linux and udev tools. Checking
//! for them up front turns a half-finished install into a clear error.
//!
//! ```rust,no_run
//! use distro_installer::preflight::check_installer_tools;
//!
//! if let Err(e) = check_installer_tools(true) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::constants::{GRUB_EDITENV, GRUB_EDITENV_FALLBACK, GRUB_INSTALL};

/// Whether `cmd` resolves on `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools every install needs, as (command, package).
pub const INSTALLER_TOOLS: &[(&str, &str)] = &[
    (GRUB_EDITENV, "grub2"),
    ("lsblk", "util-linux"),
    ("blkid", "util-linux"),
    ("udevadm", "udev"),
];

/// Needed only for BIOS installs; EFI installs copy prebuilt images.
pub const BIOS_TOOLS: &[(&str, &str)] = &[(GRUB_INSTALL, "grub2")];

/// Check that every tool in `tools` is on `PATH`, listing all missing ones.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

fn installer_tools(efi: bool, exists: impl Fn(&str) -> bool) -> Vec<(&'static str, &'static str)> {
    let mut tools = INSTALLER_TOOLS.to_vec();
    if !exists(GRUB_EDITENV) && exists(GRUB_EDITENV_FALLBACK) {
        tools.retain(|(tool, _)| *tool != GRUB_EDITENV);
    }
    if !efi {
        tools.extend_from_slice(BIOS_TOOLS);
    }
    tools
}

/// Check the tools an install in the given boot mode shells out to.
/// `grub-editenv` stands in for `grub2-editenv`.
pub fn check_installer_tools(efi: bool) -> Result<()> {
    let tools = installer_tools(efi, command_exists);
    tracing::debug!("checking host tools: {:?}", tools.iter().map(|(t, _)| t).collect::<Vec<_>>());
    check_required_tools(&tools)
}
