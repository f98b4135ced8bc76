//! Shared labels, paths and file names used across the installer core.

/// Permissions for directories created inside target trees.
pub const DIR_PERM: u32 = 0o755;

/// Permissions for regular files written inside target trees.
pub const FILE_PERM: u32 = 0o644;

/// Mount points bind-mounted into every chroot, in mount order.
pub const DEFAULT_CHROOT_MOUNTS: &[&str] = &["/dev", "/dev/pts", "/proc", "/sys"];

/// Kernel command line pseudo-file.
pub const PROC_CMDLINE: &str = "/proc/cmdline";

/// Kernel command line key pointing at an extra cloud-init source.
pub const CMDLINE_SETUP_KEY: &str = "cos.setup";

/// Description and label of the NVRAM boot entry owned by the installer.
pub const BOOT_ENTRY_NAME: &str = "elemental-shim";

/// Mount point of the EFI system partition during install.
pub const EFI_DIR: &str = "/run/cos/efi";

/// Fallback EFI directory every firmware looks into.
pub const FALLBACK_EFI_PATH: &str = "/EFI/boot";

/// Directory holding the proper boot entry binaries.
pub const ENTRY_EFI_PATH: &str = "/EFI/elemental";

/// Well known fallback boot image for x86_64.
pub const EFI_IMG_X86: &str = "bootx64.efi";

/// Well known fallback boot image for arm64.
pub const EFI_IMG_ARM64: &str = "bootaa64.efi";

/// Grub modules required to boot from a squashed recovery image.
pub const GRUB_EFI_MODULES: &[&str] = &["loopback.mod", "squash4.mod", "xzio.mod"];

/// Default grub configuration file shipped by the source tree.
pub const GRUB_CONF: &str = "/etc/cos/grub.cfg";

/// Name of the grub configuration file in boot directories.
pub const GRUB_CFG: &str = "grub.cfg";

/// Boot-side grub directory, relative to the boot dir.
pub const GRUB_DIR: &str = "grub2";

/// Console every shipped grub.cfg already declares.
pub const DEFAULT_TTY: &str = "tty1";

/// Label of the state partition searched by the chainloading grub.cfg.
pub const STATE_LABEL: &str = "COS_STATE";

/// External grub installer for legacy BIOS installs.
pub const GRUB_INSTALL: &str = "grub2-install";

/// External tool that edits the grub environment block.
pub const GRUB_EDITENV: &str = "grub2-editenv";

/// Name of the same tool on distributions that ship grub without the `2`.
pub const GRUB_EDITENV_FALLBACK: &str = "grub-editenv";

/// Grub environment file on the boot partition holding OEM overrides.
pub const GRUB_OEM_ENV: &str = "grub_oem_env";

/// os-release key naming the default grub menu entry.
pub const GRUB_ENTRY_NAME_KEY: &str = "GRUB_ENTRY_NAME";

/// Columns requested from lsblk for partition discovery.
pub const LSBLK_COLUMNS: &str = "LABEL,SIZE,FSTYPE,MOUNTPOINT,PATH,PKNAME,TYPE";

/// efivarfs mount point on Linux hosts.
pub const EFIVARS_DIR: &str = "/sys/firmware/efi/efivars";
