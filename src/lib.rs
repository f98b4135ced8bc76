//! Privileged install core for Linux OS images.
//!
//! The pieces an installer drives once the target partitions exist:
//!
//! - **Cleanup** - [`CleanStack`] runs deferred jobs in LIFO order, filtered
//!   by whether the install failed
//! - **Chroot** - [`Chroot`] bind-mounts the host pseudo filesystems into a
//!   target tree and runs commands or callbacks inside it
//! - **Provisioning stages** - [`run_stage`] runs cloud-init style stages from
//!   the kernel command line and configured paths
//! - **Boot setup** - [`Grub`] installs GRUB for BIOS or EFI and manages the
//!   firmware boot entries through [`efi`]
//! - **Disk images** - partition discovery and fixed VHD footers in
//!   [`artifact::disk`]
//!
//! # Architecture
//!
//! ```text
//! Config ──┬── Fs             (file access, rooted for tests)
//!          ├── Runner         (external commands)
//!          ├── Mounter        (mount/unmount)
//!          ├── Syscall        (chroot/chdir)
//!          └── CloudInitRunner (stage engine)
//!
//! run_stage ── CloudInitRunner ── YipRunner
//! Chroot ───── Mounter + Syscall
//! Grub ─────── Fs + Runner + efi::Variables
//! ```
//!
//! Every component takes a [`Config`], so tests swap the collaborators for
//! recording fakes.

pub mod artifact;
pub mod bootloader;
pub mod chroot;
pub mod cleanstack;
pub mod cloudinit;
pub mod config;
pub mod constants;
pub mod efi;
pub mod errors;
pub mod fs;
pub mod logging;
pub mod mount;
pub mod preflight;
pub mod process;
pub mod runstage;
pub mod settings;

#[cfg(test)]
pub(crate) mod mocks;

pub use artifact::disk::{raw_disk_to_fixed_vhd, Partition};
pub use bootloader::{Grub, GrubInstall};
pub use chroot::{chrooted_callback, Chroot};
pub use cleanstack::{CleanJob, CleanStack, JobKind};
pub use cloudinit::{CloudInitRunner, EngineError, Modifier, YipRunner};
pub use config::{Arch, Config, Platform};
pub use errors::MultiError;
pub use runstage::run_stage;
pub use settings::{load_settings, InstallSettings};
