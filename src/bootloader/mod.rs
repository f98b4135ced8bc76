//! Bootloader installation.

pub mod grub;
pub mod system;

pub use grub::{chainload_config, has_boot_entry, Grub, GrubInstall};
pub use system::{identify_source_system, os_release_entry, ShimFiles, SourceSystem};
