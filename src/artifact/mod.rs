//! Artifacts the installer reads or produces on disk.

pub mod disk;
