//! Collaborator bundle shared by the installer components.
//!
//! Every component takes a [`Config`] instead of reaching for the host
//! directly, so the whole core can be pointed at a scratch root and fake
//! runners in tests.

use std::fmt;
use std::sync::Arc;

use crate::cloudinit::{CloudInitRunner, YipRunner};
use crate::fs::{Fs, OsFs};
use crate::mount::{Mounter, RealSyscall, SysMounter, Syscall};
use crate::process::{RealRunner, Runner};

/// CPU architecture of the image being installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Arm64,
}

impl Arch {
    /// Architecture of the running host, defaulting to x86_64 for anything
    /// that is not arm64.
    pub fn host() -> Self {
        match std::env::consts::ARCH {
            "aarch64" => Arch::Arm64,
            _ => Arch::X86_64,
        }
    }

    /// Name used in grub platform directories (`x86_64-efi`, `arm64-efi`).
    pub fn grub_name(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.grub_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub arch: Arch,
}

impl Platform {
    pub fn host() -> Self {
        Self { arch: Arch::host() }
    }
}

/// Filesystem, process, mount and provisioning collaborators.
#[derive(Clone)]
pub struct Config {
    pub fs: Arc<dyn Fs>,
    pub runner: Arc<dyn Runner>,
    pub mounter: Arc<dyn Mounter>,
    pub syscall: Arc<dyn Syscall>,
    pub cloud_init: Arc<dyn CloudInitRunner>,
    pub platform: Platform,
}

impl Config {
    /// Config wired to the real host.
    pub fn new() -> Self {
        let fs: Arc<dyn Fs> = Arc::new(OsFs::new());
        let runner: Arc<dyn Runner> = Arc::new(RealRunner);
        let cloud_init = Arc::new(YipRunner::new(fs.clone(), runner.clone()));
        Self {
            fs,
            runner,
            mounter: Arc::new(SysMounter),
            syscall: Arc::new(RealSyscall),
            cloud_init,
            platform: Platform::host(),
        }
    }

    /// Swap the filesystem. The default provisioning engine is rebuilt so it
    /// reads from the same filesystem.
    pub fn with_fs(mut self, fs: Arc<dyn Fs>) -> Self {
        self.fs = fs;
        self.cloud_init = Arc::new(YipRunner::new(self.fs.clone(), self.runner.clone()));
        self
    }

    /// Swap the runner. Like [`with_fs`](Self::with_fs) this rebuilds the
    /// default provisioning engine; call [`with_cloud_init`](Self::with_cloud_init)
    /// afterwards to install a custom one.
    pub fn with_runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = runner;
        self.cloud_init = Arc::new(YipRunner::new(self.fs.clone(), self.runner.clone()));
        self
    }

    pub fn with_mounter(mut self, mounter: Arc<dyn Mounter>) -> Self {
        self.mounter = mounter;
        self
    }

    pub fn with_syscall(mut self, syscall: Arc<dyn Syscall>) -> Self {
        self.syscall = syscall;
        self
    }

    pub fn with_cloud_init(mut self, cloud_init: Arc<dyn CloudInitRunner>) -> Self {
        self.cloud_init = cloud_init;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}
