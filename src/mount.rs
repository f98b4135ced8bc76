//! Mount and root-switching primitives.
//!
//! Both are traits so the chroot lifecycle can be exercised without
//! privileges; [`SysMounter`] and [`RealSyscall`] are the host versions.

use anyhow::{Context, Result};
use nix::mount::{self, MsFlags};
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Mount table operations.
pub trait Mounter: Send + Sync {
    /// Mount `source` on `target`. `options` are mount(8) style (`bind`, `ro`, ...).
    fn mount(&self, source: &Path, target: &Path, fstype: &str, options: &[&str]) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;

    /// Cheap mount point check: `true` when `path` is on the same device as
    /// its parent. Bind mounts of the same filesystem are not detected.
    fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool>;
}

/// Root and working directory changes.
pub trait Syscall: Send + Sync {
    fn chroot(&self, path: &Path) -> Result<()>;

    fn chdir(&self, path: &Path) -> Result<()>;

    /// Change the working directory to an already opened directory handle.
    fn fchdir(&self, dir: &File) -> Result<()>;
}

/// Mounter backed by mount(2)/umount(2).
#[derive(Debug, Default, Clone, Copy)]
pub struct SysMounter;

fn parse_options(options: &[&str]) -> (MsFlags, Option<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options {
        match *option {
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => {}
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            other => data.push(other),
        }
    }
    let data = if data.is_empty() {
        None
    } else {
        Some(data.join(","))
    };
    (flags, data)
}

impl Mounter for SysMounter {
    fn mount(&self, source: &Path, target: &Path, fstype: &str, options: &[&str]) -> Result<()> {
        let (flags, data) = parse_options(options);
        let fstype = match fstype {
            "" | "bind" => None,
            other => Some(other),
        };
        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            ?fstype,
            ?options,
            "mounting"
        );
        mount::mount(Some(source), target, fstype, flags, data.as_deref()).with_context(|| {
            format!(
                "mount error: {} on {}",
                source.display(),
                target.display()
            )
        })
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        tracing::debug!(target = %target.display(), "unmounting");
        mount::umount(target).with_context(|| format!("unmount error: {}", target.display()))
    }

    fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool> {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let parent = path.join("..");
        let parent_meta = std::fs::metadata(&parent)
            .with_context(|| format!("Failed to stat {}", parent.display()))?;
        Ok(meta.dev() == parent_meta.dev())
    }
}

/// Syscalls against the running process.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealSyscall;

impl Syscall for RealSyscall {
    fn chroot(&self, path: &Path) -> Result<()> {
        nix::unistd::chroot(path).with_context(|| format!("chroot error: {}", path.display()))
    }

    fn chdir(&self, path: &Path) -> Result<()> {
        nix::unistd::chdir(path).with_context(|| format!("chdir error: {}", path.display()))
    }

    fn fchdir(&self, dir: &File) -> Result<()> {
        nix::unistd::fchdir(dir).context("fchdir error")
    }
}
