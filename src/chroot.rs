//! Bind-mounted chroot environments.
//!
//! A [`Chroot`] bind-mounts `/dev`, `/dev/pts`, `/proc`, `/sys` and any
//! extra host paths into a target tree, switches the process root into it
//! for the duration of a command or callback, and unwinds afterwards.
//!
//! Only one set of mounts is active per instance. Mounts are applied in a
//! fixed order (defaults, then extras sorted by host path) and removed in
//! reverse.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::constants::DEFAULT_CHROOT_MOUNTS;
use crate::errors;
use crate::mount::Syscall;

pub struct Chroot {
    path: PathBuf,
    default_mounts: Vec<String>,
    extra_mounts: BTreeMap<String, String>,
    active_mounts: Vec<PathBuf>,
    config: Config,
}

impl Chroot {
    pub fn new(path: impl Into<PathBuf>, config: &Config) -> Self {
        Self {
            path: path.into(),
            default_mounts: DEFAULT_CHROOT_MOUNTS.iter().map(|m| m.to_string()).collect(),
            extra_mounts: BTreeMap::new(),
            active_mounts: Vec::new(),
            config: config.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the extra bind mounts, keyed by host path with the path
    /// inside the chroot as value. Takes effect on the next `prepare`.
    pub fn set_extra_mounts(&mut self, mounts: BTreeMap<String, String>) {
        self.extra_mounts = mounts;
    }

    /// Mount points currently mounted, in mount order.
    pub fn active_mounts(&self) -> &[PathBuf] {
        &self.active_mounts
    }

    pub fn is_prepared(&self) -> bool {
        !self.active_mounts.is_empty()
    }

    fn mount_point(&self, inner: &str) -> PathBuf {
        let root = self.path.to_string_lossy();
        PathBuf::from(format!("{}{}", root.trim_end_matches('/'), inner))
    }

    /// Bind-mount the default and extra mounts into the target.
    ///
    /// Fails if this instance already has active mounts. On any failure the
    /// mounts made so far are removed before the error is returned.
    pub fn prepare(&mut self) -> Result<()> {
        if self.is_prepared() {
            bail!("There are already active mountpoints for this instance");
        }

        let mut plan: Vec<(PathBuf, PathBuf)> = Vec::new();
        for mnt in &self.default_mounts {
            plan.push((PathBuf::from(mnt), self.mount_point(mnt)));
        }
        for (source, inner) in &self.extra_mounts {
            plan.push((PathBuf::from(source), self.mount_point(inner)));
        }

        for (source, mount_point) in plan {
            if let Err(err) = self.bind_mount(&source, &mount_point) {
                if let Err(close_err) = self.close() {
                    tracing::error!("Failed to unwind partial chroot mounts: {:#}", close_err);
                }
                return Err(err);
            }
            self.active_mounts.push(mount_point);
        }
        Ok(())
    }

    fn bind_mount(&self, source: &Path, mount_point: &Path) -> Result<()> {
        crate::fs::mkdir_all(self.config.fs.as_ref(), mount_point)?;
        self.config
            .mounter
            .mount(source, mount_point, "bind", &["bind"])
            .with_context(|| {
                format!(
                    "Failed to bind mount {} on {}",
                    source.display(),
                    mount_point.display()
                )
            })
    }

    /// Unmount every active mount, last mounted first.
    ///
    /// Every mount point is attempted. Those that fail to unmount stay
    /// active, so calling `close` again only retries them. A no-op when
    /// nothing is mounted.
    pub fn close(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        while let Some(current) = self.active_mounts.pop() {
            if let Err(err) = self.config.mounter.unmount(&current) {
                tracing::error!("Error unmounting {}: {:#}", current.display(), err);
                failures.push(current);
            }
        }
        if failures.is_empty() {
            return Ok(());
        }

        let names = failures
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        // keep mount order so a retry unmounts in reverse again
        failures.reverse();
        self.active_mounts = failures;
        bail!(
            "Failed closing chroot environment. Unmount failures: [{}]",
            names
        )
    }

    /// Run `callback` with the process root switched to the target.
    ///
    /// Prepares the mounts if needed and closes them afterwards. The
    /// original root is restored even if `callback` fails or panics. When
    /// several steps fail the callback's error comes first.
    pub fn run_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let old_root = File::open("/").context("Can't open /")?;

        let prepared_here = !self.is_prepared();
        if prepared_here {
            self.prepare().context("Can't mount default mounts")?;
        }

        let result = self.enter(&old_root, callback);

        if prepared_here {
            errors::merge(result, self.close())
        } else {
            result
        }
    }

    fn enter<F>(&self, old_root: &File, callback: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let syscall = self.config.syscall.as_ref();
        syscall
            .chdir(&self.path)
            .and_then(|_| syscall.chroot(&self.path))
            .with_context(|| format!("Can't chroot {}", self.path.display()))?;
        let guard = RootGuard::new(syscall, old_root);

        let result = callback();
        errors::merge(result, guard.restore())
    }

    /// Run a command inside the chroot and return its output.
    pub fn run(&mut self, command: &str, args: &[&str]) -> Result<Vec<u8>> {
        let runner = self.config.runner.clone();
        let mut out = Vec::new();
        self.run_callback(|| {
            out = runner.run(command, args).map_err(|err| {
                tracing::error!("Can't run command on chroot: {:#}", err);
                err
            })?;
            Ok(())
        })?;
        Ok(out)
    }
}

/// Restores the saved root when dropped, so an unwinding callback cannot
/// leave the process chrooted.
struct RootGuard<'a> {
    syscall: &'a dyn Syscall,
    old_root: &'a File,
    armed: bool,
}

impl<'a> RootGuard<'a> {
    fn new(syscall: &'a dyn Syscall, old_root: &'a File) -> Self {
        Self {
            syscall,
            old_root,
            armed: true,
        }
    }

    fn restore(mut self) -> Result<()> {
        self.armed = false;
        restore_root(self.syscall, self.old_root)
    }
}

impl Drop for RootGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = restore_root(self.syscall, self.old_root) {
                tracing::error!("Failed to restore root: {:#}", err);
            }
        }
    }
}

fn restore_root(syscall: &dyn Syscall, old_root: &File) -> Result<()> {
    syscall
        .fchdir(old_root)
        .context("Can't change to old root dir")?;
    syscall
        .chroot(Path::new("."))
        .context("Can't chroot back to old root")
}

/// Run `callback` inside `path` with `bind_mounts` added to the default mounts.
pub fn chrooted_callback<F>(
    config: &Config,
    path: impl Into<PathBuf>,
    bind_mounts: BTreeMap<String, String>,
    callback: F,
) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    let mut chroot = Chroot::new(path, config);
    chroot.set_extra_mounts(bind_mounts);
    chroot.run_callback(callback)
}
