//! Recording fakes for the collaborator traits, used by unit tests.

use anyhow::{anyhow, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::cloudinit::{CloudInitRunner, EngineError, Modifier};
use crate::config::Config;
use crate::fs::{Fs, OsFs};
use crate::mount::{Mounter, Syscall};
use crate::process::Runner;

type SideEffect = Box<dyn Fn(&str, &[&str]) -> Result<Vec<u8>> + Send + Sync>;

/// Runner that records every command instead of executing it.
#[derive(Default)]
pub struct FakeRunner {
    cmds: Mutex<Vec<Vec<String>>>,
    side_effect: Mutex<Option<SideEffect>>,
    missing: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the output or failure of every subsequent command.
    pub fn set_side_effect<F>(&self, f: F)
    where
        F: Fn(&str, &[&str]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        *self.side_effect.lock().unwrap() = Some(Box::new(f));
    }

    pub fn cmds(&self) -> Vec<Vec<String>> {
        self.cmds.lock().unwrap().clone()
    }

    /// Report `commands` as absent from `PATH`. Everything else exists.
    pub fn set_missing(&self, commands: &[&str]) {
        *self.missing.lock().unwrap() = commands.iter().map(|c| c.to_string()).collect();
    }

    pub fn clear(&self) {
        self.cmds.lock().unwrap().clear();
    }

    /// Whether a command starting with `prefix` was run.
    pub fn ran(&self, prefix: &[&str]) -> bool {
        self.cmds
            .lock()
            .unwrap()
            .iter()
            .any(|cmd| cmd.len() >= prefix.len() && cmd.iter().zip(prefix).all(|(a, b)| a == b))
    }
}

impl Runner for FakeRunner {
    fn run(&self, command: &str, args: &[&str]) -> Result<Vec<u8>> {
        let mut cmd = vec![command.to_string()];
        cmd.extend(args.iter().map(|a| a.to_string()));
        self.cmds.lock().unwrap().push(cmd);
        match self.side_effect.lock().unwrap().as_ref() {
            Some(f) => f(command, args),
            None => Ok(Vec::new()),
        }
    }

    fn command_exists(&self, command: &str) -> bool {
        !self.missing.lock().unwrap().iter().any(|c| c == command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountCall {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fstype: String,
    pub options: Vec<String>,
}

/// Mounter keeping an in-memory mount table.
#[derive(Default)]
pub struct FakeMounter {
    pub error_on_mount: AtomicBool,
    pub error_on_unmount: AtomicBool,
    fail_on: Mutex<Option<PathBuf>>,
    mounts: Mutex<Vec<MountCall>>,
    unmounts: Mutex<Vec<PathBuf>>,
    table: Mutex<Vec<PathBuf>>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail mounts onto `target` only.
    pub fn fail_mount_on(&self, target: impl Into<PathBuf>) {
        *self.fail_on.lock().unwrap() = Some(target.into());
    }

    pub fn mounts(&self) -> Vec<MountCall> {
        self.mounts.lock().unwrap().clone()
    }

    pub fn mounted_targets(&self) -> Vec<PathBuf> {
        self.mounts().into_iter().map(|m| m.target).collect()
    }

    pub fn unmounts(&self) -> Vec<PathBuf> {
        self.unmounts.lock().unwrap().clone()
    }

    /// Targets currently mounted.
    pub fn table(&self) -> Vec<PathBuf> {
        self.table.lock().unwrap().clone()
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, source: &Path, target: &Path, fstype: &str, options: &[&str]) -> Result<()> {
        if self.error_on_mount.load(Ordering::SeqCst) {
            return Err(anyhow!("mount error"));
        }
        if self.fail_on.lock().unwrap().as_deref() == Some(target) {
            return Err(anyhow!("mount error on {}", target.display()));
        }
        self.mounts.lock().unwrap().push(MountCall {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
        });
        self.table.lock().unwrap().push(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        if self.error_on_unmount.load(Ordering::SeqCst) {
            return Err(anyhow!("unmount error"));
        }
        self.unmounts.lock().unwrap().push(target.to_path_buf());
        self.table.lock().unwrap().retain(|t| t != target);
        Ok(())
    }

    fn is_likely_not_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(!self.table.lock().unwrap().iter().any(|t| t == path))
    }
}

/// Syscall fake that records root changes.
#[derive(Default)]
pub struct FakeSyscall {
    pub error_on_chroot: AtomicBool,
    chroots: Mutex<Vec<PathBuf>>,
    fchdirs: Mutex<usize>,
}

impl FakeSyscall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chroots(&self) -> Vec<PathBuf> {
        self.chroots.lock().unwrap().clone()
    }

    pub fn fchdir_count(&self) -> usize {
        *self.fchdirs.lock().unwrap()
    }
}

impl Syscall for FakeSyscall {
    fn chroot(&self, path: &Path) -> Result<()> {
        if self.error_on_chroot.load(Ordering::SeqCst) {
            return Err(anyhow!("chroot error"));
        }
        self.chroots.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn chdir(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn fchdir(&self, _dir: &File) -> Result<()> {
        *self.fchdirs.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCall {
    pub stage: String,
    pub sources: Vec<String>,
    pub modifier: Modifier,
}

/// Provisioning engine fake recording each executed stage.
#[derive(Default)]
pub struct FakeCloudInitRunner {
    pub error: AtomicBool,
    calls: Mutex<Vec<StageCall>>,
}

impl FakeCloudInitRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<StageCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn executed_stages(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.stage).collect()
    }
}

impl CloudInitRunner for FakeCloudInitRunner {
    fn run(&self, stage: &str, sources: &[String], modifier: Modifier) -> Result<()> {
        self.calls.lock().unwrap().push(StageCall {
            stage: stage.to_string(),
            sources: sources.to_vec(),
            modifier,
        });
        if self.error.load(Ordering::SeqCst) {
            return Err(EngineError::Step("cloud init failure".to_string()).into());
        }
        Ok(())
    }
}

/// Fakes wired into a [`Config`] rooted at a scratch directory.
pub struct TestEnv {
    pub temp: tempfile::TempDir,
    pub fs: Arc<OsFs>,
    pub runner: Arc<FakeRunner>,
    pub mounter: Arc<FakeMounter>,
    pub syscall: Arc<FakeSyscall>,
    pub cloud_init: Arc<FakeCloudInitRunner>,
    pub config: Config,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp = tempfile::TempDir::new().unwrap();
        let fs = Arc::new(OsFs::rooted(temp.path()));
        let runner = Arc::new(FakeRunner::new());
        let mounter = Arc::new(FakeMounter::new());
        let syscall = Arc::new(FakeSyscall::new());
        let cloud_init = Arc::new(FakeCloudInitRunner::new());
        let config = Config::new()
            .with_fs(fs.clone())
            .with_runner(runner.clone())
            .with_mounter(mounter.clone())
            .with_syscall(syscall.clone())
            .with_cloud_init(cloud_init.clone());
        Self {
            temp,
            fs,
            runner,
            mounter,
            syscall,
            cloud_init,
            config,
        }
    }

    pub fn write(&self, path: &str, contents: &str) {
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            crate::fs::mkdir_all(self.fs.as_ref(), parent).unwrap();
        }
        self.fs
            .write(path, contents.as_bytes(), crate::constants::FILE_PERM)
            .unwrap();
    }
}
