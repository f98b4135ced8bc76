//! Filesystem abstraction.
//!
//! Components never touch host paths directly: every path goes through an
//! [`Fs`] so the same code runs against the real root or against a scratch
//! directory standing in for `/` in tests. Anything handed to an external
//! tool must be resolved with [`Fs::raw_path`] first.

use anyhow::{Context, Result};
use std::fs::{self, File, Metadata, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::constants::{DIR_PERM, FILE_PERM};

/// Path based file access.
pub trait Fs: Send + Sync {
    /// Host path backing `path`.
    fn raw_path(&self, path: &Path) -> PathBuf;

    fn open(&self, path: &Path) -> io::Result<File> {
        File::open(self.raw_path(path))
    }

    fn create(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_PERM)
            .open(self.raw_path(path))
    }

    fn metadata(&self, path: &Path) -> io::Result<Metadata> {
        fs::metadata(self.raw_path(path))
    }

    fn symlink_metadata(&self, path: &Path) -> io::Result<Metadata> {
        fs::symlink_metadata(self.raw_path(path))
    }

    fn create_dir(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::DirBuilder::new().mode(mode).create(self.raw_path(path))
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(self.raw_path(path))
    }

    /// Entries of a directory as paths in this filesystem, sorted by name.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(self.raw_path(path))?
            .map(|entry| entry.map(|e| path.join(e.file_name())))
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(self.raw_path(path))
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(self.raw_path(path))
    }

    fn write(&self, path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
        let raw = self.raw_path(path);
        fs::write(&raw, contents)?;
        fs::set_permissions(&raw, fs::Permissions::from_mode(mode))
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(self.raw_path(path))
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(self.raw_path(path))
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;

    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(self.raw_path(path), fs::Permissions::from_mode(mode))
    }
}

/// Filesystem backed by the host, optionally rooted at a directory that
/// stands in for `/`.
#[derive(Debug, Clone)]
pub struct OsFs {
    root: PathBuf,
}

impl OsFs {
    /// The real host filesystem.
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }

    /// A filesystem whose `/` is `root` on the host.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn strip_root<'a>(&self, raw: &'a Path) -> &'a Path {
        if self.root == Path::new("/") {
            return raw;
        }
        raw.strip_prefix(&self.root).unwrap_or(raw)
    }
}

impl Default for OsFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Fs for OsFs {
    fn raw_path(&self, path: &Path) -> PathBuf {
        let mut raw = self.root.clone();
        for component in path.components() {
            match component {
                Component::Normal(part) => raw.push(part),
                Component::ParentDir => raw.push(".."),
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        raw
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        let target = if target.is_absolute() {
            self.raw_path(target)
        } else {
            target.to_path_buf()
        };
        std::os::unix::fs::symlink(target, self.raw_path(link))
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        let target = fs::read_link(self.raw_path(path))?;
        if target.is_absolute() && self.root != Path::new("/") {
            return Ok(Path::new("/").join(self.strip_root(&target)));
        }
        Ok(target)
    }
}

/// Whether `path` exists, following symlinks.
pub fn exists(fs: &dyn Fs, path: &Path) -> Result<bool> {
    match fs.metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }
}

pub fn is_dir(fs: &dyn Fs, path: &Path) -> Result<bool> {
    let meta = fs
        .metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    Ok(meta.is_dir())
}

/// Create `path` and every missing parent with the default directory mode.
pub fn mkdir_all(fs: &dyn Fs, path: &Path) -> Result<()> {
    fs.create_dir_all(path, DIR_PERM)
        .with_context(|| format!("Failed to create directory {}", path.display()))
}

/// Copy a file. When `target` is an existing directory the file keeps its name.
pub fn copy_file(fs: &dyn Fs, source: &Path, target: &Path) -> Result<()> {
    let target = if is_dir(fs, target).unwrap_or(false) {
        match source.file_name() {
            Some(name) => target.join(name),
            None => target.to_path_buf(),
        }
    } else {
        target.to_path_buf()
    };
    let mut src = fs
        .open(source)
        .with_context(|| format!("Failed to open {}", source.display()))?;
    let mut dst = fs
        .create(&target)
        .with_context(|| format!("Failed to create {}", target.display()))?;
    io::copy(&mut src, &mut dst).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            source.display(),
            target.display()
        )
    })?;
    Ok(())
}

/// Walk `root` and return every regular file named `name`, in walk order.
///
/// Symlinks are not followed. An unreadable entry aborts the walk.
pub fn find_files_by_name(fs: &dyn Fs, root: &Path, name: &str) -> Result<Vec<PathBuf>> {
    let raw_root = fs.raw_path(root);
    let mut found = Vec::new();
    for entry in WalkDir::new(&raw_root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed walking {}", root.display()))?;
        if entry.file_type().is_dir() || entry.file_name() != name {
            continue;
        }
        let relative = entry.path().strip_prefix(&raw_root).unwrap_or(entry.path());
        found.push(root.join(relative));
    }
    Ok(found)
}

/// Returns the local path of `uri` if it is a local path or a `file://` URI,
/// `None` for remote URIs.
pub fn local_path(uri: &str) -> Option<&str> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Some(path);
    }
    match uri.split_once("://") {
        Some((scheme, _))
            if !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) =>
        {
            None
        }
        _ => Some(uri),
    }
}
