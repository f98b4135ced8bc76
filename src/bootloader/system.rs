//! Source distribution detection from `os-release`.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::Path;

use crate::config::Arch;
use crate::fs::Fs;

/// Distribution families whose shim packaging the installer knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceSystem {
    Fedora,
    Ubuntu,
    Suse,
}

/// EFI binaries shipped by a distribution for one architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimFiles {
    /// Every file to copy: shim, MOK manager and the signed grub.
    pub files: [&'static str; 3],
    /// The shim the boot entry points at.
    pub shim: &'static str,
}

impl SourceSystem {
    pub fn shim_files(self, arch: Arch) -> ShimFiles {
        match (self, arch) {
            (SourceSystem::Fedora, Arch::Arm64) => ShimFiles {
                files: ["shimaa64.efi", "mmaa64.efi", "grubx64.efi"],
                shim: "shimaa64.efi",
            },
            (SourceSystem::Fedora, Arch::X86_64) => ShimFiles {
                files: ["shimx64.efi", "mmx64.efi", "grubx64.efi"],
                shim: "shimx64.efi",
            },
            (SourceSystem::Ubuntu, Arch::Arm64) => ShimFiles {
                files: ["shimaa64.efi.signed", "mmaa64.efi", "grubx64.efi.signed"],
                shim: "shimaa64.efi.signed",
            },
            (SourceSystem::Ubuntu, Arch::X86_64) => ShimFiles {
                files: ["shimx64.efi.signed", "mmx64.efi", "grubx64.efi.signed"],
                shim: "shimx64.efi.signed",
            },
            (SourceSystem::Suse, _) => ShimFiles {
                files: ["shim.efi", "MokManager.efi", "grub.efi"],
                shim: "shim.efi",
            },
        }
    }

    fn from_ids(ids: &[&str]) -> Option<Self> {
        ids.iter().find_map(|id| match *id {
            "fedora" | "rhel" | "centos" | "rocky" | "almalinux" => Some(SourceSystem::Fedora),
            "ubuntu" | "debian" => Some(SourceSystem::Ubuntu),
            id if id.contains("suse") || id == "sles" => Some(SourceSystem::Suse),
            _ => None,
        })
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceSystem::Fedora => "fedora",
            SourceSystem::Ubuntu => "ubuntu",
            SourceSystem::Suse => "suse",
        })
    }
}

/// Value of `key` in os-release content, unquoted.
fn os_release_value<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        let (k, v) = line.trim().split_once('=')?;
        (k == key).then(|| v.trim().trim_matches(|c| c == '"' || c == '\''))
    })
}

/// Value of `key` in the os-release file of `root_dir`, `None` when the key
/// is unset or empty.
pub fn os_release_entry(fs: &dyn Fs, root_dir: &Path, key: &str) -> Result<Option<String>> {
    let path = root_dir.join("etc/os-release");
    let content = fs
        .read_to_string(&path)
        .with_context(|| format!("Failed reading os-release file {}", path.display()))?;
    Ok(os_release_value(&content, key)
        .filter(|v| !v.is_empty())
        .map(str::to_string))
}

/// Identify the distribution of the tree at `root_dir`. `ID` wins over
/// `ID_LIKE`.
pub fn identify_source_system(fs: &dyn Fs, root_dir: &Path) -> Result<SourceSystem> {
    let path = root_dir.join("etc/os-release");
    let content = fs
        .read_to_string(&path)
        .with_context(|| format!("Failed reading os-release file {}", path.display()))?;

    let id = os_release_value(&content, "ID").unwrap_or_default();
    let id_like = os_release_value(&content, "ID_LIKE").unwrap_or_default();
    let mut ids = vec![id];
    ids.extend(id_like.split_whitespace());

    match SourceSystem::from_ids(&ids) {
        Some(system) => Ok(system),
        None => bail!(
            "unsupported system in os-release {} (ID={}, ID_LIKE={})",
            path.display(),
            id,
            id_like
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{mkdir_all, OsFs};
    use tempfile::TempDir;

    fn with_os_release(content: &str) -> (TempDir, OsFs) {
        let temp = TempDir::new().unwrap();
        let fs = OsFs::rooted(temp.path());
        mkdir_all(&fs, Path::new("/root/etc")).unwrap();
        fs.write(Path::new("/root/etc/os-release"), content.as_bytes(), 0o644)
            .unwrap();
        (temp, fs)
    }

    #[test]
    fn test_identifies_by_id() {
        let (_temp, fs) = with_os_release("NAME=\"Fedora Linux\"\nID=fedora\nVERSION_ID=39\n");
        assert_eq!(
            identify_source_system(&fs, Path::new("/root")).unwrap(),
            SourceSystem::Fedora
        );

        let (_temp, fs) = with_os_release("NAME=\"openSUSE Leap Micro\"\nID=\"opensuse-leap-micro\"\n");
        assert_eq!(
            identify_source_system(&fs, Path::new("/root")).unwrap(),
            SourceSystem::Suse
        );
    }

    #[test]
    fn test_falls_back_to_id_like() {
        let (_temp, fs) = with_os_release("ID=pop\nID_LIKE=\"ubuntu debian\"\n");
        assert_eq!(
            identify_source_system(&fs, Path::new("/root")).unwrap(),
            SourceSystem::Ubuntu
        );
    }

    #[test]
    fn test_unknown_system() {
        let (_temp, fs) = with_os_release("ID=arch\n");
        let err = identify_source_system(&fs, Path::new("/root")).unwrap_err();
        assert!(err.to_string().contains("os-release"));
    }

    #[test]
    fn test_missing_os_release() {
        let temp = TempDir::new().unwrap();
        let fs = OsFs::rooted(temp.path());
        let err = identify_source_system(&fs, Path::new("/root")).unwrap_err();
        assert!(err.to_string().contains("os-release"));
    }

    #[test]
    fn test_os_release_entry() {
        let (_temp, fs) = with_os_release("ID=fedora\nGRUB_ENTRY_NAME=\"My OS\"\nEMPTY=\n");
        let root = Path::new("/root");
        assert_eq!(
            os_release_entry(&fs, root, "GRUB_ENTRY_NAME").unwrap().as_deref(),
            Some("My OS")
        );
        assert_eq!(os_release_entry(&fs, root, "EMPTY").unwrap(), None);
        assert_eq!(os_release_entry(&fs, root, "MISSING").unwrap(), None);
        assert!(os_release_entry(&fs, Path::new("/nope"), "ID").is_err());
    }

    #[test]
    fn test_shim_files_per_arch() {
        assert_eq!(SourceSystem::Fedora.shim_files(Arch::X86_64).shim, "shimx64.efi");
        assert_eq!(SourceSystem::Fedora.shim_files(Arch::Arm64).shim, "shimaa64.efi");
        assert_eq!(
            SourceSystem::Ubuntu.shim_files(Arch::X86_64).files,
            ["shimx64.efi.signed", "mmx64.efi", "grubx64.efi.signed"]
        );
        assert_eq!(SourceSystem::Suse.shim_files(Arch::Arm64).shim, "shim.efi");
    }
}
