//! NVRAM variable stores.
//!
//! [`EfiVarFs`] talks to the firmware through efivarfs, [`MemoryVariables`]
//! keeps everything in a map so boot entry logic can be exercised without
//! hardware. Both implement [`Variables`].

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use super::load_option::{DevicePath, DevicePathNode, HardDriveNode};
use super::{Attributes, VariableDescriptor};
use crate::constants::EFIVARS_DIR;
use crate::fs::Fs;
use crate::process::Runner;

#[derive(Debug, Error)]
pub enum VariableError {
    #[error("variable {0} does not exist")]
    NotExist(String),
    #[error("variable {name} is malformed: {reason}")]
    Malformed { name: String, reason: String },
}

/// Access to EFI variables.
pub trait Variables: Send + Sync {
    fn list_variables(&self) -> Result<Vec<VariableDescriptor>>;

    fn get_variable(&self, guid: &Uuid, name: &str) -> Result<(Vec<u8>, Attributes)>;

    /// Write a variable. Empty `data` deletes it.
    fn set_variable(&self, guid: &Uuid, name: &str, data: &[u8], attrs: Attributes) -> Result<()>;

    fn del_variable(&self, guid: &Uuid, name: &str) -> Result<()> {
        let (_, attrs) = self.get_variable(guid, name)?;
        self.set_variable(guid, name, &[], attrs)
    }

    /// Device path a boot entry uses to reach the file at `path`.
    fn new_file_device_path(&self, path: &Path) -> Result<DevicePath>;
}

/// Names of the variables under `guid`.
pub fn variable_names(vars: &dyn Variables, guid: &Uuid) -> Result<Vec<String>> {
    Ok(vars
        .list_variables()?
        .into_iter()
        .filter(|v| &v.guid == guid)
        .map(|v| v.name)
        .collect())
}

nix::ioctl_read!(fs_ioc_getflags, b'f', 1, libc::c_long);
nix::ioctl_write_ptr!(fs_ioc_setflags, b'f', 2, libc::c_long);

const FS_IMMUTABLE_FL: libc::c_long = 0x0000_0010;

/// Drop the immutable flag efivarfs puts on most variables. Filesystems
/// without inode flags have nothing to clear.
fn make_mutable(path: &Path) -> Result<()> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to open {}", path.display())),
    };
    let fd = file.as_raw_fd();
    let mut flags: libc::c_long = 0;
    // SAFETY: fd is open for the duration of the call and flags outlives it.
    match unsafe { fs_ioc_getflags(fd, &mut flags) } {
        Ok(_) => {}
        Err(nix::errno::Errno::ENOTTY | nix::errno::Errno::EOPNOTSUPP | nix::errno::Errno::EINVAL) => {
            return Ok(())
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read inode flags of {}", path.display()))
        }
    }
    if flags & FS_IMMUTABLE_FL == 0 {
        return Ok(());
    }
    flags &= !FS_IMMUTABLE_FL;
    // SAFETY: same as above.
    unsafe { fs_ioc_setflags(fd, &flags) }
        .with_context(|| format!("Failed to clear immutable flag on {}", path.display()))?;
    Ok(())
}

fn read_trimmed(path: &Path) -> Result<String> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(content.trim().to_string())
}

fn read_number(path: &Path) -> Result<u64> {
    let value = read_trimmed(path)?;
    value
        .parse()
        .with_context(|| format!("Invalid number '{}' in {}", value, path.display()))
}

/// Variables exposed by the kernel's efivarfs.
///
/// Each variable is a file named `<Name>-<GUID>` whose first four bytes are
/// the little endian attributes, followed by the data.
pub struct EfiVarFs {
    fs: Arc<dyn Fs>,
    runner: Arc<dyn Runner>,
    dir: PathBuf,
}

impl EfiVarFs {
    pub fn new(fs: Arc<dyn Fs>, runner: Arc<dyn Runner>) -> Self {
        Self {
            fs,
            runner,
            dir: PathBuf::from(EFIVARS_DIR),
        }
    }

    fn var_path(&self, guid: &Uuid, name: &str) -> PathBuf {
        self.fs
            .raw_path(&self.dir.join(VariableDescriptor::new(name, *guid).to_string()))
    }

    fn part_uuid(&self, devname: &str) -> Result<Uuid> {
        let device = format!("/dev/{}", devname);
        let out = self.runner.run("lsblk", &["-n", "-o", "PARTUUID", &device])?;
        let text = String::from_utf8_lossy(&out);
        let value = text.trim();
        Uuid::parse_str(value).with_context(|| {
            format!("{} has no GPT partition UUID ('{}'), only GPT disks are supported", device, value)
        })
    }

    /// Hard drive node of the partition behind block device `major:minor`,
    /// read from sysfs.
    fn hard_drive_node(&self, major: u64, minor: u64) -> Result<HardDriveNode> {
        let sys_dev = self
            .fs
            .raw_path(Path::new(&format!("/sys/dev/block/{}:{}", major, minor)));
        let partition = read_number(&sys_dev.join("partition"))
            .with_context(|| format!("{}:{} is not a partition", major, minor))?;
        let start = read_number(&sys_dev.join("start"))?;
        let size = read_number(&sys_dev.join("size"))?;

        let uevent = read_trimmed(&sys_dev.join("uevent"))?;
        let Some(devname) = uevent.lines().find_map(|l| l.strip_prefix("DEVNAME=")) else {
            bail!("No DEVNAME for {}:{}", major, minor);
        };

        // sysfs reports 512 byte sectors, the node wants logical blocks
        let disk = std::fs::canonicalize(&sys_dev)
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| sys_dev.join(".."));
        let block_size = read_number(&disk.join("queue/logical_block_size")).unwrap_or(512);
        let to_lba = |sectors: u64| sectors * 512 / block_size.max(1);

        let partition = u32::try_from(partition).context("partition number out of range")?;
        Ok(HardDriveNode::gpt(
            partition,
            to_lba(start),
            to_lba(size),
            self.part_uuid(devname)?,
        ))
    }
}

impl Variables for EfiVarFs {
    fn list_variables(&self) -> Result<Vec<VariableDescriptor>> {
        let dir = self.fs.raw_path(&self.dir);
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?;
        let mut vars = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            // <Name>-<8-4-4-4-12 guid>
            if file_name.len() <= 37 || !file_name.is_char_boundary(file_name.len() - 37) {
                continue;
            }
            let (name, guid) = file_name.split_at(file_name.len() - 37);
            let Ok(guid) = Uuid::parse_str(&guid[1..]) else {
                continue;
            };
            vars.push(VariableDescriptor::new(name, guid));
        }
        vars.sort();
        Ok(vars)
    }

    fn get_variable(&self, guid: &Uuid, name: &str) -> Result<(Vec<u8>, Attributes)> {
        let path = self.var_path(guid, name);
        let mut content = Vec::new();
        match File::open(&path) {
            Ok(mut file) => file
                .read_to_end(&mut content)
                .with_context(|| format!("Failed to read {}", path.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(VariableError::NotExist(name.to_string()).into())
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to open {}", path.display())),
        };
        if content.len() < 4 {
            return Err(VariableError::Malformed {
                name: name.to_string(),
                reason: "shorter than its attribute header".into(),
            }
            .into());
        }
        let attrs = u32::from_le_bytes([content[0], content[1], content[2], content[3]]);
        Ok((content.split_off(4), Attributes(attrs)))
    }

    fn set_variable(&self, guid: &Uuid, name: &str, data: &[u8], attrs: Attributes) -> Result<()> {
        let path = self.var_path(guid, name);
        make_mutable(&path)?;

        if data.is_empty() {
            tracing::debug!("Deleting EFI variable {}", name);
            return match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
            };
        }

        // efivarfs takes the whole variable in a single write
        let mut payload = Vec::with_capacity(4 + data.len());
        payload.extend_from_slice(&attrs.bits().to_le_bytes());
        payload.extend_from_slice(data);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o644)
            .open(&path)
            .with_context(|| format!("Failed to open {} for writing", path.display()))?;
        file.write_all(&payload)
            .with_context(|| format!("Failed to write EFI variable {}", name))
    }

    fn new_file_device_path(&self, path: &Path) -> Result<DevicePath> {
        let raw = self.fs.raw_path(path);
        let meta = std::fs::metadata(&raw).with_context(|| format!("Failed to stat {}", path.display()))?;
        let dev = meta.dev();

        // the file path node is relative to the filesystem holding the file
        let mut mount_root = raw.as_path();
        while let Some(parent) = mount_root.parent() {
            match std::fs::metadata(parent) {
                Ok(m) if m.dev() == dev => mount_root = parent,
                _ => break,
            }
        }
        let relative = raw.strip_prefix(mount_root).unwrap_or(&raw);

        let major = nix::sys::stat::major(dev);
        let minor = nix::sys::stat::minor(dev);
        let hd = self.hard_drive_node(major, minor)?;
        Ok(DevicePath(vec![
            DevicePathNode::HardDrive(hd),
            DevicePathNode::file_path(&relative.to_string_lossy()),
        ]))
    }
}

#[derive(Debug, Clone)]
struct StoredVariable {
    data: Vec<u8>,
    attrs: Attributes,
}

/// In-memory variable store.
#[derive(Default)]
pub struct MemoryVariables {
    store: Mutex<BTreeMap<VariableDescriptor, StoredVariable>>,
    fs: Option<Arc<dyn Fs>>,
}

impl MemoryVariables {
    /// Location the EFI partition is mounted at in images; file paths are
    /// made relative to it.
    const ESP_LOCATION: &'static str = "/boot/efi/";

    pub fn new() -> Self {
        Self::default()
    }

    /// Store that checks boot files exist on `fs` before building device
    /// paths for them.
    pub fn with_fs(fs: Arc<dyn Fs>) -> Self {
        Self {
            store: Mutex::default(),
            fs: Some(fs),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<VariableDescriptor, StoredVariable>> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Dump the store as JSON, one object per variable name with base64
    /// encoded `guid`, `attributes` and `value`.
    pub fn to_json(&self) -> Result<String> {
        use base64::Engine as _;
        let engine = base64::engine::general_purpose::STANDARD;
        let payload: BTreeMap<String, BTreeMap<&str, String>> = self
            .lock()
            .iter()
            .map(|(key, entry)| {
                let fields = BTreeMap::from([
                    ("guid", engine.encode(key.guid.as_bytes())),
                    ("attributes", engine.encode((entry.attrs.bits() as u16).to_le_bytes())),
                    ("value", engine.encode(&entry.data)),
                ]);
                (key.name.clone(), fields)
            })
            .collect();
        serde_json::to_string_pretty(&payload).context("Failed to encode EFI variables")
    }
}

impl Variables for MemoryVariables {
    fn list_variables(&self) -> Result<Vec<VariableDescriptor>> {
        Ok(self.lock().keys().cloned().collect())
    }

    fn get_variable(&self, guid: &Uuid, name: &str) -> Result<(Vec<u8>, Attributes)> {
        self.lock()
            .get(&VariableDescriptor::new(name, *guid))
            .map(|v| (v.data.clone(), v.attrs))
            .ok_or_else(|| VariableError::NotExist(name.to_string()).into())
    }

    fn set_variable(&self, guid: &Uuid, name: &str, data: &[u8], attrs: Attributes) -> Result<()> {
        let key = VariableDescriptor::new(name, *guid);
        let mut store = self.lock();
        if data.is_empty() {
            store.remove(&key);
        } else {
            store.insert(
                key,
                StoredVariable {
                    data: data.to_vec(),
                    attrs,
                },
            );
        }
        Ok(())
    }

    fn new_file_device_path(&self, path: &Path) -> Result<DevicePath> {
        if let Some(fs) = &self.fs {
            fs.metadata(path)
                .with_context(|| format!("Failed to stat {}", path.display()))?;
        }
        let text = path.to_string_lossy();
        let relative = text.strip_prefix(Self::ESP_LOCATION).unwrap_or(&text);
        Ok(DevicePath(vec![DevicePathNode::file_path(relative)]))
    }
}
