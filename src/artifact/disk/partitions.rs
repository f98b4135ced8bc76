//! Block device and partition discovery through `lsblk` and `blkid`.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::thread;
use std::time::Duration;

use crate::constants::LSBLK_COLUMNS;
use crate::process::Runner;

/// Pause between attempts of the label lookups.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// One partition (or loop device) as reported by the host. Size is in MiB.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub label: String,
    pub size: u64,
    pub fs: String,
    pub mountpoint: String,
    pub path: String,
    pub disk: String,
    pub flags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LsblkDevice {
    label: Option<String>,
    size: Option<u64>,
    fstype: Option<String>,
    mountpoint: Option<String>,
    path: Option<String>,
    pkname: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    fn partition(&self) -> Partition {
        Partition {
            label: self.label.clone().unwrap_or_default(),
            size: self.size.unwrap_or_default() / (1024 * 1024),
            fs: self.fstype.clone().unwrap_or_default(),
            mountpoint: self.mountpoint.clone().unwrap_or_default(),
            path: self.path.clone().unwrap_or_default(),
            disk: self.pkname.clone().unwrap_or_default(),
            flags: Vec::new(),
        }
    }

    /// Partitions and loop devices in this subtree, parents first.
    fn collect(&self, out: &mut Vec<Partition>) {
        if matches!(self.kind.as_deref(), Some("part") | Some("loop")) {
            out.push(self.partition());
        }
        for child in &self.children {
            child.collect(out);
        }
    }
}

fn parse_lsblk(output: &[u8]) -> Result<Vec<LsblkDevice>> {
    let mut doc: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(output).context("parsing lsblk output")?;
    let devices = doc
        .remove("blockdevices")
        .ok_or_else(|| anyhow!("Invalid json object, no 'blockdevices' key found"))?;
    serde_json::from_value(devices).context("parsing lsblk block devices")
}

fn unmarshal_partitions(output: &[u8]) -> Result<Vec<Partition>> {
    let mut partitions = Vec::new();
    for device in parse_lsblk(output)? {
        device.collect(&mut partitions);
    }
    Ok(partitions)
}

/// Every partition and loop device on the host. Rescans on each call.
pub fn get_all_partitions(runner: &dyn Runner) -> Result<Vec<Partition>> {
    let out = runner.run(
        "lsblk",
        &["-p", "-b", "-n", "-J", "--output", LSBLK_COLUMNS],
    )?;
    unmarshal_partitions(&out)
}

/// Partitions of `device`. A partition device lists only itself.
pub fn get_device_partitions(runner: &dyn Runner, device: &str) -> Result<Vec<Partition>> {
    let out = runner.run(
        "lsblk",
        &["-p", "-b", "-n", "-J", "--output", LSBLK_COLUMNS, device],
    )?;
    unmarshal_partitions(&out)
}

/// Filesystem type of `partition`. Bare names are taken as `/dev` entries.
pub fn get_partition_fs(runner: &dyn Runner, partition: &str) -> Result<String> {
    let device = if partition.starts_with("/dev") {
        partition.to_string()
    } else {
        format!("/dev/{}", partition.trim_start_matches('/'))
    };

    let out = runner
        .run("lsblk", &["-n", "-d", "-o", "FSTYPE", &device])
        .with_context(|| format!("could not find filesystem for {}", device))?;
    let fs = String::from_utf8_lossy(&out).trim().to_string();
    if fs.is_empty() {
        bail!("could not find filesystem for {}", device);
    }
    Ok(fs)
}

fn device_by_label(
    runner: &dyn Runner,
    label: &str,
    attempts: usize,
    interval: Duration,
) -> Result<String> {
    for attempt in 0..attempts {
        if let Err(e) = runner.run("udevadm", &["settle"]) {
            tracing::debug!("udevadm settle failed: {:#}", e);
        }
        if let Ok(out) = runner.run("blkid", &["--label", label]) {
            let device = String::from_utf8_lossy(&out).trim().to_string();
            if !device.is_empty() {
                return Ok(device);
            }
        }
        if attempt + 1 < attempts {
            thread::sleep(interval);
        }
    }
    bail!("no device found")
}

/// Device path carrying filesystem `label`, retrying `attempts` times one
/// second apart.
pub fn get_device_by_label(runner: &dyn Runner, label: &str, attempts: usize) -> Result<String> {
    device_by_label(runner, label, attempts, RETRY_INTERVAL)
}

fn full_device_by_label(
    runner: &dyn Runner,
    label: &str,
    attempts: usize,
    interval: Duration,
) -> Result<Partition> {
    let device = device_by_label(runner, label, attempts, interval)?;
    let out = runner.run(
        "lsblk",
        &["-p", "-b", "-n", "-J", "--output", LSBLK_COLUMNS, &device],
    )?;
    parse_lsblk(&out)?
        .first()
        .map(LsblkDevice::partition)
        .ok_or_else(|| anyhow!("no device found"))
}

/// Like [`get_device_by_label`] but returns everything lsblk knows about the
/// device.
pub fn get_full_device_by_label(
    runner: &dyn Runner,
    label: &str,
    attempts: usize,
) -> Result<Partition> {
    full_device_by_label(runner, label, attempts, RETRY_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::FakeRunner;

    const LSBLK_FLAT: &str = r#"{
  "blockdevices": [
    {"label": "COS_GRUB", "size": 67108864, "fstype": "vfat", "mountpoint": "/boot/efi", "path": "/dev/sda1", "pkname": "/dev/sda", "type": "part"},
    {"label": "COS_STATE", "size": 6442450944, "fstype": "ext4", "mountpoint": null, "path": "/dev/sda2", "pkname": "/dev/sda", "type": "part"},
    {"label": null, "size": 21474836480, "fstype": null, "mountpoint": null, "path": "/dev/sda", "pkname": null, "type": "disk"},
    {"label": "LIVE", "size": 1048576, "fstype": "iso9660", "mountpoint": "/run/live", "path": "/dev/loop0", "pkname": null, "type": "loop"}
  ]
}"#;

    const LSBLK_TREE: &str = r#"{
  "blockdevices": [
    {"label": null, "size": 21474836480, "path": "/dev/vda", "type": "disk", "children": [
      {"label": "COS_OEM", "size": 67108864, "fstype": "ext4", "path": "/dev/vda1", "pkname": "/dev/vda", "type": "part"}
    ]}
  ]
}"#;

    fn runner_with(output: &'static str) -> FakeRunner {
        let runner = FakeRunner::new();
        runner.set_side_effect(move |_, _| Ok(output.as_bytes().to_vec()));
        runner
    }

    #[test]
    fn test_all_partitions_filters_disks() {
        let runner = runner_with(LSBLK_FLAT);
        let parts = get_all_partitions(&runner).unwrap();

        assert_eq!(parts.len(), 3);
        assert_eq!(
            parts[0],
            Partition {
                label: "COS_GRUB".into(),
                size: 64,
                fs: "vfat".into(),
                mountpoint: "/boot/efi".into(),
                path: "/dev/sda1".into(),
                disk: "/dev/sda".into(),
                flags: vec![],
            }
        );
        assert_eq!(parts[1].size, 6144);
        assert_eq!(parts[1].mountpoint, "");
        assert_eq!(parts[2].path, "/dev/loop0");
        assert_eq!(
            runner.cmds(),
            vec![vec!["lsblk", "-p", "-b", "-n", "-J", "--output", LSBLK_COLUMNS]]
        );
    }

    #[test]
    fn test_device_partitions_walks_children() {
        let runner = runner_with(LSBLK_TREE);
        let parts = get_device_partitions(&runner, "/dev/vda").unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].label, "COS_OEM");
        assert_eq!(parts[0].disk, "/dev/vda");
        assert_eq!(runner.cmds()[0].last().unwrap(), "/dev/vda");
    }

    #[test]
    fn test_missing_blockdevices_key() {
        let runner = runner_with(r#"{"devices": []}"#);
        let err = get_all_partitions(&runner).unwrap_err();
        assert_eq!(err.to_string(), "Invalid json object, no 'blockdevices' key found");

        let runner = runner_with("not json");
        assert!(get_all_partitions(&runner).is_err());
    }

    #[test]
    fn test_partition_fs() {
        let runner = runner_with("ext4\n");
        assert_eq!(get_partition_fs(&runner, "sda2").unwrap(), "ext4");
        assert_eq!(runner.cmds()[0].last().unwrap(), "/dev/sda2");

        let runner = runner_with("\n");
        let err = get_partition_fs(&runner, "/dev/sda3").unwrap_err();
        assert!(err.to_string().contains("/dev/sda3"));
    }

    #[test]
    fn test_device_by_label_retries() {
        let runner = FakeRunner::new();
        runner.set_side_effect(|cmd, _| match cmd {
            "blkid" => Ok(b"/dev/sda2\n".to_vec()),
            _ => Ok(Vec::new()),
        });
        assert_eq!(get_device_by_label(&runner, "COS_STATE", 1).unwrap(), "/dev/sda2");
        assert!(runner.ran(&["udevadm", "settle"]));
        assert!(runner.ran(&["blkid", "--label", "COS_STATE"]));

        let runner = FakeRunner::new();
        let err = device_by_label(&runner, "MISSING", 3, Duration::ZERO).unwrap_err();
        assert_eq!(err.to_string(), "no device found");
        let blkid_calls = runner.cmds().iter().filter(|c| c[0] == "blkid").count();
        assert_eq!(blkid_calls, 3);
    }

    #[test]
    fn test_full_device_by_label() {
        let runner = FakeRunner::new();
        runner.set_side_effect(|cmd, _| match cmd {
            "blkid" => Ok(b"/dev/sda2".to_vec()),
            "lsblk" => Ok(LSBLK_FLAT.as_bytes().to_vec()),
            _ => Ok(Vec::new()),
        });
        let part = full_device_by_label(&runner, "COS_GRUB", 2, Duration::ZERO).unwrap();
        assert_eq!(part.label, "COS_GRUB");
        assert_eq!(part.fs, "vfat");
        assert_eq!(runner.cmds().last().unwrap().last().unwrap(), "/dev/sda2");

        let runner = FakeRunner::new();
        let err = full_device_by_label(&runner, "COS_GRUB", 1, Duration::ZERO).unwrap_err();
        assert_eq!(err.to_string(), "no device found");
    }
}
