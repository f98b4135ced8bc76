//! Fixed VHD footers for raw disk images.
//!
//! A fixed VHD is the raw disk followed by a 512-byte big-endian footer.
//! [`raw_disk_to_fixed_vhd`] appends that footer to an existing raw image.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use time::macros::datetime;
use time::OffsetDateTime;
use uuid::Uuid;

pub const FOOTER_SIZE: usize = 512;

const COOKIE: [u8; 8] = *b"conectix";
const FEATURES_RESERVED: u32 = 0x0000_0002;
const FILE_FORMAT_VERSION: u32 = 0x0001_0000;
const FIXED_DATA_OFFSET: u64 = u64::MAX;
const CREATOR_APPLICATION: [u8; 4] = *b"elem";
const CREATOR_HOST_OS: [u8; 4] = *b"suse";
const DISK_TYPE_FIXED: u32 = 2;

const CHECKSUM_OFFSET: usize = 64;

/// Largest addressable sector count, 65535 cylinders x 16 heads x 255 sectors.
const MAX_SECTORS: f64 = 65535.0 * 16.0 * 255.0;

/// Cylinder/head/sector geometry of a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

/// Geometry for `sectors` total 512-byte sectors, as computed by the VHD
/// format reference algorithm.
pub fn chs_calculation(sectors: u64) -> Geometry {
    let total = (sectors as f64).min(MAX_SECTORS);

    let mut sectors_per_track: f64;
    let mut heads: f64;
    let mut cylinder_times_heads: f64;

    if total >= 65535.0 * 16.0 * 63.0 {
        sectors_per_track = 255.0;
        heads = 16.0;
        cylinder_times_heads = (total / sectors_per_track).floor();
    } else {
        sectors_per_track = 17.0;
        cylinder_times_heads = (total / sectors_per_track).floor();
        heads = ((cylinder_times_heads + 1023.0) / 1024.0).floor().max(4.0);

        if cylinder_times_heads >= heads * 1024.0 || heads > 16.0 {
            sectors_per_track = 31.0;
            heads = 16.0;
            cylinder_times_heads = (total / sectors_per_track).floor();
        }
        if cylinder_times_heads >= heads * 1024.0 {
            sectors_per_track = 63.0;
            heads = 16.0;
            cylinder_times_heads = (total / sectors_per_track).floor();
        }
    }

    Geometry {
        cylinders: (cylinder_times_heads / heads) as u16,
        heads: heads as u8,
        sectors_per_track: sectors_per_track as u8,
    }
}

/// The 512-byte footer of a fixed VHD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdFooter {
    pub cookie: [u8; 8],
    pub features: u32,
    pub file_format_version: u32,
    pub data_offset: u64,
    /// Seconds since 2000-01-01 00:00:00 UTC.
    pub timestamp: u32,
    pub creator_application: [u8; 4],
    pub creator_version: u32,
    pub creator_host_os: [u8; 4],
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: Geometry,
    pub disk_type: u32,
    pub checksum: u32,
    pub unique_id: [u8; 16],
    pub saved_state: u8,
}

impl VhdFooter {
    /// Footer for a fixed disk of `size` bytes, stamped now with a fresh id.
    pub fn fixed(size: u64) -> Result<Self> {
        let timestamp = vhd_timestamp(OffsetDateTime::now_utc())?;
        Ok(Self::fixed_with(size, timestamp, *Uuid::new_v4().as_bytes()))
    }

    pub fn fixed_with(size: u64, timestamp: u32, unique_id: [u8; 16]) -> Self {
        let mut footer = Self {
            cookie: COOKIE,
            features: FEATURES_RESERVED,
            file_format_version: FILE_FORMAT_VERSION,
            data_offset: FIXED_DATA_OFFSET,
            timestamp,
            creator_application: CREATOR_APPLICATION,
            creator_version: 0,
            creator_host_os: CREATOR_HOST_OS,
            original_size: size,
            current_size: size,
            geometry: chs_calculation(size / 512),
            disk_type: DISK_TYPE_FIXED,
            checksum: 0,
            unique_id,
            saved_state: 0,
        };
        footer.checksum = footer.compute_checksum();
        footer
    }

    /// One's complement of the byte sum of the footer, checksum field zeroed.
    pub fn compute_checksum(&self) -> u32 {
        let mut bytes = self.to_bytes();
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
        !bytes.iter().fold(0u32, |sum, &b| sum.wrapping_add(u32::from(b)))
    }

    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(&self.cookie);
        buf[8..12].copy_from_slice(&self.features.to_be_bytes());
        buf[12..16].copy_from_slice(&self.file_format_version.to_be_bytes());
        buf[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[28..32].copy_from_slice(&self.creator_application);
        buf[32..36].copy_from_slice(&self.creator_version.to_be_bytes());
        buf[36..40].copy_from_slice(&self.creator_host_os);
        buf[40..48].copy_from_slice(&self.original_size.to_be_bytes());
        buf[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        buf[56..58].copy_from_slice(&self.geometry.cylinders.to_be_bytes());
        buf[58] = self.geometry.heads;
        buf[59] = self.geometry.sectors_per_track;
        buf[60..64].copy_from_slice(&self.disk_type.to_be_bytes());
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&self.checksum.to_be_bytes());
        buf[68..84].copy_from_slice(&self.unique_id);
        buf[84] = self.saved_state;
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != FOOTER_SIZE {
            bail!("VHD footer must be {} bytes, got {}", FOOTER_SIZE, buf.len());
        }
        let be32 = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let be64 = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_be_bytes(b)
        };
        let array4 = |at: usize| [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];

        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&buf[0..8]);
        let mut unique_id = [0u8; 16];
        unique_id.copy_from_slice(&buf[68..84]);

        Ok(Self {
            cookie,
            features: be32(8),
            file_format_version: be32(12),
            data_offset: be64(16),
            timestamp: be32(24),
            creator_application: array4(28),
            creator_version: be32(32),
            creator_host_os: array4(36),
            original_size: be64(40),
            current_size: be64(48),
            geometry: Geometry {
                cylinders: u16::from_be_bytes([buf[56], buf[57]]),
                heads: buf[58],
                sectors_per_track: buf[59],
            },
            disk_type: be32(60),
            checksum: be32(CHECKSUM_OFFSET),
            unique_id,
            saved_state: buf[84],
        })
    }
}

/// Seconds between the VHD epoch (2000-01-01 UTC) and `at`.
pub fn vhd_timestamp(at: OffsetDateTime) -> Result<u32> {
    let seconds = (at - datetime!(2000-01-01 0:00 UTC)).whole_seconds();
    u32::try_from(seconds).with_context(|| format!("{} is outside the VHD timestamp range", at))
}

/// Append a fixed VHD footer sized after the current length of `disk`.
/// The file must already hold the raw disk contents.
pub fn raw_disk_to_fixed_vhd(disk: &mut File) -> Result<()> {
    let size = disk.metadata().context("reading raw disk size")?.len();
    let footer = VhdFooter::fixed(size)?;
    tracing::debug!(
        size,
        cylinders = footer.geometry.cylinders,
        heads = footer.geometry.heads,
        sectors_per_track = footer.geometry.sectors_per_track,
        "writing fixed VHD footer"
    );

    disk.seek(SeekFrom::End(0))?;
    disk.write_all(&footer.to_bytes()).context("writing VHD footer")?;
    disk.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Read;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn vhd_of_size(size: u64) -> (TempDir, Vec<u8>) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("disk.raw");
        let file = File::create(&path).unwrap();
        file.set_len(size).unwrap();
        drop(file);

        let mut disk = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        raw_disk_to_fixed_vhd(&mut disk).unwrap();

        let mut contents = Vec::new();
        disk.seek(SeekFrom::Start(size)).unwrap();
        disk.read_to_end(&mut contents).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size + FOOTER_SIZE as u64);
        (temp, contents)
    }

    fn assert_self_consistent(bytes: &[u8]) {
        let stored = u32::from_be_bytes([bytes[64], bytes[65], bytes[66], bytes[67]]);
        let sum = bytes
            .iter()
            .enumerate()
            .filter(|(i, _)| !(CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4).contains(i))
            .fold(0u32, |sum, (_, &b)| sum.wrapping_add(u32::from(b)));
        assert_eq!(sum.wrapping_add(stored), u32::MAX);
    }

    #[test]
    fn test_reference_geometries() {
        let g = chs_calculation(MIB / 512);
        assert_eq!((g.cylinders, g.heads, g.sectors_per_track), (30, 4, 17));

        let g = chs_calculation(1024 * MIB / 512);
        assert_eq!((g.cylinders, g.heads, g.sectors_per_track), (2080, 16, 63));

        let g = chs_calculation(220 * MIB / 512);
        assert_eq!((g.cylinders, g.heads, g.sectors_per_track), (908, 16, 31));
    }

    #[test]
    fn test_geometry_is_capped() {
        let capped = Geometry {
            cylinders: 0xFFFF,
            heads: 16,
            sectors_per_track: 255,
        };
        assert_eq!(chs_calculation(500 * 1024 * MIB / 512), capped);
        assert_eq!(chs_calculation(65535 * 16 * 255), capped);
        assert_eq!(chs_calculation(u64::MAX), capped);
    }

    #[test]
    fn test_footer_fields() {
        let (_temp, bytes) = vhd_of_size(MIB);
        assert_eq!(bytes.len(), FOOTER_SIZE);

        let footer = VhdFooter::from_bytes(&bytes).unwrap();
        assert_eq!(&footer.cookie, b"conectix");
        assert_eq!(footer.features, 2);
        assert_eq!(footer.file_format_version, 0x0001_0000);
        assert_eq!(footer.data_offset, u64::MAX);
        assert_eq!(&footer.creator_application, b"elem");
        assert_eq!(&footer.creator_host_os, b"suse");
        assert_eq!(footer.original_size, MIB);
        assert_eq!(footer.current_size, MIB);
        assert_eq!(footer.disk_type, 2);
        assert_eq!(footer.geometry.heads, 4);
        assert_eq!(footer.geometry.sectors_per_track, 17);
        assert_eq!(footer.checksum, footer.compute_checksum());
        assert!(bytes[85..].iter().all(|&b| b == 0));
        assert_self_consistent(&bytes);
    }

    #[test]
    fn test_empty_file_gets_only_footer() {
        let (_temp, bytes) = vhd_of_size(0);
        assert_eq!(bytes.len(), FOOTER_SIZE);
        let footer = VhdFooter::from_bytes(&bytes).unwrap();
        assert_eq!(footer.current_size, 0);
        assert_self_consistent(&bytes);
    }

    #[test]
    fn test_large_sparse_disk() {
        let (_temp, bytes) = vhd_of_size(500 * 1024 * MIB);
        let footer = VhdFooter::from_bytes(&bytes).unwrap();
        assert_eq!(footer.geometry.cylinders, 0xFFFF);
        assert_eq!(footer.geometry.heads, 16);
        assert_eq!(footer.geometry.sectors_per_track, 255);
        assert_self_consistent(&bytes);
    }

    #[test]
    fn test_timestamp_epoch() {
        assert_eq!(vhd_timestamp(datetime!(2000-01-01 0:00 UTC)).unwrap(), 0);
        assert_eq!(vhd_timestamp(datetime!(2000-01-02 0:00 UTC)).unwrap(), 86400);
        assert!(vhd_timestamp(datetime!(1999-12-31 23:59 UTC)).is_err());
    }

    #[test]
    fn test_unique_ids_differ() {
        let a = VhdFooter::fixed(MIB).unwrap();
        let b = VhdFooter::fixed(MIB).unwrap();
        assert_ne!(a.unique_id, b.unique_id);
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(VhdFooter::from_bytes(&[0u8; 100]).is_err());
    }

    proptest! {
        #[test]
        fn checksum_is_self_consistent(size in any::<u64>(), timestamp in any::<u32>(), id in any::<[u8; 16]>()) {
            let footer = VhdFooter::fixed_with(size, timestamp, id);
            let bytes = footer.to_bytes();
            let stored = u32::from_be_bytes([bytes[64], bytes[65], bytes[66], bytes[67]]);
            let sum = bytes[..64]
                .iter()
                .chain(&bytes[68..])
                .fold(0u32, |sum, &b| sum.wrapping_add(u32::from(b)));
            prop_assert_eq!(sum.wrapping_add(stored), u32::MAX);
            prop_assert_eq!(VhdFooter::from_bytes(&bytes).unwrap(), footer);
        }
    }
}
