//! `EFI_LOAD_OPTION` codec.
//!
//! Layout, all integers little endian:
//!
//! ```text
//! u32     attributes
//! u16     length of the device path list in bytes
//! [u16]   description, UCS-2, NUL terminated
//! [u8]    device path list, terminated by an end-of-entire-path node
//! [u8]    optional data, up to the end of the variable
//! ```
//!
//! Only the nodes boot entries are built from (hard drive and file path)
//! are decoded; everything else is kept as raw bytes so foreign entries
//! survive a decode/encode cycle unchanged.

use anyhow::{bail, ensure, Result};
use std::fmt;
use uuid::Uuid;

const NODE_HEADER_LEN: usize = 4;

const MEDIA_DEVICE_PATH: u8 = 0x04;
const MEDIA_HARD_DRIVE: u8 = 0x01;
const MEDIA_FILE_PATH: u8 = 0x04;
const END_DEVICE_PATH: u8 = 0x7f;
const END_ENTIRE_DEVICE_PATH: u8 = 0xff;

const HARD_DRIVE_NODE_LEN: usize = 42;

/// Partition format values of the hard drive node.
pub const PARTITION_FORMAT_MBR: u8 = 0x01;
pub const PARTITION_FORMAT_GPT: u8 = 0x02;

/// Signature type values of the hard drive node.
pub const SIGNATURE_TYPE_MBR: u8 = 0x01;
pub const SIGNATURE_TYPE_GUID: u8 = 0x02;

/// Encode `s` as little endian UCS-2, without terminator.
pub fn ucs2_encode(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Decode a NUL terminated UCS-2 string at the start of `bytes`. Returns
/// the string and the number of bytes consumed, terminator included.
pub fn ucs2_decode_terminated(bytes: &[u8]) -> Result<(String, usize)> {
    let mut units = Vec::new();
    for chunk in bytes.chunks_exact(2) {
        let unit = u16::from_le_bytes([chunk[0], chunk[1]]);
        if unit == 0 {
            let consumed = (units.len() + 1) * 2;
            return Ok((String::from_utf16_lossy(&units), consumed));
        }
        units.push(unit);
    }
    bail!("unterminated UCS-2 string")
}

/// Media hard drive node: the partition an entry's file lives on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardDriveNode {
    pub partition_number: u32,
    pub partition_start: u64,
    pub partition_size: u64,
    pub signature: [u8; 16],
    pub partition_format: u8,
    pub signature_type: u8,
}

impl HardDriveNode {
    /// Node for a GPT partition identified by its PARTUUID. Start and size
    /// are in logical blocks.
    pub fn gpt(partition_number: u32, start: u64, size: u64, part_uuid: Uuid) -> Self {
        Self {
            partition_number,
            partition_start: start,
            partition_size: size,
            signature: part_uuid.to_bytes_le(),
            partition_format: PARTITION_FORMAT_GPT,
            signature_type: SIGNATURE_TYPE_GUID,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.partition_number.to_le_bytes());
        out.extend_from_slice(&self.partition_start.to_le_bytes());
        out.extend_from_slice(&self.partition_size.to_le_bytes());
        out.extend_from_slice(&self.signature);
        out.push(self.partition_format);
        out.push(self.signature_type);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() == HARD_DRIVE_NODE_LEN - NODE_HEADER_LEN,
            "invalid hard drive node length {}",
            data.len() + NODE_HEADER_LEN
        );
        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(buf)
        };
        let mut signature = [0u8; 16];
        signature.copy_from_slice(&data[20..36]);
        Ok(Self {
            partition_number: u32_at(0),
            partition_start: u64_at(4),
            partition_size: u64_at(12),
            signature,
            partition_format: data[36],
            signature_type: data[37],
        })
    }
}

impl fmt::Display for HardDriveNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.partition_format, self.signature_type) {
            (PARTITION_FORMAT_GPT, SIGNATURE_TYPE_GUID) => write!(
                f,
                "HD({},GPT,{},{:#x},{:#x})",
                self.partition_number,
                Uuid::from_bytes_le(self.signature),
                self.partition_start,
                self.partition_size
            ),
            _ => write!(
                f,
                "HD({},MBR,{:#010x},{:#x},{:#x})",
                self.partition_number,
                u32::from_le_bytes([
                    self.signature[0],
                    self.signature[1],
                    self.signature[2],
                    self.signature[3]
                ]),
                self.partition_start,
                self.partition_size
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePathNode {
    HardDrive(HardDriveNode),
    /// Path relative to the partition root, `\` separated.
    FilePath(String),
    /// Any node type not decoded above.
    Raw { kind: u8, sub_kind: u8, data: Vec<u8> },
}

impl DevicePathNode {
    /// File path node for a `/` separated path. The path is made absolute
    /// and converted to firmware separators.
    pub fn file_path(path: &str) -> Self {
        let converted = path.replace('/', "\\");
        if converted.starts_with('\\') {
            DevicePathNode::FilePath(converted)
        } else {
            DevicePathNode::FilePath(format!("\\{}", converted))
        }
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let (kind, sub_kind, data) = match self {
            DevicePathNode::HardDrive(hd) => {
                let mut data = Vec::with_capacity(HARD_DRIVE_NODE_LEN - NODE_HEADER_LEN);
                hd.encode(&mut data);
                (MEDIA_DEVICE_PATH, MEDIA_HARD_DRIVE, data)
            }
            DevicePathNode::FilePath(path) => {
                let mut data = ucs2_encode(path);
                data.extend_from_slice(&[0, 0]);
                (MEDIA_DEVICE_PATH, MEDIA_FILE_PATH, data)
            }
            DevicePathNode::Raw {
                kind,
                sub_kind,
                data,
            } => (*kind, *sub_kind, data.clone()),
        };
        let len = u16::try_from(data.len() + NODE_HEADER_LEN)
            .map_err(|_| anyhow::anyhow!("device path node too large ({} bytes)", data.len()))?;
        out.push(kind);
        out.push(sub_kind);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&data);
        Ok(())
    }
}

impl fmt::Display for DevicePathNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePathNode::HardDrive(hd) => write!(f, "{}", hd),
            DevicePathNode::FilePath(path) => f.write_str(path),
            DevicePathNode::Raw { kind, sub_kind, .. } => {
                write!(f, "Path({:#04x},{:#04x})", kind, sub_kind)
            }
        }
    }
}

/// Sequence of device path nodes, without the end node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePath(pub Vec<DevicePathNode>);

impl DevicePath {
    pub fn nodes(&self) -> &[DevicePathNode] {
        &self.0
    }

    /// Encode the nodes followed by the end-of-entire-path node.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for node in &self.0 {
            node.encode(&mut out)?;
        }
        out.extend_from_slice(&[END_DEVICE_PATH, END_ENTIRE_DEVICE_PATH, 4, 0]);
        Ok(out)
    }

    /// Decode a device path up to its end-of-entire-path node.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut nodes = Vec::new();
        let mut rest = bytes;
        loop {
            ensure!(rest.len() >= NODE_HEADER_LEN, "truncated device path node");
            let kind = rest[0];
            let sub_kind = rest[1];
            let len = u16::from_le_bytes([rest[2], rest[3]]) as usize;
            ensure!(len >= NODE_HEADER_LEN, "invalid device path node length {}", len);
            ensure!(
                len <= rest.len(),
                "invalid device path node length {} ({} bytes left)",
                len,
                rest.len()
            );
            let data = &rest[NODE_HEADER_LEN..len];

            match (kind, sub_kind) {
                (END_DEVICE_PATH, END_ENTIRE_DEVICE_PATH) => return Ok(DevicePath(nodes)),
                (MEDIA_DEVICE_PATH, MEDIA_HARD_DRIVE) => {
                    nodes.push(DevicePathNode::HardDrive(HardDriveNode::decode(data)?))
                }
                (MEDIA_DEVICE_PATH, MEDIA_FILE_PATH) => {
                    let (path, _) = ucs2_decode_terminated(data)?;
                    nodes.push(DevicePathNode::FilePath(path));
                }
                _ => nodes.push(DevicePathNode::Raw {
                    kind,
                    sub_kind,
                    data: data.to_vec(),
                }),
            }
            rest = &rest[len..];
        }
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.0.iter().enumerate() {
            let is_file = matches!(node, DevicePathNode::FilePath(_));
            if i > 0 && !is_file {
                f.write_str("/")?;
            }
            write!(f, "{}", node)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOption {
    pub attributes: u32,
    pub description: String,
    pub file_path: DevicePath,
    pub optional_data: Vec<u8>,
}

impl LoadOption {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let path = self.file_path.to_bytes()?;
        let path_len = u16::try_from(path.len())
            .map_err(|_| anyhow::anyhow!("device path too large ({} bytes)", path.len()))?;

        let mut out = Vec::with_capacity(6 + path.len() + self.optional_data.len());
        out.extend_from_slice(&self.attributes.to_le_bytes());
        out.extend_from_slice(&path_len.to_le_bytes());
        out.extend_from_slice(&ucs2_encode(&self.description));
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&path);
        out.extend_from_slice(&self.optional_data);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() >= 6, "load option too short ({} bytes)", bytes.len());
        let attributes = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let path_len = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;

        let (description, consumed) = ucs2_decode_terminated(&bytes[6..])?;
        let path_start = 6 + consumed;
        let path_end = path_start + path_len;
        ensure!(
            path_end <= bytes.len(),
            "device path list length {} exceeds load option",
            path_len
        );
        let file_path = DevicePath::from_bytes(&bytes[path_start..path_end])?;

        Ok(Self {
            attributes,
            description,
            file_path,
            optional_data: bytes[path_end..].to_vec(),
        })
    }
}

impl fmt::Display for LoadOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EFI_LOAD_OPTION{{ Attributes: {}, Description: {:?}, FilePath: {}, OptionalData: {} bytes }}",
            self.attributes,
            self.description,
            self.file_path,
            self.optional_data.len()
        )
    }
}
