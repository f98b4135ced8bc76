//! EFI boot entry support.
//!
//! [`load_option`] encodes and decodes `EFI_LOAD_OPTION` payloads,
//! [`variables`] provides the NVRAM stores (efivarfs on a real host, an
//! in-memory map for tests) and [`manager`] implements boot entry
//! allocation and `BootOrder` updates on top of any store.

pub mod load_option;
pub mod manager;
pub mod variables;

use std::fmt;
use std::ops::BitOr;
use uuid::Uuid;

pub use load_option::{DevicePath, DevicePathNode, HardDriveNode, LoadOption};
pub use manager::{BootEntry, BootEntryVariable, BootManager};
pub use variables::{EfiVarFs, MemoryVariables, VariableError, Variables};

/// Vendor GUID of the architecturally defined global variables
/// (`BootOrder`, `BootXXXX`, ...).
pub const GLOBAL_VARIABLE: Uuid = Uuid::from_u128(0x8be4df61_93ca_11d0_aa2b_00a0c90e6c34);

/// `LOAD_OPTION_ACTIVE`
pub const LOAD_OPTION_ACTIVE: u32 = 0x0000_0001;

/// EFI variable attribute bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Attributes(pub u32);

impl Attributes {
    pub const NON_VOLATILE: Attributes = Attributes(0x0000_0001);
    pub const BOOTSERVICE_ACCESS: Attributes = Attributes(0x0000_0002);
    pub const RUNTIME_ACCESS: Attributes = Attributes(0x0000_0004);

    /// Attributes every boot variable is written with.
    pub const BOOT_VARIABLE: Attributes =
        Attributes(Self::NON_VOLATILE.0 | Self::BOOTSERVICE_ACCESS.0 | Self::RUNTIME_ACCESS.0);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Attributes) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Attributes {
    type Output = Attributes;

    fn bitor(self, rhs: Attributes) -> Attributes {
        Attributes(self.0 | rhs.0)
    }
}

/// Name and vendor GUID identifying one variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableDescriptor {
    pub name: String,
    pub guid: Uuid,
}

impl VariableDescriptor {
    pub fn new(name: impl Into<String>, guid: Uuid) -> Self {
        Self {
            name: name.into(),
            guid,
        }
    }

    /// Global variable `name`.
    pub fn global(name: impl Into<String>) -> Self {
        Self::new(name, GLOBAL_VARIABLE)
    }
}

impl fmt::Display for VariableDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.guid)
    }
}
