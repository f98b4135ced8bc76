//! Boot entry management on top of a [`Variables`] store.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

use super::load_option::{ucs2_encode, LoadOption};
use super::variables::{variable_names, Variables};
use super::{Attributes, GLOBAL_VARIABLE, LOAD_OPTION_ACTIVE};

const BOOT_ORDER: &str = "BootOrder";

/// Number of `BootXXXX` slots handed out.
const MAX_BOOT_ENTRIES: u16 = u16::MAX;

/// Parse `BootXXXX` (four hex digits) into its entry number.
pub fn parse_boot_number(name: &str) -> Option<u16> {
    let digits = name.strip_prefix("Boot")?;
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

pub fn boot_variable_name(number: u16) -> String {
    format!("Boot{:04X}", number)
}

/// One `BootXXXX` variable that decoded as a load option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntryVariable {
    pub boot_number: u16,
    pub data: Vec<u8>,
    pub attributes: Attributes,
    pub load_option: LoadOption,
}

/// Boot entry to create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootEntry {
    /// File name of the EFI binary, relative to the directory passed to
    /// [`BootManager::find_or_create_entry`].
    pub filename: String,
    /// Description shown by the firmware boot menu.
    pub label: String,
    /// Load options passed to the binary.
    pub options: String,
    pub description: String,
}

/// Snapshot of the boot entries and `BootOrder` of a variable store.
pub struct BootManager<'a> {
    vars: &'a dyn Variables,
    entries: BTreeMap<u16, BootEntryVariable>,
    boot_order: Vec<u16>,
    boot_order_attrs: Attributes,
}

impl<'a> BootManager<'a> {
    /// Load the current entries. Variables that do not decode as load
    /// options are left out; a missing `BootOrder` counts as empty.
    pub fn new(vars: &'a dyn Variables) -> Result<Self> {
        if vars.list_variables().is_err() {
            bail!("variables not supported");
        }

        let (order_bytes, boot_order_attrs) = vars
            .get_variable(&GLOBAL_VARIABLE, BOOT_ORDER)
            .unwrap_or_else(|_| (Vec::new(), Attributes::BOOT_VARIABLE));
        let boot_order = order_bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        let names = variable_names(vars, &GLOBAL_VARIABLE)
            .context("cannot obtain list of global variables")?;
        let mut entries = BTreeMap::new();
        for name in names {
            let Some(boot_number) = parse_boot_number(&name) else {
                continue;
            };
            let (data, attributes) = vars
                .get_variable(&GLOBAL_VARIABLE, &name)
                .with_context(|| format!("cannot read {}", name))?;
            let load_option = match LoadOption::from_bytes(&data) {
                Ok(option) => option,
                Err(e) => {
                    tracing::debug!("Skipping {}: {:#}", name, e);
                    continue;
                }
            };
            entries.insert(
                boot_number,
                BootEntryVariable {
                    boot_number,
                    data,
                    attributes,
                    load_option,
                },
            );
        }

        Ok(Self {
            vars,
            entries,
            boot_order,
            boot_order_attrs,
        })
    }

    pub fn entries(&self) -> &BTreeMap<u16, BootEntryVariable> {
        &self.entries
    }

    pub fn boot_order(&self) -> &[u16] {
        &self.boot_order
    }

    /// Lowest unused entry number.
    pub fn next_free_entry(&self) -> Result<u16> {
        (0..MAX_BOOT_ENTRIES)
            .find(|n| !self.entries.contains_key(n))
            .ok_or_else(|| anyhow!("maximum number of boot entries exceeded"))
    }

    /// Number of the entry booting `entry.filename` under `relative_to`.
    ///
    /// An existing entry is reused only when its encoded load option and
    /// attributes are identical to the one that would be written, so an
    /// entry for the same file on a recreated partition gets a new slot.
    pub fn find_or_create_entry(&mut self, entry: &BootEntry, relative_to: &Path) -> Result<u16> {
        let boot_next = self.next_free_entry()?;
        let file_path = self
            .vars
            .new_file_device_path(&relative_to.join(&entry.filename))?;

        let load_option = LoadOption {
            attributes: LOAD_OPTION_ACTIVE,
            description: entry.label.clone(),
            file_path,
            optional_data: ucs2_encode(&format!("{}\0", entry.options)),
        };
        let data = load_option.to_bytes().context("cannot encode load option")?;
        let attributes = Attributes::BOOT_VARIABLE;

        if let Some(existing) = self
            .entries
            .values()
            .find(|e| e.data == data && e.attributes == attributes)
        {
            tracing::debug!("Reusing boot entry {}", boot_variable_name(existing.boot_number));
            return Ok(existing.boot_number);
        }

        let name = boot_variable_name(boot_next);
        tracing::debug!("Writing {}: {}", name, load_option);
        self.vars
            .set_variable(&GLOBAL_VARIABLE, &name, &data, attributes)?;
        self.entries.insert(
            boot_next,
            BootEntryVariable {
                boot_number: boot_next,
                data,
                attributes,
                load_option,
            },
        );
        Ok(boot_next)
    }

    /// Put `head` in front of the current boot order and commit it.
    /// Duplicates and numbers without an entry are dropped.
    pub fn prepend_and_set_boot_order(&mut self, head: &[u16]) -> Result<()> {
        let mut order: Vec<u16> = Vec::new();
        for &num in head.iter().chain(self.boot_order.iter()) {
            if self.entries.contains_key(&num) && !order.contains(&num) {
                order.push(num);
            }
        }

        let bytes: Vec<u8> = order.iter().flat_map(|n| n.to_le_bytes()).collect();
        self.vars
            .set_variable(&GLOBAL_VARIABLE, BOOT_ORDER, &bytes, self.boot_order_attrs)?;
        self.boot_order = order;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::efi::variables::MemoryVariables;
    use crate::efi::VariableDescriptor;
    use uuid::Uuid;

    struct Unsupported;

    impl Variables for Unsupported {
        fn list_variables(&self) -> Result<Vec<VariableDescriptor>> {
            bail!("efivarfs not mounted")
        }
        fn get_variable(&self, _: &Uuid, name: &str) -> Result<(Vec<u8>, Attributes)> {
            bail!("no {}", name)
        }
        fn set_variable(&self, _: &Uuid, _: &str, _: &[u8], _: Attributes) -> Result<()> {
            Ok(())
        }
        fn new_file_device_path(&self, _: &Path) -> Result<crate::efi::DevicePath> {
            bail!("unsupported")
        }
    }

    fn shim() -> BootEntry {
        BootEntry {
            filename: "shimx64.efi".into(),
            label: "elemental-shim".into(),
            description: "elemental-shim".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_boot_number() {
        assert_eq!(parse_boot_number("Boot0000"), Some(0));
        assert_eq!(parse_boot_number("Boot00aF"), Some(0xaf));
        assert_eq!(parse_boot_number("BootOrder"), None);
        assert_eq!(parse_boot_number("Boot00001"), None);
        assert_eq!(boot_variable_name(0xab), "Boot00AB");
    }

    #[test]
    fn test_new_requires_variable_support() {
        let err = BootManager::new(&Unsupported).err().unwrap();
        assert_eq!(err.to_string(), "variables not supported");
    }

    #[test]
    fn test_unparsable_entries_are_skipped() {
        let vars = MemoryVariables::new();
        vars.set_variable(&GLOBAL_VARIABLE, "BootOrder", b"0001", Attributes::NON_VOLATILE)
            .unwrap();
        vars.set_variable(&GLOBAL_VARIABLE, "Boot0001", b"test.efi", Attributes::NON_VOLATILE)
            .unwrap();
        let manager = BootManager::new(&vars).unwrap();
        assert!(manager.entries().is_empty());
        assert_eq!(manager.next_free_entry().unwrap(), 0);
    }

    #[test]
    fn test_find_or_create_is_idempotent() {
        let vars = MemoryVariables::new();
        let relative = Path::new("/EFI/elemental");

        let mut manager = BootManager::new(&vars).unwrap();
        let first = manager.find_or_create_entry(&shim(), relative).unwrap();
        assert_eq!(first, 0);

        let mut manager = BootManager::new(&vars).unwrap();
        let second = manager.find_or_create_entry(&shim(), relative).unwrap();
        assert_eq!(second, first);
        assert_eq!(manager.entries().len(), 1);

        let other = manager
            .find_or_create_entry(&shim(), Path::new("/EFI/other"))
            .unwrap();
        assert_eq!(other, 1);
        assert_eq!(manager.entries().len(), 2);
    }

    #[test]
    fn test_created_entry_decodes() {
        let vars = MemoryVariables::new();
        let mut manager = BootManager::new(&vars).unwrap();
        let n = manager
            .find_or_create_entry(&shim(), Path::new("/EFI/elemental"))
            .unwrap();

        let (data, attrs) = vars
            .get_variable(&GLOBAL_VARIABLE, &boot_variable_name(n))
            .unwrap();
        assert_eq!(attrs, Attributes::BOOT_VARIABLE);
        let option = LoadOption::from_bytes(&data).unwrap();
        assert_eq!(option.description, "elemental-shim");
        assert_eq!(option.attributes, LOAD_OPTION_ACTIVE);
        assert_eq!(option.file_path.to_string(), "\\EFI\\elemental\\shimx64.efi");
        assert_eq!(option.optional_data, vec![0, 0]);
    }

    #[test]
    fn test_prepend_dedupes_and_drops_missing() {
        let vars = MemoryVariables::new();
        let mut manager = BootManager::new(&vars).unwrap();
        let a = manager
            .find_or_create_entry(&shim(), Path::new("/EFI/a"))
            .unwrap();
        let b = manager
            .find_or_create_entry(&shim(), Path::new("/EFI/b"))
            .unwrap();
        // 7 has no entry
        manager.boot_order = vec![a, 7, b];

        manager.prepend_and_set_boot_order(&[b]).unwrap();
        assert_eq!(manager.boot_order(), &[b, a]);
        let (bytes, attrs) = vars.get_variable(&GLOBAL_VARIABLE, "BootOrder").unwrap();
        assert_eq!(bytes, vec![1, 0, 0, 0]);
        assert_eq!(attrs, Attributes::BOOT_VARIABLE);
    }

    #[test]
    fn test_boot_order_keeps_existing_attributes() {
        let vars = MemoryVariables::new();
        vars.set_variable(&GLOBAL_VARIABLE, "BootOrder", &[0, 0], Attributes::NON_VOLATILE)
            .unwrap();
        let mut manager = BootManager::new(&vars).unwrap();
        assert_eq!(manager.boot_order(), &[0]);
        let n = manager
            .find_or_create_entry(&shim(), Path::new("/EFI/elemental"))
            .unwrap();
        manager.prepend_and_set_boot_order(&[n]).unwrap();
        let (_, attrs) = vars.get_variable(&GLOBAL_VARIABLE, "BootOrder").unwrap();
        assert_eq!(attrs, Attributes::NON_VOLATILE);
    }
}
