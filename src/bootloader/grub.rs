//! GRUB installation for BIOS and EFI targets.
//!
//! BIOS installs shell out to `grub2-install`. EFI installs never run the
//! grub installer: the signed shim, MOK manager and grub binaries shipped
//! in the source tree are copied to the EFI partition together with a
//! small `grub.cfg` that chainloads the real configuration from the state
//! partition.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::system::{identify_source_system, os_release_entry};
use crate::config::{Arch, Config};
use crate::constants::{
    BOOT_ENTRY_NAME, DEFAULT_TTY, EFI_DIR, EFI_IMG_ARM64, EFI_IMG_X86, ENTRY_EFI_PATH,
    FALLBACK_EFI_PATH, FILE_PERM, GRUB_CFG, GRUB_CONF, GRUB_DIR, GRUB_EDITENV, GRUB_EDITENV_FALLBACK,
    GRUB_EFI_MODULES, GRUB_ENTRY_NAME_KEY, GRUB_INSTALL, GRUB_OEM_ENV, STATE_LABEL,
};
use crate::efi::{BootEntry, BootManager, EfiVarFs, LoadOption, Variables};
use crate::fs::{self, find_files_by_name, mkdir_all};
use crate::settings::InstallSettings;

/// Join `path` under `base` even when `path` is absolute.
fn join_under(base: &Path, path: &Path) -> PathBuf {
    base.join(path.strip_prefix("/").unwrap_or(path))
}

/// Config placed next to the shim that hands over to the grub.cfg on the
/// partition labelled `label`.
pub fn chainload_config(label: &str) -> String {
    format!(
        "search --no-floppy --label --set=root {}\nset prefix=($root)/{dir}\nconfigfile ($root)/{dir}/{cfg}",
        label,
        dir = GRUB_DIR,
        cfg = GRUB_CFG
    )
}

/// Parameters of a full bootloader install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrubInstall {
    /// Device grub2-install writes the BIOS boot code to.
    pub target: String,
    /// Tree holding the grub.cfg, modules and EFI binaries to install.
    pub root_dir: PathBuf,
    /// Boot directory on the state partition.
    pub boot_dir: PathBuf,
    /// grub.cfg location inside `root_dir`.
    pub grub_conf: PathBuf,
    /// Extra console to enable. Empty means the current tty.
    pub tty: String,
    pub efi: bool,
    /// Label the EFI grub.cfg searches for.
    pub state_label: String,
    pub disable_boot_entry: bool,
    pub clear_boot_entries: bool,
}

impl Default for GrubInstall {
    fn default() -> Self {
        Self {
            target: String::new(),
            root_dir: PathBuf::from("/"),
            boot_dir: PathBuf::from("/boot"),
            grub_conf: PathBuf::from(GRUB_CONF),
            tty: String::new(),
            efi: false,
            state_label: STATE_LABEL.to_string(),
            disable_boot_entry: false,
            clear_boot_entries: false,
        }
    }
}

pub struct Grub {
    config: Config,
    efi_dir: PathBuf,
    variables: Arc<dyn Variables>,
}

impl Grub {
    /// Installer writing to the EFI partition mounted at the default
    /// location and to the host's EFI variables.
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            efi_dir: PathBuf::from(EFI_DIR),
            variables: Arc::new(EfiVarFs::new(config.fs.clone(), config.runner.clone())),
        }
    }

    pub fn with_efi_dir(mut self, efi_dir: impl Into<PathBuf>) -> Self {
        self.efi_dir = efi_dir.into();
        self
    }

    pub fn with_variables(mut self, variables: Arc<dyn Variables>) -> Self {
        self.variables = variables;
        self
    }

    fn arch(&self) -> Arch {
        self.config.platform.arch
    }

    fn efi_module_dir(&self, boot_dir: &Path) -> PathBuf {
        boot_dir.join(GRUB_DIR).join(format!("{}-efi", self.arch()))
    }

    /// Install the bootloader. Any failing step aborts the install.
    pub fn install(&self, opts: &GrubInstall) -> Result<()> {
        if opts.efi {
            let shim = self.install_efi(&opts.root_dir, &opts.boot_dir, &self.efi_dir, &opts.state_label)?;
            if !opts.disable_boot_entry {
                self.do_efi_entries(&shim, &self.efi_dir, opts.clear_boot_entries)?;
            }
        } else {
            self.install_bios(&opts.target, &opts.root_dir, &opts.boot_dir)?;
        }
        self.install_config(&opts.root_dir, &opts.boot_dir, &opts.grub_conf, &opts.tty)
    }

    /// Install with the `[bootloader]` section of a settings file.
    pub fn install_with_settings(&self, settings: &InstallSettings) -> Result<()> {
        let opts = &settings.bootloader;
        tracing::info!(
            "Installing bootloader from {} (efi: {})",
            opts.root_dir.display(),
            opts.efi
        );
        self.install(opts)
    }

    /// Run grub2-install for a legacy BIOS target.
    pub fn install_bios(&self, target: &str, root_dir: &Path, boot_dir: &Path) -> Result<()> {
        tracing::info!("Installing GRUB..");
        let root = self.config.fs.raw_path(root_dir);
        let boot = self.config.fs.raw_path(boot_dir);
        let args = [
            format!("--root-directory={}", root.display()),
            format!("--boot-directory={}", boot.display()),
            "--target=i386-pc".to_string(),
            target.to_string(),
        ];
        tracing::debug!("Running grub with the following args: {:?}", args);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        if let Err(e) = self.config.runner.run(GRUB_INSTALL, &args) {
            tracing::error!("{:#}", e);
            return Err(e).with_context(|| format!("{} failed for {}", GRUB_INSTALL, target));
        }
        tracing::info!("Grub install to device {} complete", target);
        Ok(())
    }

    fn current_tty(&self) -> String {
        match self.config.runner.run("tty", &[]) {
            Ok(out) => String::from_utf8_lossy(&out)
                .trim()
                .trim_start_matches("/dev/")
                .to_string(),
            Err(_) => {
                tracing::warn!("failed to find current tty, leaving it unset");
                String::new()
            }
        }
    }

    /// Copy the tree's grub.cfg to the boot directory, adding `tty` as an
    /// extra console when it exists and is not the default one.
    pub fn install_config(&self, root_dir: &Path, boot_dir: &Path, grub_conf: &Path, tty: &str) -> Result<()> {
        let source = join_under(root_dir, grub_conf);
        tracing::info!("Using grub config dir {}", source.display());
        let grub_cfg = match self.config.fs.read_to_string(&source) {
            Ok(content) => content,
            Err(e) => {
                tracing::error!("Failed reading grub config file: {}", source.display());
                return Err(e).with_context(|| format!("Failed reading grub config file {}", source.display()));
            }
        };

        mkdir_all(self.config.fs.as_ref(), &self.efi_module_dir(boot_dir)).context("error creating grub dir")?;

        let tty = if tty.is_empty() {
            self.current_tty()
        } else {
            tty.to_string()
        };
        let tty_exists = !tty.is_empty()
            && fs::exists(self.config.fs.as_ref(), &Path::new("/dev").join(&tty)).unwrap_or(false);

        let content = if tty_exists && tty != "console" && tty != DEFAULT_TTY {
            tracing::info!("Adding extra tty ({}) to grub.cfg", tty);
            let default_console = format!("console={}", DEFAULT_TTY);
            grub_cfg.replace(&default_console, &format!("{} console={}", default_console, tty))
        } else {
            grub_cfg
        };

        let target = boot_dir.join(GRUB_DIR).join(GRUB_CFG);
        tracing::info!("Copying grub contents from {} to {}", source.display(), target.display());
        if let Err(e) = self.config.fs.write(&target, content.as_bytes(), FILE_PERM) {
            tracing::error!("Failed writing {}: {}", target.display(), e);
            return Err(e).with_context(|| format!("Failed writing {}", target.display()));
        }
        Ok(())
    }

    /// Copy the EFI grub modules required to boot squashed images.
    fn copy_efi_modules(&self, root_dir: &Path, boot_dir: &Path) -> Result<()> {
        let fs = self.config.fs.as_ref();
        let module_dir = self.efi_module_dir(boot_dir);
        mkdir_all(fs, &module_dir).context("error creating grub dir")?;

        let arch = self.arch().grub_name();
        for module in GRUB_EFI_MODULES {
            let found: Vec<PathBuf> = find_files_by_name(fs, root_dir, module)?
                .into_iter()
                .filter(|p| p.to_string_lossy().contains(arch))
                .collect();
            if found.is_empty() {
                bail!("did not find grub modules under {}", root_dir.display());
            }
            for path in found {
                let dest = module_dir.join(module);
                tracing::debug!("Copying {} to {}", path.display(), dest.display());
                let content = fs
                    .read(&path)
                    .with_context(|| format!("error reading {}", path.display()))?;
                fs.write(&dest, &content, FILE_PERM)
                    .with_context(|| format!("error writing {}", dest.display()))?;
            }
        }
        Ok(())
    }

    /// Populate the EFI partition mounted at `efi_dir` and return the
    /// name of the shim boot entries should point at.
    pub fn install_efi(&self, root_dir: &Path, boot_dir: &Path, efi_dir: &Path, device_label: &str) -> Result<String> {
        let fs = self.config.fs.as_ref();
        tracing::info!("Generating grub files for efi on {}", efi_dir.display());
        self.copy_efi_modules(root_dir, boot_dir)?;

        let fallback_dir = join_under(efi_dir, Path::new(FALLBACK_EFI_PATH));
        let entry_dir = join_under(efi_dir, Path::new(ENTRY_EFI_PATH));
        for dir in [&fallback_dir, &entry_dir] {
            if let Err(e) = mkdir_all(fs, dir) {
                tracing::error!("Error creating dirs: {:#}", e);
                return Err(e);
            }
        }

        let system = identify_source_system(fs, root_dir)?;
        tracing::info!("Identified source system as {}", system);
        let shim = system.shim_files(self.arch());

        for name in shim.files {
            let Some(source) = find_files_by_name(fs, root_dir, name)?.into_iter().next() else {
                bail!("did not find efi artifacts under {}", root_dir.display());
            };
            let content = fs
                .read(&source)
                .with_context(|| format!("error reading {}", source.display()))?;
            for dir in [&fallback_dir, &entry_dir] {
                let dest = dir.join(name);
                tracing::debug!("Copying {} to {}", source.display(), dest.display());
                fs.write(&dest, &content, FILE_PERM)
                    .with_context(|| format!("error writing {}", dest.display()))?;
            }
        }

        // firmware without boot entries only looks for the well known name
        let boot_image = match self.arch() {
            Arch::Arm64 => EFI_IMG_ARM64,
            Arch::X86_64 => EFI_IMG_X86,
        };
        let shim_content = fs
            .read(&fallback_dir.join(shim.shim))
            .with_context(|| format!("could not read shim file {} at dir {}", shim.shim, fallback_dir.display()))?;
        fs.write(&fallback_dir.join(boot_image), &shim_content, FILE_PERM)
            .with_context(|| format!("could not write shim file {} at dir {}", boot_image, fallback_dir.display()))?;

        let grub_cfg = chainload_config(device_label);
        for dir in [&fallback_dir, &entry_dir] {
            let dest = dir.join(GRUB_CFG);
            fs.write(&dest, grub_cfg.as_bytes(), FILE_PERM)
                .with_context(|| format!("error writing {}", dest.display()))?;
        }

        Ok(shim.shim.to_string())
    }

    /// Refresh the NVRAM entry for `shim_name` on the EFI partition at
    /// `efi_dir`, optionally removing stale entries first.
    pub fn do_efi_entries(&self, shim_name: &str, efi_dir: &Path, clear_boot_entries: bool) -> Result<()> {
        let vars = self.variables.as_ref();
        if clear_boot_entries {
            self.clear_boot_entry(vars)?;
        }
        self.create_boot_entry(shim_name, &join_under(efi_dir, Path::new(ENTRY_EFI_PATH)), vars)
    }

    /// Delete every `BootXXXX` entry described as ours. Entries that do not
    /// decode are someone else's and are left alone.
    ///
    /// Partitions are recreated on install, so old entries would point at
    /// a partition UUID that no longer exists.
    pub fn clear_boot_entry(&self, vars: &dyn Variables) -> Result<()> {
        let boot_var = Regex::new("Boot[0-9a-fA-F]{4}")?;
        let descriptors = match vars.list_variables() {
            Ok(descriptors) => descriptors,
            Err(e) => {
                tracing::warn!("cannot list EFI variables, no entries cleared: {:#}", e);
                return Ok(());
            }
        };
        for desc in descriptors.iter().filter(|d| boot_var.is_match(&d.name)) {
            let Ok((data, _)) = vars.get_variable(&desc.guid, &desc.name) else {
                continue;
            };
            let Ok(option) = LoadOption::from_bytes(&data) else {
                continue;
            };
            if option.description != BOOT_ENTRY_NAME {
                continue;
            }
            tracing::debug!("Entry for {} already exists, removing it: {}", BOOT_ENTRY_NAME, option);
            if let Err(e) = vars.del_variable(&desc.guid, &desc.name) {
                tracing::error!("failed to remove efi entry {}: {:#}", desc.name, e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Point an entry at `relative_to/shim_name` and boot it first.
    pub fn create_boot_entry(&self, shim_name: &str, relative_to: &Path, vars: &dyn Variables) -> Result<()> {
        tracing::debug!(
            "Creating boot entry for {} pointing to shim {}/{}",
            BOOT_ENTRY_NAME,
            ENTRY_EFI_PATH,
            shim_name
        );
        let mut manager = BootManager::new(vars)?;

        // an entry on a recreated partition is not found and gets a new slot
        let entry = BootEntry {
            filename: shim_name.to_string(),
            label: BOOT_ENTRY_NAME.to_string(),
            description: BOOT_ENTRY_NAME.to_string(),
            ..Default::default()
        };
        let number = manager.find_or_create_entry(&entry, relative_to).map_err(|e| {
            tracing::error!("error creating boot entry: {:#}", e);
            e
        })?;
        manager.prepend_and_set_boot_order(&[number]).map_err(|e| {
            tracing::error!("error setting boot order: {:#}", e);
            e
        })?;
        tracing::info!("Entry created for {} in the EFI boot manager", BOOT_ENTRY_NAME);
        Ok(())
    }

    /// Store `vars` in the grub environment block `env_file`, in key order.
    /// Stops at the first failure. Uses `grub-editenv` when `grub2-editenv`
    /// is not installed.
    pub fn set_persistent_variables(&self, env_file: &Path, vars: &BTreeMap<String, String>) -> Result<()> {
        let editenv = if self.config.runner.command_exists(GRUB_EDITENV) {
            GRUB_EDITENV
        } else {
            GRUB_EDITENV_FALLBACK
        };
        let env_file = env_file.to_string_lossy();
        for (key, value) in vars {
            let assignment = format!("{}={}", key, value);
            tracing::debug!("Running {} with params: {} set {}", editenv, env_file, assignment);
            if let Err(e) = self.config.runner.run(editenv, &[&env_file, "set", &assignment]) {
                tracing::error!("Failed setting grub variables: {:#}", e);
                return Err(e).with_context(|| format!("{} failed setting {}", editenv, key));
            }
        }
        Ok(())
    }

    /// Set `default_menu_entry` in the OEM grub environment of the boot
    /// partition mounted at `part_mount_point`.
    ///
    /// A `GRUB_ENTRY_NAME` in the image's os-release wins over
    /// `default_entry`. With neither, nothing is written and the shipped
    /// grub.cfg default applies.
    pub fn set_default_entry(&self, part_mount_point: &Path, img_mount_point: &Path, default_entry: &str) -> Result<()> {
        tracing::debug!(
            "Looking for {} name in {}",
            GRUB_ENTRY_NAME_KEY,
            img_mount_point.join("etc/os-release").display()
        );
        let entry = match os_release_entry(self.config.fs.as_ref(), img_mount_point, GRUB_ENTRY_NAME_KEY) {
            Ok(Some(name)) => name,
            Ok(None) => default_entry.to_string(),
            Err(e) => {
                tracing::warn!("Could not load os-release file: {:#}", e);
                default_entry.to_string()
            }
        };

        if entry.is_empty() {
            tracing::warn!("No default entry name for grub, not setting a name");
            return Ok(());
        }

        tracing::info!("Setting default grub entry to {}", entry);
        let vars = BTreeMap::from([("default_menu_entry".to_string(), entry)]);
        self.set_persistent_variables(&part_mount_point.join(GRUB_OEM_ENV), &vars)
    }
}

/// Whether `vars` holds an entry described as ours.
pub fn has_boot_entry(vars: &dyn Variables) -> Result<bool> {
    let manager = BootManager::new(vars)?;
    Ok(manager
        .entries()
        .values()
        .any(|e| e.load_option.description == BOOT_ENTRY_NAME))
}
