//! Provisioning stage runner.
//!
//! A stage `S` runs as `S.before`, `S`, `S.after`, first over the
//! directive paths (explicit ones plus any `cos.setup=` source on the
//! kernel command line), then over the kernel command line itself read in
//! dot notation. Command line documents are expected to be only partially
//! valid, so schema mismatches from that pass are ignored.

use anyhow::Result;
use std::path::Path;

use crate::cloudinit::{EngineError, Modifier};
use crate::config::Config;
use crate::constants::{CMDLINE_SETUP_KEY, PROC_CMDLINE};
use crate::errors::MultiError;
use crate::fs;

/// Whether every error in `err` is a schema mismatch.
fn only_yaml_partial_errors(err: &anyhow::Error) -> bool {
    let is_type_error = |e: &anyhow::Error| {
        e.downcast_ref::<EngineError>()
            .is_some_and(EngineError::is_yaml_type)
    };
    match err.downcast_ref::<MultiError>() {
        Some(multi) => multi.errors().iter().all(is_type_error),
        None => is_type_error(err),
    }
}

/// Drop local paths that do not exist. Remote URIs are kept untouched.
fn filter_non_existing_local_uris(config: &Config, uris: &[String]) -> Vec<String> {
    uris.iter()
        .filter(|uri| match fs::local_path(uri) {
            Some(local) => match fs::exists(config.fs.as_ref(), Path::new(local)) {
                Ok(true) => true,
                _ => {
                    tracing::debug!("Ignoring cloud-init local config path {}. Could not find it.", uri);
                    false
                }
            },
            None => true,
        })
        .cloned()
        .collect()
}

fn stage_names(stage: &str) -> [String; 3] {
    [
        format!("{}.before", stage),
        stage.to_string(),
        format!("{}.after", stage),
    ]
}

/// Run `stage` over `cloud_init_paths` and the kernel command line.
///
/// Errors are collected across every pass. In strict mode they are
/// returned; otherwise they are logged and the run reports success.
pub fn run_stage(config: &Config, stage: &str, strict: bool, cloud_init_paths: &[&str]) -> Result<()> {
    let mut errors = MultiError::new();
    let mut paths: Vec<String> = cloud_init_paths.iter().map(|p| p.to_string()).collect();
    tracing::debug!("Cloud-init paths set to {:?}", paths);

    let cmdline = match config.fs.read_to_string(Path::new(PROC_CMDLINE)) {
        Ok(cmdline) => cmdline,
        Err(e) => {
            errors.push(anyhow::Error::new(e).context(format!("Failed to read {}", PROC_CMDLINE)));
            String::new()
        }
    };

    for token in cmdline.split(' ') {
        if let Some((key, value)) = token.split_once('=') {
            if key == CMDLINE_SETUP_KEY {
                let value = value.split('=').next().unwrap_or_default().trim();
                tracing::debug!("Found {} stanza on cmdline with value {}", CMDLINE_SETUP_KEY, value);
                paths.push(value.to_string());
            }
        }
    }

    let stages = stage_names(stage);

    if !paths.is_empty() {
        let sources = filter_non_existing_local_uris(config, &paths);
        for name in &stages {
            if let Err(e) = config.cloud_init.run(name, &sources, Modifier::None) {
                errors.push(e);
            }
        }
    }

    let cmdline_source = [cmdline];
    for name in &stages {
        if let Err(e) = config.cloud_init.run(name, &cmdline_source, Modifier::DotNotation) {
            if only_yaml_partial_errors(&e) {
                tracing::debug!(
                    "/proc/cmdline parsing returned errors while unmarshalling. Ignoring as /proc/cmdline fields are turned to a YAML document, and partial failures are valid"
                );
                tracing::debug!("{:#}", e);
            } else {
                errors.push(e);
            }
        }
    }

    if !errors.is_empty() && !strict {
        tracing::info!(
            "Some errors found but were ignored. Enable --strict mode to fail on those or --debug to see them in the log"
        );
        tracing::warn!("{}", errors);
        return Ok(());
    }
    errors.into_result()
}
