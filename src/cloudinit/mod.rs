//! Provisioning engine.
//!
//! Runs one stage of provisioning documents ("cloud-init" style YAML) from
//! a list of sources. A source is a directory (every `.yaml`/`.yml` below
//! it), a file, an `http(s)://` URI, or anything else, which is parsed as
//! the document text itself. With [`Modifier::DotNotation`] the loaded
//! text is read as flat `key=value` pairs instead of YAML, which is how
//! directives embedded in the kernel command line are handled.
//!
//! The modifier is an argument of every run, never engine state, so
//! concurrent runs cannot affect each other.

pub mod dotnotation;
pub mod plugins;
pub mod schema;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use walkdir::WalkDir;

use crate::errors::MultiError;
use crate::fs::Fs;
use crate::process::Runner;
use plugins::{StepContext, PLUGINS};
use schema::{CloudConfig, Decoded};

/// How loaded source text is turned into a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Modifier {
    /// Text is YAML.
    #[default]
    None,
    /// Text is dot-notation `key=value` pairs.
    DotNotation,
}

/// Failures reported by the engine. Runs report a [`MultiError`] whose
/// items downcast to this type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The document parsed but does not match the schema.
    #[error("{origin}: yaml type error: {message}")]
    YamlType { origin: String, message: String },
    #[error("{origin}: yaml syntax error: {message}")]
    YamlSyntax { origin: String, message: String },
    /// The source could not be read or fetched.
    #[error("error loading '{origin}': {message}")]
    Source { origin: String, message: String },
    /// A step plugin failed.
    #[error("{0}")]
    Step(String),
}

impl EngineError {
    pub fn is_yaml_type(&self) -> bool {
        matches!(self, EngineError::YamlType { .. })
    }
}

/// Runs a provisioning stage over a list of sources.
pub trait CloudInitRunner: Send + Sync {
    fn run(&self, stage: &str, sources: &[String], modifier: Modifier) -> Result<()>;
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Default engine, modelled on yip.
pub struct YipRunner {
    fs: Arc<dyn Fs>,
    runner: Arc<dyn Runner>,
}

impl YipRunner {
    pub fn new(fs: Arc<dyn Fs>, runner: Arc<dyn Runner>) -> Self {
        Self { fs, runner }
    }

    fn parse(&self, origin: &str, bytes: &[u8], modifier: Modifier) -> Result<Decoded, EngineError> {
        let text = String::from_utf8_lossy(bytes);
        match modifier {
            Modifier::None => schema::from_yaml(origin, &text),
            Modifier::DotNotation => Ok(schema::from_value(origin, dotnotation::to_value(&text))),
        }
    }

    fn load_file(&self, path: &Path, modifier: Modifier) -> Result<Decoded, EngineError> {
        let origin = path.display().to_string();
        tracing::debug!("Reading '{}'", origin);
        let bytes = self.fs.read(path).map_err(|e| EngineError::Source {
            origin: origin.clone(),
            message: e.to_string(),
        })?;
        self.parse(&origin, &bytes, modifier)
    }

    fn fetch(&self, url: &str, modifier: Modifier) -> Result<Decoded, EngineError> {
        tracing::debug!("Fetching '{}'", url);
        let source_error = |e: reqwest::Error| EngineError::Source {
            origin: url.to_string(),
            message: e.to_string(),
        };
        let bytes = reqwest::blocking::Client::builder()
            .build()
            .and_then(|client| client.get(url).send())
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.bytes())
            .map_err(source_error)?;
        self.parse(url, &bytes, modifier)
    }

    /// Documents found in `source`, in execution order, each with the
    /// error it failed to load with.
    fn load(&self, source: &str, modifier: Modifier) -> Vec<Result<Decoded, EngineError>> {
        if source.trim().is_empty() {
            return Vec::new();
        }
        let source = crate::fs::local_path(source).unwrap_or(source);
        let path = Path::new(source);
        match self.fs.metadata(path) {
            Ok(meta) if meta.is_dir() => self.load_dir(path, modifier),
            Ok(_) => vec![self.load_file(path, modifier)],
            Err(_) if is_url(source) => vec![self.fetch(source, modifier)],
            Err(_) => vec![self.parse("<cmdline>", source.as_bytes(), modifier)],
        }
    }

    fn load_dir(&self, dir: &Path, modifier: Modifier) -> Vec<Result<Decoded, EngineError>> {
        let raw_dir = self.fs.raw_path(dir);
        let mut docs = Vec::new();
        for entry in WalkDir::new(&raw_dir).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    docs.push(Err(EngineError::Source {
                        origin: dir.display().to_string(),
                        message: e.to_string(),
                    }));
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let is_yaml = matches!(
                entry.path().extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            if !is_yaml {
                continue;
            }
            let relative = entry.path().strip_prefix(&raw_dir).unwrap_or(entry.path());
            let doc = self.load_file(&dir.join(relative), modifier);
            match &doc {
                Err(e) | Ok((_, Some(e))) => tracing::warn!("failed to load file: {}", e),
                Ok(_) => {}
            }
            docs.push(doc);
        }
        docs
    }

    fn apply(&self, stage: &str, config: &CloudConfig, errors: &mut MultiError) {
        let Some(steps) = config.stages.get(stage) else {
            return;
        };
        let ctx = StepContext {
            fs: self.fs.as_ref(),
            runner: self.runner.as_ref(),
        };
        for (i, step) in steps.iter().enumerate() {
            let name = if step.name.is_empty() {
                i.to_string()
            } else {
                step.name.clone()
            };
            if let Err(e) = plugins::if_conditional(&ctx, step) {
                tracing::warn!("(conditional) Skip '{:#}' stage name: {}", e, name);
                continue;
            }
            tracing::info!(
                "Processing stage step '{}'. ( commands: {}, files: {}, ... )",
                name,
                step.commands.len(),
                step.files.len()
            );
            for (plugin, run) in PLUGINS {
                for err in run(&ctx, step) {
                    tracing::error!("{} plugin: {:#}", plugin, err);
                    errors.push(EngineError::Step(format!("{:#}", err)).into());
                }
            }
        }
    }
}

impl CloudInitRunner for YipRunner {
    fn run(&self, stage: &str, sources: &[String], modifier: Modifier) -> Result<()> {
        tracing::info!("Running stage: {}", stage);
        let mut errors = MultiError::new();
        for source in sources {
            for doc in self.load(source, modifier) {
                match doc {
                    Ok((config, type_error)) => {
                        if let Some(e) = type_error {
                            errors.push(e.into());
                        }
                        self.apply(stage, &config, &mut errors);
                    }
                    Err(e) => errors.push(e.into()),
                }
            }
        }
        tracing::info!("Done executing stage '{}'", stage);
        errors.into_result()
    }
}
