//! Provisioning document schema.
//!
//! ```yaml
//! name: example
//! stages:
//!   initramfs:
//!   - name: setup
//!     if: '[ -e /run/first-boot ]'
//!     directories:
//!     - path: /oem/extra
//!     files:
//!     - path: /etc/motd
//!       content: hello
//!       permissions: 0o644
//!     commands:
//!     - echo done
//!     hostname: node-1
//!     environment:
//!       KEY: value
//! ```
//!
//! Unknown keys are ignored, so documents written for richer engines still
//! load. A key with the wrong shape is dropped and reported as a type
//! error while the rest of the document is kept.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

use super::EngineError;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CloudConfig {
    pub name: String,
    pub stages: BTreeMap<String, Vec<Step>>,
}

/// One step of a stage. Plugins run in field order: `if`, directories,
/// files, commands, hostname, environment.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Step {
    pub name: String,
    #[serde(rename = "if")]
    pub if_condition: String,
    pub directories: Vec<Directory>,
    pub files: Vec<File>,
    pub commands: Vec<String>,
    pub hostname: String,
    pub environment: BTreeMap<String, String>,
    pub environment_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Directory {
    pub path: String,
    pub permissions: u32,
    pub owner: Option<u32>,
    pub group: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct File {
    pub path: String,
    pub permissions: u32,
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub content: String,
    /// Empty for plain text, `b64`/`base64` for base64 content.
    pub encoding: String,
}

/// A decoded document plus the type error covering every part that did not
/// match the schema, if any.
pub type Decoded = (CloudConfig, Option<EngineError>);

/// Parse YAML text. Syntax errors fail the whole document; shape errors
/// only drop the parts they hit.
pub fn from_yaml(origin: &str, text: &str) -> Result<Decoded, EngineError> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| EngineError::YamlSyntax {
        origin: origin.to_string(),
        message: e.to_string(),
    })?;
    Ok(from_value(origin, value))
}

/// Decode `value` key by key. A key with the wrong shape is dropped and
/// reported, and its siblings are kept, so one bad directive does not
/// discard the rest of the document.
pub fn from_value(origin: &str, value: Value) -> Decoded {
    let mut problems = Vec::new();
    let config = decode_config(value, &mut problems);
    let error = if problems.is_empty() {
        None
    } else {
        Some(EngineError::YamlType {
            origin: origin.to_string(),
            message: problems.join("; "),
        })
    };
    (config, error)
}

fn decode_config(value: Value, problems: &mut Vec<String>) -> CloudConfig {
    let mut root = match value {
        Value::Null => return CloudConfig::default(),
        Value::Mapping(map) => map,
        other => {
            problems.push(format!("invalid type: {}, expected a mapping", kind(&other)));
            return CloudConfig::default();
        }
    };

    let stages = root.remove("stages");
    let mut config: CloudConfig = decode_fields(root, "", problems);

    match stages {
        None | Some(Value::Null) => {}
        Some(Value::Mapping(stages)) => {
            for (key, steps) in stages {
                let Some(stage) = key.as_str().map(str::to_string) else {
                    problems.push(format!("stages: invalid stage name {}", kind(&key)));
                    continue;
                };
                let steps = match steps {
                    Value::Null => Vec::new(),
                    Value::Sequence(steps) => steps,
                    other => {
                        problems.push(format!(
                            "stages.{}: invalid type: {}, expected a sequence",
                            stage,
                            kind(&other)
                        ));
                        continue;
                    }
                };
                let mut decoded = Vec::with_capacity(steps.len());
                for (i, step) in steps.into_iter().enumerate() {
                    if let Some(step) = decode_step(step, &format!("stages.{}[{}]", stage, i), problems) {
                        decoded.push(step);
                    }
                }
                config.stages.insert(stage, decoded);
            }
        }
        Some(other) => {
            problems.push(format!("stages: invalid type: {}, expected a mapping", kind(&other)));
        }
    }
    config
}

fn decode_step(value: Value, path: &str, problems: &mut Vec<String>) -> Option<Step> {
    match value {
        Value::Mapping(map) => Some(decode_fields(map, path, problems)),
        Value::Null => Some(Step::default()),
        other => {
            problems.push(format!("{}: invalid type: {}, expected a mapping", path, kind(&other)));
            None
        }
    }
}

/// Deserialize `T` from `map`, dropping each key that fails on its own.
fn decode_fields<T: DeserializeOwned + Default>(map: Mapping, path: &str, problems: &mut Vec<String>) -> T {
    let mut kept = Mapping::new();
    for (key, value) in map {
        let mut single = Mapping::new();
        single.insert(key.clone(), value.clone());
        match serde_yaml::from_value::<T>(Value::Mapping(single)) {
            Ok(_) => {
                kept.insert(key, value);
            }
            Err(e) => {
                let name = key.as_str().unwrap_or("?");
                let field = if path.is_empty() {
                    name.to_string()
                } else {
                    format!("{}.{}", path, name)
                };
                problems.push(format!("{}: {}", field, e));
            }
        }
    }
    serde_yaml::from_value(Value::Mapping(kept)).unwrap_or_else(|e| {
        problems.push(format!("{}: {}", if path.is_empty() { "document" } else { path }, e));
        T::default()
    })
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}
