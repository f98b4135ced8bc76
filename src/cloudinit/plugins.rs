//! Step plugins. Each one applies a single kind of directive and reports
//! every failure instead of stopping at the first.

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine as _;
use std::collections::BTreeMap;
use std::path::Path;

use super::schema::{Directory, File, Step};
use crate::constants::{DIR_PERM, FILE_PERM};
use crate::fs::{self, Fs};
use crate::process::Runner;

const ENVIRONMENT_FILE: &str = "/etc/environment";
const HOSTNAME_FILE: &str = "/etc/hostname";

pub struct StepContext<'a> {
    pub fs: &'a dyn Fs,
    pub runner: &'a dyn Runner,
}

pub type Plugin = fn(&StepContext<'_>, &Step) -> Vec<anyhow::Error>;

/// Plugins in execution order.
pub const PLUGINS: &[(&str, Plugin)] = &[
    ("directories", ensure_directories),
    ("files", ensure_files),
    ("commands", commands),
    ("hostname", hostname),
    ("environment", environment),
];

/// `if` conditional: the step runs only when the shell expression succeeds.
pub fn if_conditional(ctx: &StepContext<'_>, step: &Step) -> Result<()> {
    if step.if_condition.is_empty() {
        return Ok(());
    }
    ctx.runner
        .run("sh", &["-c", &step.if_condition])
        .map(|_| ())
        .with_context(|| format!("condition '{}' not met", step.if_condition))
}

fn chown(ctx: &StepContext<'_>, path: &Path, owner: Option<u32>, group: Option<u32>) -> Result<()> {
    if owner.is_none() && group.is_none() {
        return Ok(());
    }
    std::os::unix::fs::chown(ctx.fs.raw_path(path), owner, group)
        .with_context(|| format!("Failed to chown {}", path.display()))
}

fn ensure_directory(ctx: &StepContext<'_>, dir: &Directory) -> Result<()> {
    let path = Path::new(&dir.path);
    let mode = if dir.permissions == 0 {
        DIR_PERM
    } else {
        dir.permissions
    };
    ctx.fs
        .create_dir_all(path, mode)
        .with_context(|| format!("Failed to create directory {}", path.display()))?;
    ctx.fs
        .set_permissions(path, mode)
        .with_context(|| format!("Failed to chmod {}", path.display()))?;
    chown(ctx, path, dir.owner, dir.group)
}

fn ensure_directories(ctx: &StepContext<'_>, step: &Step) -> Vec<anyhow::Error> {
    step.directories
        .iter()
        .filter_map(|dir| ensure_directory(ctx, dir).err())
        .collect()
}

fn decode(file: &File) -> Result<Vec<u8>> {
    match file.encoding.as_str() {
        "" => Ok(file.content.clone().into_bytes()),
        "b64" | "base64" => base64::engine::general_purpose::STANDARD
            .decode(file.content.trim())
            .with_context(|| format!("failed decoding content with encoding {}", file.encoding)),
        other => bail!("unsupported encoding {}", other),
    }
}

fn write_file(ctx: &StepContext<'_>, file: &File) -> Result<()> {
    tracing::debug!("Creating file {}", file.path);
    let path = Path::new(&file.path);
    let mode = if file.permissions == 0 {
        FILE_PERM
    } else {
        file.permissions
    };

    if let Some(parent) = path.parent() {
        if !fs::exists(ctx.fs, parent)? {
            // parent needs the search bit to be usable
            let parent_dir = Directory {
                path: parent.to_string_lossy().into_owned(),
                permissions: mode | 0o100,
                owner: file.owner,
                group: file.group,
            };
            ensure_directory(ctx, &parent_dir)?;
        }
    }

    let content = decode(file)?;
    ctx.fs
        .write(path, &content, mode)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    chown(ctx, path, file.owner, file.group)
}

fn ensure_files(ctx: &StepContext<'_>, step: &Step) -> Vec<anyhow::Error> {
    step.files
        .iter()
        .filter_map(|file| write_file(ctx, file).err())
        .collect()
}

fn commands(ctx: &StepContext<'_>, step: &Step) -> Vec<anyhow::Error> {
    let mut errors = Vec::new();
    for cmd in &step.commands {
        tracing::info!("running command `{}`", cmd);
        match ctx.runner.run("sh", &["-c", cmd]) {
            Ok(out) => tracing::debug!("Command output: {}", String::from_utf8_lossy(&out)),
            Err(e) => errors.push(anyhow!("failed running command `{}`: {:#}", cmd, e)),
        }
    }
    errors
}

fn hostname(ctx: &StepContext<'_>, step: &Step) -> Vec<anyhow::Error> {
    if step.hostname.is_empty() {
        return Vec::new();
    }
    let path = Path::new(HOSTNAME_FILE);
    let result = path
        .parent()
        .map_or(Ok(()), |parent| fs::mkdir_all(ctx.fs, parent))
        .and_then(|_| {
            ctx.fs
                .write(path, format!("{}\n", step.hostname).as_bytes(), FILE_PERM)
                .with_context(|| format!("Failed to write {}", path.display()))
        });
    result.err().into_iter().collect()
}

/// Parse `KEY=VALUE` lines, skipping blanks and comments.
fn parse_env(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

fn write_environment(ctx: &StepContext<'_>, step: &Step) -> Result<()> {
    let target = if step.environment_file.is_empty() {
        ENVIRONMENT_FILE
    } else {
        step.environment_file.as_str()
    };
    let path = Path::new(target);
    if let Some(parent) = path.parent() {
        fs::mkdir_all(ctx.fs, parent)?;
    }

    let mut env = if fs::exists(ctx.fs, path)? {
        let content = ctx
            .fs
            .read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        parse_env(&content)
    } else {
        BTreeMap::new()
    };
    env.extend(step.environment.clone());

    let content: String = env
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"\n", key, value.replace('"', "\\\"")))
        .collect();
    ctx.fs
        .write(path, content.as_bytes(), FILE_PERM)
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn environment(ctx: &StepContext<'_>, step: &Step) -> Vec<anyhow::Error> {
    if step.environment.is_empty() {
        return Vec::new();
    }
    write_environment(ctx, step).err().into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::FakeRunner;
    use crate::fs::OsFs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, OsFs, FakeRunner) {
        let temp = TempDir::new().unwrap();
        let fs = OsFs::rooted(temp.path());
        (temp, fs, FakeRunner::new())
    }

    #[test]
    fn test_files_create_parents_and_decode() {
        let (_temp, fs, runner) = setup();
        let ctx = StepContext { fs: &fs, runner: &runner };
        let step = Step {
            files: vec![
                File {
                    path: "/etc/app/plain".into(),
                    content: "hello".into(),
                    ..Default::default()
                },
                File {
                    path: "/etc/app/encoded".into(),
                    content: "aGVsbG8=".into(),
                    encoding: "base64".into(),
                    permissions: 0o600,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        assert!(ensure_files(&ctx, &step).is_empty());
        assert_eq!(fs.read_to_string(Path::new("/etc/app/plain")).unwrap(), "hello");
        assert_eq!(fs.read(Path::new("/etc/app/encoded")).unwrap(), b"hello");
        use std::os::unix::fs::PermissionsExt;
        let mode = fs.metadata(Path::new("/etc/app/encoded")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_unknown_encoding_fails() {
        let (_temp, fs, runner) = setup();
        let ctx = StepContext { fs: &fs, runner: &runner };
        let step = Step {
            files: vec![File {
                path: "/f".into(),
                encoding: "gz+b64".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let errors = ensure_files(&ctx, &step);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("unsupported encoding"));
    }

    #[test]
    fn test_commands_collect_failures() {
        let (_temp, fs, runner) = setup();
        runner.set_side_effect(|_, args| {
            if args[1] == "false" {
                Err(anyhow!("exit status 1"))
            } else {
                Ok(Vec::new())
            }
        });
        let ctx = StepContext { fs: &fs, runner: &runner };
        let step = Step {
            commands: vec!["false".into(), "true".into()],
            ..Default::default()
        };
        let errors = commands(&ctx, &step);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("`false`"));
        assert!(runner.ran(&["sh", "-c", "true"]));
    }

    #[test]
    fn test_environment_merges_existing() {
        let (_temp, fs, runner) = setup();
        fs::mkdir_all(&fs, Path::new("/etc")).unwrap();
        fs.write(Path::new("/etc/environment"), b"# comment\nOLD=\"keep\"\nKEY=old\n", FILE_PERM)
            .unwrap();
        let ctx = StepContext { fs: &fs, runner: &runner };
        let step = Step {
            environment: BTreeMap::from([("KEY".to_string(), "new".to_string())]),
            ..Default::default()
        };

        assert!(environment(&ctx, &step).is_empty());
        assert_eq!(
            fs.read_to_string(Path::new("/etc/environment")).unwrap(),
            "KEY=\"new\"\nOLD=\"keep\"\n"
        );
    }

    #[test]
    fn test_hostname_written() {
        let (_temp, fs, runner) = setup();
        let ctx = StepContext { fs: &fs, runner: &runner };
        let step = Step {
            hostname: "node-1".into(),
            ..Default::default()
        };
        assert!(hostname(&ctx, &step).is_empty());
        assert_eq!(fs.read_to_string(Path::new("/etc/hostname")).unwrap(), "node-1\n");
    }

    #[test]
    fn test_if_conditional() {
        let (_temp, fs, runner) = setup();
        runner.set_side_effect(|_, _| Err(anyhow!("exit status 1")));
        let ctx = StepContext { fs: &fs, runner: &runner };
        let step = Step {
            if_condition: "[ -e /nope ]".into(),
            ..Default::default()
        };
        assert!(if_conditional(&ctx, &step).is_err());
        assert!(if_conditional(&ctx, &Step::default()).is_ok());
    }
}
