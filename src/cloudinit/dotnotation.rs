//! Dot-notation directives.
//!
//! The kernel command line carries directives as flat `key=value` pairs,
//! e.g. `stages.boot[0].commands[0]="echo hi"`. This module turns such a
//! line into the equivalent YAML tree. Values are always strings; a bare
//! `key` means `key=true`. Pairs whose key is not a path expression, or that
//! collide with an already assigned path, are dropped.

use serde_yaml::{Mapping, Value};

/// Largest array index accepted in a path expression.
const MAX_INDEX: usize = 1 << 16;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Split a command line into words the way a POSIX shell would: whitespace
/// separates words, single and double quotes group and are removed, and a
/// backslash escapes the next character outside single quotes.
pub fn split_args(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        other => current.push(other),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_path(key: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    for part in key.split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if !is_identifier(name) {
            return None;
        }
        segments.push(Segment::Key(name.to_string()));

        while !rest.is_empty() {
            let inner = rest.strip_prefix('[')?;
            let end = inner.find(']')?;
            let index: usize = inner[..end].parse().ok()?;
            if index > MAX_INDEX {
                return None;
            }
            segments.push(Segment::Index(index));
            rest = &inner[end + 1..];
        }
    }
    Some(segments)
}

fn assign(node: &mut Value, path: &[Segment], value: Value) -> bool {
    let Some((first, rest)) = path.split_first() else {
        *node = value;
        return true;
    };
    match first {
        Segment::Key(key) => {
            if node.is_null() {
                *node = Value::Mapping(Mapping::new());
            }
            let Value::Mapping(map) = node else {
                return false;
            };
            let child = map
                .entry(Value::String(key.clone()))
                .or_insert(Value::Null);
            assign(child, rest, value)
        }
        Segment::Index(index) => {
            if node.is_null() {
                *node = Value::Sequence(Vec::new());
            }
            let Value::Sequence(seq) = node else {
                return false;
            };
            if seq.len() <= *index {
                seq.resize(index + 1, Value::Null);
            }
            assign(&mut seq[*index], rest, value)
        }
    }
}

/// Convert a dot-notation line into a YAML tree.
pub fn to_value(line: &str) -> Value {
    let mut root = Value::Mapping(Mapping::new());
    for word in split_args(line) {
        let (key, value) = match word.split_once('=') {
            Some((key, value)) => (key, value.trim_matches('"')),
            None => (word.as_str(), "true"),
        };
        let key = key.trim_matches('"');

        let Some(path) = parse_path(key) else {
            tracing::debug!("ignoring dot notation key '{}'", key);
            continue;
        };
        let mut updated = root.clone();
        if assign(&mut updated, &path, Value::String(value.to_string())) {
            root = updated;
        } else {
            tracing::debug!("ignoring conflicting dot notation key '{}'", key);
        }
    }
    root
}
