//! # Properties Flattening
//!
//! Converts between nested documents (YAML, JSON, TOML, `.properties`) and the
//! flat key space used by the manager.
//!
//! ## Key syntax
//! - Object fields are joined with `.`: `server.http.port`
//! - List elements are suffixed with `[n]`: `servers[0].host`, `matrix[1][0]`
//!
//! ## Unflatten rules
//! - Each flat key contributes to exactly one place in the result
//! - Lists are rebuilt from contiguous indices starting at 0; anything after
//!   the first gap is dropped with a warning
//! - When two keys disagree about the shape at a path (one expects a map,
//!   another a scalar or a list) the later key is dropped with a warning

use std::collections::BTreeMap;
use std::path::Path;

use errors::SourceError;
use tracing::warn;

use crate::value::ConfigValue;

/// Flat key → leaf value.
pub type FlatMap = BTreeMap<String, ConfigValue>;

/// Document formats understood by file based sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
    Toml,
    Properties,
}

impl Format {
    /// Detect the format from the file extension.
    ///
    /// ## Supported Formats
    /// - `.yaml` / `.yml`
    /// - `.json`
    /// - `.toml`
    /// - `.properties`
    pub fn from_path(path: &Path) -> Result<Self, SourceError> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| SourceError::NoExtension {
                path: path.display().to_string(),
            })?;

        match extension.to_lowercase().as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            "toml" => Ok(Self::Toml),
            "properties" => Ok(Self::Properties),
            other => Err(SourceError::UnsupportedFormat {
                extension: other.to_string(),
            }),
        }
    }
}

/// Decode a document into a nested value.
///
/// `origin` is only used for error messages.
pub fn parse_document(format: Format, contents: &str, origin: &str) -> Result<ConfigValue, SourceError> {
    let parse_error = |reason: String| SourceError::Parse {
        path: origin.to_string(),
        reason,
    };

    if contents.trim().is_empty() {
        return Ok(ConfigValue::Map(BTreeMap::new()));
    }

    match format {
        Format::Yaml => serde_yaml::from_str(contents).map_err(|e| parse_error(e.to_string())),
        Format::Json => serde_json::from_str(contents).map_err(|e| parse_error(e.to_string())),
        Format::Toml => toml::from_str(contents).map_err(|e| parse_error(e.to_string())),
        Format::Properties => Ok(unflatten(&parse_properties(contents))),
    }
}

/// Decode a document straight into flat keys.
pub fn parse_flat(format: Format, contents: &str, origin: &str) -> Result<FlatMap, SourceError> {
    match format {
        // Properties files are already flat
        Format::Properties => Ok(parse_properties(contents)),
        _ => Ok(flatten(&parse_document(format, contents, origin)?)),
    }
}

/// Read and flatten a file, detecting its format from the extension.
pub fn load_file(path: &Path) -> Result<FlatMap, SourceError> {
    let format = Format::from_path(path)?;
    let contents = std::fs::read_to_string(path).map_err(|e| SourceError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_flat(format, &contents, &path.display().to_string())
}

/// Parse `key=value` / `key: value` lines. `#` and `!` start comments, a
/// trailing `\` continues the value on the next line.
pub fn parse_properties(contents: &str) -> FlatMap {
    let mut out = FlatMap::new();
    let mut pending = String::new();

    for line in contents.lines() {
        let trimmed = line.trim();
        if pending.is_empty() && (trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!')) {
            continue;
        }

        if let Some(continued) = trimmed.strip_suffix('\\') {
            pending.push_str(continued);
            continue;
        }
        pending.push_str(trimmed);

        let entry = std::mem::take(&mut pending);
        let split_at = entry.find(['=', ':']);
        let (key, value) = match split_at {
            Some(idx) => (entry[..idx].trim(), entry[idx + 1..].trim()),
            None => (entry.trim(), ""),
        };
        if !key.is_empty() {
            out.insert(key.to_string(), ConfigValue::String(value.to_string()));
        }
    }

    out
}

/// Flatten a nested value into dotted/indexed keys.
pub fn flatten(value: &ConfigValue) -> FlatMap {
    let mut out = FlatMap::new();
    flatten_into("", value, &mut out);
    out
}

/// Flatten `value` under `prefix`, e.g. when a structured value is written to
/// a single key.
pub fn flatten_under(prefix: &str, value: &ConfigValue) -> FlatMap {
    let mut out = FlatMap::new();
    flatten_into(prefix, value, &mut out);
    out
}

fn flatten_into(prefix: &str, value: &ConfigValue, out: &mut FlatMap) {
    match value {
        ConfigValue::Map(map) => {
            for (key, child) in map {
                let full_key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(&full_key, child, out);
            }
        }
        ConfigValue::List(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(&format!("{prefix}[{index}]"), child, out);
            }
        }
        scalar => {
            if !prefix.is_empty() {
                out.insert(prefix.to_string(), scalar.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

/// Split `a.b[0][1].c` into `[a, b, 0, 1, c]`. A part with malformed brackets
/// is kept as a literal field name.
fn parse_key(key: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for part in key.split('.') {
        match split_indices(part) {
            Some((name, indices)) => {
                if !name.is_empty() || indices.is_empty() {
                    segments.push(Segment::Field(name.to_string()));
                }
                segments.extend(indices.into_iter().map(Segment::Index));
            }
            None => segments.push(Segment::Field(part.to_string())),
        }
    }
    segments
}

fn split_indices(part: &str) -> Option<(&str, Vec<usize>)> {
    let Some(open) = part.find('[') else {
        return Some((part, Vec::new()));
    };

    let (name, mut rest) = part.split_at(open);
    let mut indices = Vec::new();
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        indices.push(inner[..close].parse::<usize>().ok()?);
        rest = &inner[close + 1..];
    }
    Some((name, indices))
}

enum Node {
    Leaf(ConfigValue),
    Map(BTreeMap<String, Node>),
    List(BTreeMap<usize, Node>),
}

fn build(path: &[Segment], value: ConfigValue) -> Node {
    match path.split_first() {
        None => Node::Leaf(value),
        Some((Segment::Field(name), rest)) => {
            Node::Map(BTreeMap::from([(name.clone(), build(rest, value))]))
        }
        Some((Segment::Index(index), rest)) => {
            Node::List(BTreeMap::from([(*index, build(rest, value))]))
        }
    }
}

fn merge_into(node: &mut Node, path: &[Segment], value: ConfigValue, key: &str) {
    match (node, path.split_first()) {
        (Node::Map(children), Some((Segment::Field(name), rest))) => match children.get_mut(name) {
            Some(child) => merge_into(child, rest, value, key),
            None => {
                children.insert(name.clone(), build(rest, value));
            }
        },
        (Node::List(items), Some((Segment::Index(index), rest))) => match items.get_mut(index) {
            Some(child) => merge_into(child, rest, value, key),
            None => {
                items.insert(*index, build(rest, value));
            }
        },
        _ => warn!("Conflicting structure at key {}, dropping its value", key),
    }
}

fn finish(node: Node, path: &str) -> ConfigValue {
    match node {
        Node::Leaf(value) => value,
        Node::Map(children) => ConfigValue::Map(
            children
                .into_iter()
                .map(|(name, child)| {
                    let child_path = if path.is_empty() {
                        name.clone()
                    } else {
                        format!("{path}.{name}")
                    };
                    (name, finish(child, &child_path))
                })
                .collect(),
        ),
        Node::List(mut items) => {
            let mut list = Vec::with_capacity(items.len());
            while let Some(child) = items.remove(&list.len()) {
                let child_path = format!("{path}[{}]", list.len());
                list.push(finish(child, &child_path));
            }
            if !items.is_empty() {
                warn!(
                    "List {} has a gap at index {}, dropping {} trailing element(s)",
                    path,
                    list.len(),
                    items.len()
                );
            }
            ConfigValue::List(list)
        }
    }
}

/// Rebuild a nested value from flat keys.
///
/// The result is a map unless every key starts with an index (`[0].name`),
/// in which case it is a list.
pub fn unflatten(flat: &FlatMap) -> ConfigValue {
    let mut root: Option<Node> = None;

    for (key, value) in flat {
        let path = parse_key(key);
        if path.is_empty() {
            continue;
        }
        match root.as_mut() {
            None => root = Some(build(&path, value.clone())),
            Some(node) => merge_into(node, &path, value.clone(), key),
        }
    }

    root.map_or_else(|| ConfigValue::Map(BTreeMap::new()), |node| finish(node, ""))
}
