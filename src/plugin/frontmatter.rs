//! Leading metadata block of a plugin source file
//!
//! Plugin authors describe their file with `key: value` lines either inside
//! a leading `"""` / `'''` block or in a run of leading `#` / `//` comments:
//!
//! ```text
//! """
//! title: Weather Pipe
//! author: someone
//! requirements: requests, pydantic
//! """
//! ```

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::LoadError;

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct SourceMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl SourceMetadata {
    fn insert(&mut self, key: &str, value: String) {
        match key {
            "title" => self.title = Some(value),
            "author" => self.author = Some(value),
            "version" => self.version = Some(value),
            "license" => self.license = Some(value),
            "description" => self.description = Some(value),
            "requirements" => {
                self.requirements = value
                    .split(',')
                    .map(str::trim)
                    .filter(|requirement| !requirement.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            _ => {
                self.extra.insert(key.to_string(), value);
            }
        }
    }
}

fn key_value_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_\-]*)\s*:\s*(.*?)\s*$").expect("valid regex")
    })
}

/// Extract the metadata block.
///
/// A file without a block yields empty metadata; an unterminated quoted block
/// is a [`LoadError::Discovery`], which callers tolerate.
pub fn parse(source: &str) -> Result<SourceMetadata, LoadError> {
    let mut lines = source
        .lines()
        .skip_while(|line| line.trim().is_empty() || line.starts_with("#!"))
        .peekable();

    let Some(first) = lines.peek().copied() else {
        return Ok(SourceMetadata::default());
    };
    let first = first.trim_start();

    let block: Vec<String> = if let Some(delimiter) = ["\"\"\"", "'''"]
        .into_iter()
        .find(|delimiter| first.starts_with(delimiter))
    {
        let opening = lines.next().unwrap_or_default().trim_start();
        let rest = &opening[delimiter.len()..];
        if let Some(end) = rest.find(delimiter) {
            vec![rest[..end].to_string()]
        } else {
            let mut collected = vec![rest.to_string()];
            let mut closed = false;
            for line in lines {
                if let Some(end) = line.find(delimiter) {
                    collected.push(line[..end].to_string());
                    closed = true;
                    break;
                }
                collected.push(line.to_string());
            }
            if !closed {
                return Err(LoadError::Discovery {
                    reason: format!("unterminated {delimiter} block"),
                });
            }
            collected
        }
    } else {
        lines
            .map_while(|line| {
                let trimmed = line.trim_start();
                trimmed
                    .strip_prefix("//")
                    .or_else(|| trimmed.strip_prefix('#'))
                    .map(str::to_string)
            })
            .collect()
    };

    let mut metadata = SourceMetadata::default();
    for line in &block {
        if let Some(captures) = key_value_line().captures(line) {
            metadata.insert(&captures[1].to_lowercase(), captures[2].to_string());
        }
    }
    Ok(metadata)
}
