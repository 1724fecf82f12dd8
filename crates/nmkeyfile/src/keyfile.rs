//! Group/key text format used for profiles, sidecars and generated files.
//!
//! ```text
//! # comment
//! [connection]
//! id=Home
//! uuid=2f2a5a5e-3c4b-4a8b-9e41-7d1c2a9a0b11
//!
//! [wifi]
//! ssid=home net
//! ```
//!
//! Comments and blank lines are kept in place so a file can be edited and
//! written back without losing them. Values are stored unescaped in memory and
//! escaped on output (`\s` for a leading space, `\n`, `\t`, `\r`, `\\`).

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyFileError {
    #[error("line {line}: key/value pair outside of any group")]
    EntryOutsideGroup { line: usize },

    #[error("line {line}: malformed group header")]
    InvalidGroup { line: usize },

    #[error("line {line}: expected key=value")]
    InvalidEntry { line: usize },

    #[error("line {line}: invalid escape sequence in value")]
    InvalidEscape { line: usize },

    #[error("value for {group}.{key} is not a boolean: {value}")]
    InvalidBoolean {
        group: String,
        key: String,
        value: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KeyFileError>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// Comment or blank line, stored verbatim
    Comment(String),
    Entry { key: String, value: String },
}

impl Line {
    fn is_blank(&self) -> bool {
        matches!(self, Line::Comment(c) if c.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Group {
    name: String,
    lines: Vec<Line>,
}

/// An ordered set of groups, each an ordered set of key/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFile {
    leading: Vec<String>,
    groups: Vec<Group>,
}

impl KeyFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse text. Duplicate groups are merged and a repeated key keeps the last value.
    pub fn parse(text: &str) -> Result<Self> {
        let mut kf = KeyFile::new();
        let mut current: Option<usize> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let trimmed = raw.trim_start();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                match current {
                    Some(g) => kf.groups[g].lines.push(Line::Comment(raw.to_string())),
                    None => kf.leading.push(raw.to_string()),
                }
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix('[') {
                let name = rest
                    .trim_end()
                    .strip_suffix(']')
                    .filter(|n| valid_group_name(n))
                    .ok_or(KeyFileError::InvalidGroup { line })?;
                current = Some(kf.group_index_or_insert(name));
                continue;
            }

            let group = current.ok_or(KeyFileError::EntryOutsideGroup { line })?;
            let (key, value) = trimmed
                .split_once('=')
                .ok_or(KeyFileError::InvalidEntry { line })?;
            let key = key.trim_end();
            if key.is_empty() {
                return Err(KeyFileError::InvalidEntry { line });
            }
            let value = unescape(value.trim_start()).ok_or(KeyFileError::InvalidEscape { line })?;
            kf.groups[group].set(key, value);
        }

        Ok(kf)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.name.as_str())
    }

    /// Key/value pairs of `group` in file order.
    pub fn entries<'a>(&'a self, group: &str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.group(group)
            .into_iter()
            .flat_map(|g| g.lines.iter())
            .filter_map(|l| match l {
                Line::Entry { key, value } => Some((key.as_str(), value.as_str())),
                Line::Comment(_) => None,
            })
    }

    pub fn get_string(&self, group: &str, key: &str) -> Option<&str> {
        self.entries(group).find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// `true`/`false` (also `1`/`0`); a missing key is `Ok(None)`.
    pub fn get_boolean(&self, group: &str, key: &str) -> Result<Option<bool>> {
        match self.get_string(group, key) {
            None => Ok(None),
            Some("true") | Some("1") => Ok(Some(true)),
            Some("false") | Some("0") => Ok(Some(false)),
            Some(other) => Err(KeyFileError::InvalidBoolean {
                group: group.to_string(),
                key: key.to_string(),
                value: other.to_string(),
            }),
        }
    }

    pub fn set_string(&mut self, group: &str, key: &str, value: &str) {
        let idx = self.group_index_or_insert(group);
        self.groups[idx].set(key, value.to_string());
    }

    pub fn set_boolean(&mut self, group: &str, key: &str, value: bool) {
        self.set_string(group, key, if value { "true" } else { "false" });
    }

    /// Remove `group.key`. Returns whether it was present.
    pub fn remove_key(&mut self, group: &str, key: &str) -> bool {
        let Some(g) = self.groups.iter_mut().find(|g| g.name == group) else {
            return false;
        };
        let before = g.lines.len();
        g.lines
            .retain(|l| !matches!(l, Line::Entry { key: k, .. } if k == key));
        g.lines.len() != before
    }

    /// Serialize back to text.
    pub fn to_data(&self) -> String {
        let mut out = String::new();
        for c in &self.leading {
            out.push_str(c);
            out.push('\n');
        }

        let mut need_separator = false;
        for group in &self.groups {
            if need_separator {
                out.push('\n');
            }
            let _ = writeln!(out, "[{}]", group.name);
            for line in &group.lines {
                match line {
                    Line::Comment(c) => {
                        out.push_str(c);
                        out.push('\n');
                    }
                    Line::Entry { key, value } => {
                        let _ = writeln!(out, "{}={}", key, escape(value));
                    }
                }
            }
            need_separator = !group.lines.last().is_some_and(Line::is_blank);
        }
        out
    }

    fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    fn group_index_or_insert(&mut self, name: &str) -> usize {
        if let Some(idx) = self.groups.iter().position(|g| g.name == name) {
            return idx;
        }
        self.groups.push(Group {
            name: name.to_string(),
            lines: Vec::new(),
        });
        self.groups.len() - 1
    }
}

impl Group {
    fn set(&mut self, key: &str, value: String) {
        for line in self.lines.iter_mut() {
            if let Line::Entry { key: k, value: v } = line {
                if k == key {
                    *v = value;
                    return;
                }
            }
        }
        // New keys go after the last entry, ahead of trailing comments.
        let at = self
            .lines
            .iter()
            .rposition(|l| matches!(l, Line::Entry { .. }))
            .map_or(0, |i| i + 1);
        self.lines.insert(
            at,
            Line::Entry {
                key: key.to_string(),
                value,
            },
        );
    }
}

/// Whether `[name]` parses back as a group called `name`.
pub fn valid_group_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['[', ']']) && !name.chars().any(char::is_control)
}

/// Whether `key=...` parses back as an entry keyed `key`.
pub fn valid_key_name(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with(['[', '#'])
        && !key.contains('=')
        && !key.chars().any(char::is_control)
        && key.trim() == key
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        match c {
            ' ' if i == 0 => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            's' => out.push(' '),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '\\' => out.push('\\'),
            _ => return None,
        }
    }
    Some(out)
}
