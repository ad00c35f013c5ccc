//! `KEY=value` documents
//!
//! Both the host state file and the workload configuration file use this
//! format. Updates are keyed upserts over the parsed document, so comments,
//! ordering and keys the provisioner does not own survive every rewrite.

#[derive(Debug, Clone, PartialEq)]
enum Line {
    Entry { key: String, value: String },
    /// Comments, blank lines and anything that is not an assignment
    Verbatim(String),
}

/// Parsed `KEY=value` file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvFile {
    lines: Vec<Line>,
}

impl EnvFile {
    /// Parse a document. Never fails: lines that are not assignments are kept verbatim.
    pub fn parse(text: &str) -> Self {
        let lines = text.lines().map(parse_line).collect();
        Self { lines }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            Line::Entry { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Upsert: the first assignment of `key` is updated in place and later
    /// duplicates are dropped; a missing key is appended.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let mut seen = false;
        self.lines.retain_mut(|line| match line {
            Line::Entry { key: k, value: v } if k == key => {
                if seen {
                    false
                } else {
                    seen = true;
                    *v = value.clone();
                    true
                }
            }
            _ => true,
        });
        if !seen {
            self.lines.push(Line::Entry {
                key: key.to_string(),
                value,
            });
        }
    }

    /// Remove every assignment of `key`. Returns whether anything was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.lines.len();
        self.lines
            .retain(|line| !matches!(line, Line::Entry { key: k, .. } if k == key));
        before != self.lines.len()
    }

    /// Assigned keys in document order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            Line::Entry { key, .. } => Some(key.as_str()),
            Line::Verbatim(_) => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.keys().next().is_none()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry { key, value } => {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(value);
                }
                Line::Verbatim(text) => out.push_str(text),
            }
            out.push('\n');
        }
        out
    }
}

fn parse_line(raw: &str) -> Line {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Line::Verbatim(raw.to_string());
    }
    let assignment = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    match assignment.split_once('=') {
        Some((key, value)) if is_valid_key(key.trim()) => Line::Entry {
            key: key.trim().to_string(),
            value: unquote(value.trim()).to_string(),
        },
        _ => Line::Verbatim(raw.to_string()),
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
