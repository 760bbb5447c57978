//! Hand-rolled `ups.conf` parser (spec.md §6.4): INI-like sections, one
//! per driver instance. `#` starts a comment, trailing `\` continues a
//! line, values are unquoted or double-quoted.

use crate::error::{NutError, Result};
use std::path::Path;

/// One `[section]` block: the driver instance name plus its `key=value`
/// (or bare flag) entries in file order.
#[derive(Debug, Clone, Default)]
pub struct ConfSection {
    pub name: String,
    pub entries: Vec<(String, Option<String>)>,
}

impl ConfSection {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }
}

/// Parse the full file text into its sections, joining `\`-continued
/// lines before tokenizing.
pub fn parse_conf(text: &str) -> Result<Vec<ConfSection>> {
    let joined = join_continuations(text);

    let mut sections = Vec::new();
    let mut current: Option<ConfSection> = None;

    for raw_line in joined.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            current = Some(ConfSection {
                name: name.trim().to_string(),
                entries: Vec::new(),
            });
            continue;
        }

        let section = current
            .as_mut()
            .ok_or_else(|| NutError::config("entry found before any [section] header"))?;
        section.entries.push(parse_entry(line)?);
    }

    if let Some(section) = current.take() {
        sections.push(section);
    }

    Ok(sections)
}

/// Load `path` and return the section named `section_name`.
pub fn load_conf(path: &Path, section_name: &str) -> Result<ConfSection> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| NutError::config(format!("reading {}: {e}", path.display())))?;
    parse_conf(&text)?
        .into_iter()
        .find(|s| s.name == section_name)
        .ok_or_else(|| NutError::config(format!("no [{section_name}] section in {}", path.display())))
}

fn join_continuations(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending: Option<String> = None;
    for line in text.lines() {
        let line_content = if let Some(mut buf) = pending.take() {
            buf.push_str(line.trim_start());
            buf
        } else {
            line.to_string()
        };

        if let Some(stripped) = line_content.strip_suffix('\\') {
            pending = Some(format!("{stripped} "));
        } else {
            out.push_str(&line_content);
            out.push('\n');
        }
    }
    if let Some(buf) = pending {
        out.push_str(&buf);
        out.push('\n');
    }
    out
}

fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    for (i, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '#' if !in_quotes => return &line[..i],
            _ => {}
        }
    }
    line
}

fn parse_entry(line: &str) -> Result<(String, Option<String>)> {
    match line.split_once('=') {
        Some((key, value)) => {
            let key = key.trim().to_string();
            let value = value.trim();
            let value = if let Some(inner) = value.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
                inner.to_string()
            } else {
                value.to_string()
            };
            Ok((key, Some(value)))
        }
        None => Ok((line.trim().to_string(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_keys_and_comments() {
        let text = r#"
            # top level comment
            [ups1]
            driver = skel
            port = /dev/ttyUSB0
            desc = "Test UPS"  # trailing comment
            nolock

            [ups2]
            driver = skel
            port = /dev/ttyUSB1
        "#;

        let sections = parse_conf(text).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, "ups1");
        assert_eq!(sections[0].get("driver"), Some("skel"));
        assert_eq!(sections[0].get("desc"), Some("Test UPS"));
        assert!(sections[0].has("nolock"));
        assert_eq!(sections[0].get("nolock"), None);
        assert_eq!(sections[1].get("port"), Some("/dev/ttyUSB1"));
    }

    #[test]
    fn joins_backslash_continuations() {
        let text = "[ups1]\ndesc = a long \\\ndescription\n";
        let sections = parse_conf(text).unwrap();
        assert_eq!(sections[0].get("desc"), Some("a long description"));
    }

    #[test]
    fn entry_before_section_is_an_error() {
        let text = "port = /dev/ttyUSB0\n[ups1]\n";
        assert!(parse_conf(text).is_err());
    }
}
