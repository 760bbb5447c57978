//! Line-oriented wire serialization shared between `DState` dumps/deltas
//! and the control-socket parser (spec.md §4.2, §6.1).

use super::variable::FlagSet;

/// One line of the dstate notification protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireLine {
    SetInfo { name: String, value: String },
    DelInfo { name: String },
    SetFlags { name: String, flags: FlagSet },
    SetAux { name: String, aux: u32 },
    AddEnum { name: String, value: String },
    DelEnum { name: String, value: String },
    AddRange { name: String, lo: i64, hi: i64 },
    AddCmd { name: String },
    DelCmd { name: String },
    DataOk,
    DataStale,
    DumpDone,
}

impl WireLine {
    /// Render as the exact line sent over the control socket, without the
    /// trailing newline.
    pub fn to_wire(&self) -> String {
        match self {
            WireLine::SetInfo { name, value } => {
                format!("SETINFO {name} \"{}\"", escape_value(value))
            }
            WireLine::DelInfo { name } => format!("DELINFO {name}"),
            WireLine::SetFlags { name, flags } => {
                let tokens = flags.to_wire_tokens().join(" ");
                if tokens.is_empty() {
                    format!("SETFLAGS {name}")
                } else {
                    format!("SETFLAGS {name} {tokens}")
                }
            }
            WireLine::SetAux { name, aux } => format!("SETAUX {name} {aux}"),
            WireLine::AddEnum { name, value } => {
                format!("ADDENUM {name} \"{}\"", escape_value(value))
            }
            WireLine::DelEnum { name, value } => {
                format!("DELENUM {name} \"{}\"", escape_value(value))
            }
            WireLine::AddRange { name, lo, hi } => format!("ADDRANGE {name} {lo} {hi}"),
            WireLine::AddCmd { name } => format!("ADDCMD {name}"),
            WireLine::DelCmd { name } => format!("DELCMD {name}"),
            WireLine::DataOk => "DATAOK".to_string(),
            WireLine::DataStale => "DATASTALE".to_string(),
            WireLine::DumpDone => "DUMPDONE".to_string(),
        }
    }
}

/// Escape a value for the double-quoted wire format: backslash-escape `"`
/// and `\`, hex-escape control bytes (< 0x20), pass UTF-8 >= 0x80 through
/// unchanged (SPEC_FULL.md's resolution of the spec's open byte-encoding
/// question).
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape_value`]. Returns `None` on malformed escapes
/// (dangling backslash, bad hex digits).
pub fn unescape_value(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                let next = *bytes.get(i + 1)?;
                match next {
                    b'"' => {
                        out.push(b'"');
                        i += 2;
                    }
                    b'\\' => {
                        out.push(b'\\');
                        i += 2;
                    }
                    b'x' => {
                        let hex = escaped.get(i + 2..i + 4)?;
                        let value = u8::from_str_radix(hex, 16).ok()?;
                        out.push(value);
                        i += 4;
                    }
                    _ => return None,
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_handles_quotes_backslash_and_control_bytes() {
        assert_eq!(escape_value("plain"), "plain");
        assert_eq!(escape_value("a\"b"), "a\\\"b");
        assert_eq!(escape_value("a\\b"), "a\\\\b");
        assert_eq!(escape_value("a\tb"), "a\\x09b");
    }

    #[test]
    fn escape_passes_utf8_high_bytes_through() {
        let value = "caf\u{e9}";
        assert_eq!(escape_value(value), value);
    }

    #[test]
    fn unescape_inverts_escape() {
        for raw in ["plain", "a\"b", "a\\b", "a\tb\x01c"] {
            let escaped = escape_value(raw);
            assert_eq!(unescape_value(&escaped).as_deref(), Some(raw));
        }
    }

    #[test]
    fn unescape_rejects_dangling_backslash() {
        assert_eq!(unescape_value("a\\"), None);
    }
}
