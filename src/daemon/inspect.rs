//! Read-only inspection of consumed bytes: previews, hex dumps, checksums

use std::fmt::Write;

const BYTES_PER_LINE: usize = 16;
const MAX_DUMP_LINES: usize = 128;

/// Printable rendering of at most `limit` bytes
///
/// Graphic ASCII and spaces are kept, every other byte becomes `\xHH`. If
/// bytes were cut off, a `... [N more bytes]` suffix says how many.
pub fn safe_preview(data: &[u8], limit: usize) -> String {
    if data.is_empty() {
        return "[empty]".to_string();
    }

    let shown = &data[..data.len().min(limit)];
    let mut out = String::with_capacity(shown.len() * 2);
    for &byte in shown {
        if byte.is_ascii_graphic() || byte == b' ' {
            out.push(byte as char);
        } else {
            let _ = write!(out, "\\x{:02X}", byte);
        }
    }
    if data.len() > shown.len() {
        let _ = write!(out, "... [{} more bytes]", data.len() - shown.len());
    }
    out
}

/// Classic offset / hex / ASCII dump, 16 bytes per line
pub fn hex_dump(data: &[u8]) -> String {
    if data.is_empty() {
        return "  [empty data]\n".to_string();
    }

    let mut out = String::new();
    for (line, chunk) in data.chunks(BYTES_PER_LINE).take(MAX_DUMP_LINES).enumerate() {
        let _ = write!(out, "  {:04x}: ", line * BYTES_PER_LINE);
        for i in 0..BYTES_PER_LINE {
            match chunk.get(i) {
                Some(byte) => {
                    let _ = write!(out, "{:02x} ", byte);
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  ");
        for &byte in chunk {
            out.push(if byte.is_ascii_graphic() { byte as char } else { '.' });
        }
        out.push('\n');
    }

    let limit = BYTES_PER_LINE * MAX_DUMP_LINES;
    if data.len() > limit {
        let _ = writeln!(out, "  [output truncated, {} more bytes not shown]", data.len() - limit);
    }
    out
}

/// Result of inspecting one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub size: usize,
    pub crc32: u32,
    pub preview: String,
}

impl Verification {
    /// Inspect `data` without modifying it
    pub fn inspect(data: &[u8], preview_len: usize) -> Self {
        Self {
            size: data.len(),
            crc32: crc32fast::hash(data),
            preview: safe_preview(data, preview_len),
        }
    }
}
