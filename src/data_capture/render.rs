//! Turning captured bytes into something an operator can read.

use super::types::{DataPacket, DataType, Direction};
use chrono::Utc;
use std::fmt::Write;

/// Share of printable characters above which a payload counts as text.
pub const TEXT_THRESHOLD: f64 = 0.7;

const BYTES_PER_LINE: usize = 16;

/// Builds [`DataPacket`]s out of raw captured chunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataProcessor;

impl DataProcessor {
    pub fn new() -> Self {
        Self
    }

    pub fn process(&self, bytes: &[u8], direction: Direction) -> DataPacket {
        DataPacket {
            timestamp: Utc::now(),
            direction,
            raw_data: bytes.to_vec(),
            data_type: detect(bytes),
            display_text: display_text(bytes),
        }
    }
}

pub fn detect(bytes: &[u8]) -> DataType {
    if is_text(bytes) {
        DataType::Text
    } else {
        DataType::Binary
    }
}

fn is_text(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return true;
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        let total = text.chars().count();
        let printable = text
            .chars()
            .filter(|c| c.is_whitespace() || !c.is_control())
            .count();
        if ratio(printable, total) >= TEXT_THRESHOLD {
            return true;
        }
    }

    let printable = bytes
        .iter()
        .filter(|b| is_printable_ascii(**b) || matches!(b, b'\t' | b'\n' | b'\r'))
        .count();
    ratio(printable, bytes.len()) >= TEXT_THRESHOLD
}

fn ratio(part: usize, total: usize) -> f64 {
    part as f64 / total as f64
}

fn is_printable_ascii(b: u8) -> bool {
    (0x20..=0x7E).contains(&b)
}

/// Renders bytes as text, escaping anything a terminal would choke on.
///
/// Valid UTF-8 keeps its characters; otherwise every byte maps to the Latin-1 code point of
/// the same value. Control characters other than tab, LF and CR become `\xNN`.
pub fn display_text(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());

    match std::str::from_utf8(bytes) {
        Ok(text) => {
            for c in text.chars() {
                if c.is_control() && !matches!(c, '\t' | '\n' | '\r') {
                    push_escaped(&mut out, c as u32);
                } else {
                    out.push(c);
                }
            }
        }
        Err(_) => {
            for &b in bytes {
                match b {
                    b'\t' | b'\n' | b'\r' => out.push(b as char),
                    0x20..=0x7E | 0xA0..=0xFF => out.push(char::from(b)),
                    _ => push_escaped(&mut out, b as u32),
                }
            }
        }
    }

    out
}

fn push_escaped(out: &mut String, code: u32) {
    let _ = write!(out, "\\x{:02X}", code);
}

/// Classic 16-bytes-per-line hex dump with an ASCII sidebar.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();

    for (line, chunk) in bytes.chunks(BYTES_PER_LINE).enumerate() {
        let _ = write!(out, "{:04X}: ", line * BYTES_PER_LINE);

        for i in 0..BYTES_PER_LINE {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{:02X} ", b);
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }

        out.push(' ');
        out.extend(chunk.iter().map(|&b| {
            if is_printable_ascii(b) {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }

    out
}

pub fn hex_compact(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02X}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        assert_eq!(detect(b""), DataType::Text);
        assert_eq!(detect(b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n"), DataType::Text);
        assert_eq!(detect("grüezi mitenand".as_bytes()), DataType::Text);
        assert_eq!(detect(&[0x00, 0x01, 0x02, 0x03, 0xFF, 0xFE, 0x10, 0x80]), DataType::Binary);
        // Mostly ASCII with a stray invalid byte still reads as text.
        assert_eq!(detect(b"hello world\xFF"), DataType::Text);
    }

    #[test]
    fn test_display_text_utf8() {
        assert_eq!(display_text(b"PING\r\n"), "PING\r\n");
        assert_eq!(display_text("héllo".as_bytes()), "héllo");
        assert_eq!(display_text(b"a\x00b\x1Bc\x7F"), "a\\x00b\\x1Bc\\x7F");
    }

    #[test]
    fn test_display_text_latin1_fallback() {
        assert_eq!(display_text(b"caf\xE9"), "café");
        assert_eq!(display_text(b"\xFF\x81\x00ok"), "ÿ\\x81\\x00ok");
    }

    #[test]
    fn test_hex_dump_layout() {
        let dump = hex_dump(b"Hello");
        assert!(dump.starts_with("0000: 48 65 6C 6C 6F "));
        assert!(dump.ends_with(" Hello\n"));

        let data: Vec<u8> = (0u8..20).collect();
        let dump = hex_dump(&data);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000: 00 01 02 03 04 05 06 07  08 09"));
        assert!(lines[1].starts_with("0010: 10 11 12 13 "));
        assert_eq!(lines[0].len(), lines[1].len() + 12);
    }

    #[test]
    fn test_hex_compact() {
        assert_eq!(hex_compact(&[0xDE, 0xAD, 0x01]), "DEAD01");
        assert_eq!(hex_compact(&[]), "");
        assert_eq!(hex_dump(&[]), "");
    }

    #[test]
    fn test_process() {
        let packet = DataProcessor::new().process(b"PONG", Direction::TargetToClient);
        assert_eq!(packet.raw_data, b"PONG");
        assert_eq!(packet.direction, Direction::TargetToClient);
        assert_eq!(packet.data_type, DataType::Text);
        assert_eq!(packet.display_text, "PONG");
    }
}
