//! Strict yEnc codec.
//!
//! Encode emits `=ybegin` / `=ypart` / `=yend` framing with a fixed line
//! width; decode verifies the declared size and, when present, the CRC32
//! trailer. Escaping covers NUL, LF, CR and `=` everywhere plus `.` at the
//! start of a line so bodies survive NNTP dot-stuffing untouched.
//!
//! yEnc is an 8-bit encoding; bodies are byte buffers, never UTF-8 text.

use crate::error::{CodecError, Result};

pub const DEFAULT_LINE_WIDTH: usize = 128;

const OFFSET: u8 = 42;
const ESCAPE_OFFSET: u8 = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YencMeta {
    pub name: String,
    pub size: u64,
    pub line_width: usize,
    pub part_begin: Option<u64>,
    pub part_end: Option<u64>,
    pub crc32: Option<u32>,
}

fn needs_escape(byte: u8, at_line_start: bool) -> bool {
    matches!(byte, 0x00 | 0x0A | 0x0D | b'=') || (at_line_start && byte == b'.')
}

/// Encode `data` as one single-part yEnc body.
pub fn encode(data: &[u8], name: &str, line_width: usize) -> Vec<u8> {
    let width = line_width.max(1);
    let mut out = Vec::with_capacity(data.len() + data.len() / width * 2 + 128);
    out.extend_from_slice(
        format!("=ybegin line={} size={} name={}\r\n", width, data.len(), name).as_bytes(),
    );

    let mut column = 0usize;
    for &byte in data {
        let encoded = byte.wrapping_add(OFFSET);
        if needs_escape(encoded, column == 0) {
            out.push(b'=');
            out.push(encoded.wrapping_add(ESCAPE_OFFSET));
            column += 2;
        } else {
            out.push(encoded);
            column += 1;
        }
        if column >= width {
            out.extend_from_slice(b"\r\n");
            column = 0;
        }
    }
    if column > 0 {
        out.extend_from_slice(b"\r\n");
    }

    let mut crc = crc32fast::Hasher::new();
    crc.update(data);
    out.extend_from_slice(
        format!("=yend size={} crc32={:08x}\r\n", data.len(), crc.finalize()).as_bytes(),
    );
    out
}

fn parse_kv(line: &str) -> Vec<(String, String)> {
    // `name=` consumes the rest of the line, names may contain spaces.
    let mut pairs = Vec::new();
    let mut rest = line.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        let after = &rest[eq + 1..];
        if key == "name" {
            pairs.push((key, after.trim_end().to_string()));
            break;
        }
        let end = after.find(' ').unwrap_or(after.len());
        pairs.push((key, after[..end].to_string()));
        rest = after[end..].trim_start();
    }
    pairs
}

fn parse_begin(line: &str, meta: &mut YencMeta) -> Result<()> {
    for (key, value) in parse_kv(line.trim_start_matches("=ybegin")) {
        match key.as_str() {
            "line" => {
                meta.line_width = value
                    .parse()
                    .map_err(|_| CodecError::Framing(format!("bad line width {value:?}")))?
            }
            "size" => {
                meta.size = value
                    .parse()
                    .map_err(|_| CodecError::Framing(format!("bad size {value:?}")))?
            }
            "name" => meta.name = value,
            _ => {}
        }
    }
    Ok(())
}

fn parse_part(line: &str, meta: &mut YencMeta) {
    for (key, value) in parse_kv(line.trim_start_matches("=ypart")) {
        match key.as_str() {
            "begin" => meta.part_begin = value.parse().ok(),
            "end" => meta.part_end = value.parse().ok(),
            _ => {}
        }
    }
}

fn parse_end(line: &str, meta: &mut YencMeta) -> Result<u64> {
    let mut declared = None;
    for (key, value) in parse_kv(line.trim_start_matches("=yend")) {
        match key.as_str() {
            "size" => declared = value.parse().ok(),
            "crc32" | "pcrc32" => {
                let crc = u32::from_str_radix(value.trim(), 16)
                    .map_err(|_| CodecError::Framing(format!("bad crc32 {value:?}")))?;
                meta.crc32 = Some(crc);
            }
            _ => {}
        }
    }
    declared.ok_or_else(|| CodecError::Framing("=yend missing size".into()))
}

/// Decode a framed yEnc body. Returns the payload and the parsed metadata.
pub fn decode(framed: &[u8]) -> Result<(Vec<u8>, YencMeta)> {
    let mut meta = YencMeta::default();
    let mut payload = Vec::new();
    let mut in_body = false;
    let mut saw_end = false;

    for raw_line in framed.split(|&b| b == b'\n') {
        let line = match raw_line.last() {
            Some(b'\r') => &raw_line[..raw_line.len() - 1],
            _ => raw_line,
        };

        if line.starts_with(b"=y") {
            // Framing lines are ASCII.
            let text = String::from_utf8_lossy(line);
            if text.starts_with("=ybegin") {
                parse_begin(&text, &mut meta)?;
                in_body = true;
                continue;
            }
            if text.starts_with("=ypart") {
                if !in_body {
                    return Err(CodecError::Framing("=ypart before =ybegin".into()));
                }
                parse_part(&text, &mut meta);
                continue;
            }
            if text.starts_with("=yend") {
                if !in_body {
                    return Err(CodecError::Framing("=yend before =ybegin".into()));
                }
                let declared = parse_end(&text, &mut meta)?;
                if declared != payload.len() as u64 {
                    return Err(CodecError::SizeMismatch {
                        expected: declared,
                        actual: payload.len() as u64,
                    });
                }
                saw_end = true;
                break;
            }
        }
        if !in_body {
            continue;
        }

        let mut i = 0;
        while i < line.len() {
            let byte = line[i];
            if byte == b'=' {
                let Some(&escaped) = line.get(i + 1) else {
                    return Err(CodecError::Framing("trailing escape at end of line".into()));
                };
                payload.push(escaped.wrapping_sub(ESCAPE_OFFSET).wrapping_sub(OFFSET));
                i += 2;
            } else {
                payload.push(byte.wrapping_sub(OFFSET));
                i += 1;
            }
        }
    }

    if !saw_end {
        return Err(CodecError::Framing("missing =ybegin/=yend framing".into()));
    }
    if meta.size != payload.len() as u64 {
        return Err(CodecError::SizeMismatch {
            expected: meta.size,
            actual: payload.len() as u64,
        });
    }
    if let Some(expected) = meta.crc32 {
        let mut crc = crc32fast::Hasher::new();
        crc.update(&payload);
        if crc.finalize() != expected {
            return Err(CodecError::CrcMismatch);
        }
    }
    Ok((payload, meta))
}
