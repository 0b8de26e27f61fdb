// SPDX-License-Identifier: GPL-3.0-or-later
//! Wire framing for the data socket: TLV command frames, length-value items inside a parsed
//! body, the named-item sub-framing used by START, and the legacy hex line format.

use crate::bytestream::ByteStream;
use crate::error::{ExecutorError, Result};
use std::io::{Read, Write};

/// Read one `(type: u8, length: u32, body)` frame. Any short read or EOF mid-frame is fatal
/// for the current request.
pub fn recv_tlv<R: Read>(stream: &mut R) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header)?;
    let ty = header[0];
    let length = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body)?;
    Ok((ty, body))
}

pub fn send_all<W: Write>(stream: &mut W, bytes: &[u8]) -> Result<()> {
    stream.write_all(bytes)?;
    Ok(())
}

/// Read a `u32` length followed by that many bytes from a parsed byte stream.
pub fn parse_lv(ds: &mut ByteStream) -> Result<Vec<u8>> {
    let len = ds.read_u32()? as usize;
    ds.read_vec(len)
}

/// A single named item from a START body: `u8 name_length, name bytes, u32 item_length, item
/// bytes`. `max_item_sz` permits items *equal* to the maximum, rejecting only those strictly
/// larger — a deliberately preserved quirk of the original `max_item_sz < item_sz` check.
pub fn recv_item_by_name(ds: &mut ByteStream, max_item_sz: usize) -> Result<(String, Vec<u8>)> {
    let name_len = ds.read_u8()? as usize;
    let name_bytes = ds.read_vec(name_len)?;
    let name = String::from_utf8(name_bytes)
        .map_err(|e| ExecutorError::Marshal(format!("named item has non-utf8 name: {e}")))?;
    let item_len = ds.read_u32()? as usize;
    if max_item_sz < item_len {
        return Err(ExecutorError::Marshal(format!(
            "named item '{name}' of size {item_len} exceeds maximum {max_item_sz}"
        )));
    }
    let item = ds.read_vec(item_len)?;
    Ok((name, item))
}

/// Read a hex-digit-encoded line terminated by `\n`; a legacy path with no live caller among
/// the current backend drivers, kept for callers of the historical QSEE interact wire format.
pub fn read_hex_line<R: Read>(stream: &mut R) -> Result<Vec<u8>> {
    let mut hex = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        hex.push(byte[0]);
    }
    decode_hex(&hex)
}

pub fn write_hex<W: Write>(stream: &mut W, bytes: &[u8]) -> Result<()> {
    let mut line = encode_hex(bytes);
    line.push(b'\n');
    send_all(stream, &line)
}

fn encode_hex(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(hex_digit(b >> 4));
        out.push(hex_digit(b & 0xf));
    }
    out
}

fn hex_digit(nibble: u8) -> u8 {
    match nibble {
        0..=9 => b'0' + nibble,
        10..=15 => b'a' + (nibble - 10),
        _ => unreachable!("nibble out of range"),
    }
}

fn decode_hex(hex: &[u8]) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(ExecutorError::Marshal("odd-length hex line".into()));
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for pair in hex.chunks(2) {
        let hi = hex_value(pair[0])?;
        let lo = hex_value(pair[1])?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

fn hex_value(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(ExecutorError::Marshal(format!(
            "non-hex character '{}' in hex line",
            c as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn recv_tlv_reads_exact_frame() {
        let mut input = vec![2u8];
        input.extend_from_slice(&3u32.to_le_bytes());
        input.extend_from_slice(b"abc");
        let mut cursor = Cursor::new(input);
        let (ty, body) = recv_tlv(&mut cursor).unwrap();
        assert_eq!(ty, 2);
        assert_eq!(body, b"abc");
    }

    #[test]
    fn recv_tlv_fails_on_short_body() {
        let mut input = vec![2u8];
        input.extend_from_slice(&5u32.to_le_bytes());
        input.extend_from_slice(b"ab");
        let mut cursor = Cursor::new(input);
        assert!(recv_tlv(&mut cursor).is_err());
    }

    #[test]
    fn parse_lv_reads_length_then_body() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(b"data");
        let mut ds = ByteStream::from_vec(buf);
        assert_eq!(parse_lv(&mut ds).unwrap(), b"data");
    }

    #[test]
    fn named_item_permits_item_equal_to_max_size() {
        let mut buf = Vec::new();
        buf.push(4u8);
        buf.extend_from_slice(b"uuid");
        buf.extend_from_slice(&16u32.to_le_bytes());
        buf.extend_from_slice(&[0xAB; 16]);
        let mut ds = ByteStream::from_vec(buf);
        let (name, item) = recv_item_by_name(&mut ds, 16).unwrap();
        assert_eq!(name, "uuid");
        assert_eq!(item.len(), 16);
    }

    #[test]
    fn named_item_rejects_item_larger_than_max_size() {
        let mut buf = Vec::new();
        buf.push(4u8);
        buf.extend_from_slice(b"uuid");
        buf.extend_from_slice(&17u32.to_le_bytes());
        buf.extend_from_slice(&[0xAB; 17]);
        let mut ds = ByteStream::from_vec(buf);
        assert!(recv_item_by_name(&mut ds, 16).is_err());
    }

    #[test]
    fn hex_round_trips() {
        let mut out = Vec::new();
        write_hex(&mut out, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(out, b"deadbeef\n");
        let mut cursor = Cursor::new(out);
        let decoded = read_hex_line(&mut cursor).unwrap();
        assert_eq!(decoded, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn hex_rejects_odd_length() {
        let mut cursor = Cursor::new(b"abc\n".to_vec());
        assert!(read_hex_line(&mut cursor).is_err());
    }
}
