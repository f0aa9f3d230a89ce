//! BER reader and writer for the LDAP subset used by the gateway.
//!
//! The reader operates on one complete frame (the connection handler frames
//! messages before decoding); the writer builds one response message with
//! length back-patching on sequence close. String encoding depends on the
//! negotiated LDAP version: UTF-8 for v3, ISO-8859-1 for v2.

use crate::error::{GatewayError, Result};
use std::io::{Cursor, Read};

/// Universal SEQUENCE with the constructed bit set.
pub const ASN_SEQUENCE: u8 = 0x30;
pub const ASN_SET: u8 = 0x31;
pub const ASN_INTEGER: u8 = 0x02;
pub const ASN_ENUMERATED: u8 = 0x0A;
pub const ASN_BOOLEAN: u8 = 0x01;
pub const ASN_OCTET_STRING: u8 = 0x04;
/// Context [0] IMPLICIT, used for the simple-bind password.
pub const ASN_CONTEXT: u8 = 0x80;

pub struct BerReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| GatewayError::protocol("unexpected end of message"))?;
        Ok(buf[0])
    }

    fn read_length(&mut self) -> Result<usize> {
        let first = self.read_byte()?;
        if (first & 0x80) == 0 {
            return Ok(first as usize);
        }
        let length_bytes = (first & 0x7F) as usize;
        if length_bytes == 0 {
            return Err(GatewayError::protocol("indefinite length not supported"));
        }
        if length_bytes > 4 {
            return Err(GatewayError::protocol(format!(
                "length too large: {} bytes",
                length_bytes
            )));
        }
        let mut length = 0usize;
        for _ in 0..length_bytes {
            length = (length << 8) | self.read_byte()? as usize;
        }
        if length > self.bytes_left() {
            return Err(GatewayError::protocol(format!(
                "length {} overruns buffer ({} bytes left)",
                length,
                self.bytes_left()
            )));
        }
        Ok(length)
    }

    fn read_raw(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.bytes_left() < n {
            return Err(GatewayError::protocol(format!(
                "truncated value: need {} bytes, {} left",
                n,
                self.bytes_left()
            )));
        }
        let mut buf = vec![0u8; n];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| GatewayError::protocol("unexpected end of message"))?;
        Ok(buf)
    }

    /// Consume a constructed value header, returning its tag and declared
    /// content length. The LDAP layer uses the tag to dispatch operations
    /// and filter types.
    pub fn parse_seq(&mut self) -> Result<(u8, usize)> {
        let tag = self.read_byte()?;
        let len = self.read_length()?;
        Ok((tag, len))
    }

    fn parse_int_with_tag(&mut self, expected: u8) -> Result<i32> {
        let tag = self.read_byte()?;
        if tag != expected {
            return Err(GatewayError::protocol(format!(
                "expected tag 0x{:02X}, got 0x{:02X}",
                expected, tag
            )));
        }
        let length = self.read_length()?;
        if length == 0 || length > 4 {
            return Err(GatewayError::protocol(format!(
                "invalid integer length: {}",
                length
            )));
        }
        let bytes = self.read_raw(length)?;
        let mut value = 0i32;
        for &b in &bytes {
            value = (value << 8) | b as i32;
        }
        // sign extension for short encodings
        if length < 4 && (bytes[0] & 0x80) != 0 {
            value |= !0 << (length * 8);
        }
        Ok(value)
    }

    pub fn parse_int(&mut self) -> Result<i32> {
        self.parse_int_with_tag(ASN_INTEGER)
    }

    pub fn parse_enumeration(&mut self) -> Result<i32> {
        self.parse_int_with_tag(ASN_ENUMERATED)
    }

    pub fn parse_boolean(&mut self) -> Result<bool> {
        let tag = self.read_byte()?;
        if tag != ASN_BOOLEAN {
            return Err(GatewayError::protocol(format!(
                "expected BOOLEAN, got 0x{:02X}",
                tag
            )));
        }
        let length = self.read_length()?;
        if length != 1 {
            return Err(GatewayError::protocol("boolean must be 1 byte"));
        }
        Ok(self.read_byte()? != 0)
    }

    pub fn parse_string(&mut self, utf8: bool) -> Result<String> {
        self.parse_string_with_tag(ASN_OCTET_STRING, utf8)
    }

    /// Parse a string value carried under an arbitrary tag (context-tagged
    /// bind password, PRESENT filter attribute, substring components).
    pub fn parse_string_with_tag(&mut self, expected: u8, utf8: bool) -> Result<String> {
        let tag = self.read_byte()?;
        if tag != expected {
            return Err(GatewayError::protocol(format!(
                "expected tag 0x{:02X}, got 0x{:02X}",
                expected, tag
            )));
        }
        let length = self.read_length()?;
        let bytes = self.read_raw(length)?;
        decode_string(&bytes, utf8)
    }

    /// Consume n raw content bytes (skipping unsupported constructs whose
    /// declared length is known).
    pub fn parse_raw(&mut self, n: usize) -> Result<Vec<u8>> {
        self.read_raw(n)
    }

    pub fn peek_byte(&mut self) -> Result<u8> {
        let pos = self.cursor.position() as usize;
        self.cursor
            .get_ref()
            .get(pos)
            .copied()
            .ok_or_else(|| GatewayError::protocol("unexpected end of message"))
    }

    pub fn bytes_left(&self) -> usize {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().len().saturating_sub(pos)
    }

    pub fn parse_position(&self) -> usize {
        self.cursor.position() as usize
    }
}

fn decode_string(bytes: &[u8], utf8: bool) -> Result<String> {
    if utf8 {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| GatewayError::protocol("invalid UTF-8 string"))
    } else {
        // ISO-8859-1: every byte maps to the code point of the same value
        Ok(bytes.iter().map(|&b| b as char).collect())
    }
}

fn encode_string_bytes(s: &str, utf8: bool) -> Vec<u8> {
    if utf8 {
        s.as_bytes().to_vec()
    } else {
        s.chars()
            .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
            .collect()
    }
}

pub struct BerWriter {
    buffer: Vec<u8>,
    seq_offsets: Vec<usize>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            seq_offsets: Vec::new(),
        }
    }

    /// Open a constructed value: write the tag and a one-byte length
    /// placeholder, remembering the placeholder offset for end_seq.
    pub fn begin_seq(&mut self, tag: u8) {
        self.buffer.push(tag);
        self.seq_offsets.push(self.buffer.len());
        self.buffer.push(0);
    }

    /// Close the innermost open sequence, back-patching its length. A
    /// long-form length replaces the one-byte placeholder and shifts the
    /// already-written payload right.
    pub fn end_seq(&mut self) {
        let placeholder = self
            .seq_offsets
            .pop()
            .expect("end_seq without matching begin_seq");
        let payload = self.buffer.len() - placeholder - 1;
        let octets = length_octets(payload);
        if let [short] = octets.as_slice() {
            self.buffer[placeholder] = *short;
        } else {
            self.buffer.splice(placeholder..=placeholder, octets);
        }
    }

    fn write_length(&mut self, length: usize) {
        self.buffer.extend_from_slice(&length_octets(length));
    }

    fn encode_int_with_tag(&mut self, tag: u8, value: i32) {
        self.buffer.push(tag);
        let bytes = value.to_be_bytes();
        // minimal two's complement encoding
        let mut start = 0;
        while start < 3
            && ((bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0))
        {
            start += 1;
        }
        let content = &bytes[start..];
        self.write_length(content.len());
        self.buffer.extend_from_slice(content);
    }

    pub fn encode_int(&mut self, value: i32) {
        self.encode_int_with_tag(ASN_INTEGER, value);
    }

    pub fn encode_enumerated(&mut self, value: i32) {
        self.encode_int_with_tag(ASN_ENUMERATED, value);
    }

    pub fn encode_string(&mut self, s: &str, utf8: bool) {
        self.encode_string_with_tag(ASN_OCTET_STRING, s, utf8);
    }

    pub fn encode_string_with_tag(&mut self, tag: u8, s: &str, utf8: bool) {
        self.buffer.push(tag);
        let bytes = encode_string_bytes(s, utf8);
        self.write_length(bytes.len());
        self.buffer.extend_from_slice(&bytes);
    }

    pub fn encode_boolean(&mut self, value: bool) {
        self.buffer.push(ASN_BOOLEAN);
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for BerWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// BER length octets: short form below 128, otherwise 0x80 | count
/// followed by the value big-endian with leading zeroes trimmed.
fn length_octets(length: usize) -> Vec<u8> {
    if length < 128 {
        return vec![length as u8];
    }
    let raw = (length as u32).to_be_bytes();
    let skip = raw.iter().take_while(|&&b| b == 0).count();
    let mut octets = Vec::with_capacity(1 + raw.len() - skip);
    octets.push(0x80 | (raw.len() - skip) as u8);
    octets.extend_from_slice(&raw[skip..]);
    octets
}
