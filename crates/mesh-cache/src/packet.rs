//! Binary packet layout for stored keys and values.
//!
//! All integers are big-endian `i32`, booleans a single byte (0 or 1).
//!
//! ```text
//! value: [len][payload][compressed]
//! key:   [len1][part1][len2][part2][compressed]
//! ```
//!
//! A key's `part1` is the text before the first `:` (normally the action
//! name) and is never compressed, so a store can report key prefixes
//! without inflating anything. `part2` and value payloads are zlib
//! compressed once they exceed `compress_above` bytes.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::CodecError;
use crate::format::Format;
use mesh_types::{Value, KEY_SEPARATOR};

/// Encodes and decodes key and value packets.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    format: Format,
    compress_above: usize,
}

/// A decoded key packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    /// Text before the first `:`.
    pub prefix: String,
    /// Text after the first `:`, if the key had a non-empty remainder.
    pub rest: Option<String>,
}

impl DecodedKey {
    /// Reassembles the original key.
    pub fn full(&self) -> String {
        match &self.rest {
            Some(rest) => format!("{}{}{}", self.prefix, KEY_SEPARATOR, rest),
            None => self.prefix.clone(),
        }
    }
}

impl PacketCodec {
    /// Creates a codec. `compress_above == 0` disables compression.
    pub fn new(format: Format, compress_above: usize) -> Self {
        Self {
            format,
            compress_above,
        }
    }

    /// The value serialization format.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Serializes, optionally compresses, and frames a value.
    pub fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let payload = self.format.serialize(value)?;
        let (payload, compressed) = self.maybe_compress(payload)?;
        let mut out = Vec::with_capacity(payload.len() + 5);
        write_block(&mut out, &payload)?;
        out.push(compressed as u8);
        Ok(out)
    }

    /// Reverses [`PacketCodec::encode_value`]. A zero-length payload
    /// decodes to `null`.
    pub fn decode_value(&self, packet: &[u8]) -> Result<Value, CodecError> {
        let mut reader = Reader::new(packet);
        let payload = reader.block()?;
        let compressed = reader.flag()?;
        reader.finish()?;
        if payload.is_empty() {
            return Ok(Value::Null);
        }
        if compressed {
            self.format.deserialize(&decompress(payload)?)
        } else {
            self.format.deserialize(payload)
        }
    }

    /// Frames a key, compressing the part after the first `:` when large.
    pub fn encode_key(&self, key: &str) -> Result<Vec<u8>, CodecError> {
        let (part1, part2, compressed) = match key.split_once(KEY_SEPARATOR) {
            None => (key.as_bytes(), Vec::new(), false),
            Some((prefix, rest)) => {
                let (rest, compressed) = self.maybe_compress(rest.as_bytes().to_vec())?;
                (prefix.as_bytes(), rest, compressed)
            }
        };
        let mut out = Vec::with_capacity(part1.len() + part2.len() + 9);
        write_block(&mut out, part1)?;
        write_block(&mut out, &part2)?;
        out.push(compressed as u8);
        Ok(out)
    }

    /// Decodes only the uncompressed prefix of a key packet.
    pub fn decode_key_prefix(&self, packet: &[u8]) -> Result<String, CodecError> {
        let mut reader = Reader::new(packet);
        Ok(String::from_utf8(reader.block()?.to_vec())?)
    }

    /// Fully decodes a key packet.
    pub fn decode_key(&self, packet: &[u8]) -> Result<DecodedKey, CodecError> {
        let mut reader = Reader::new(packet);
        let prefix = String::from_utf8(reader.block()?.to_vec())?;
        let part2 = reader.block()?;
        let compressed = reader.flag()?;
        reader.finish()?;
        let rest = if part2.is_empty() {
            None
        } else if compressed {
            Some(String::from_utf8(decompress(part2)?)?)
        } else {
            Some(String::from_utf8(part2.to_vec())?)
        };
        Ok(DecodedKey { prefix, rest })
    }

    fn maybe_compress(&self, bytes: Vec<u8>) -> Result<(Vec<u8>, bool), CodecError> {
        if self.compress_above > 0 && bytes.len() > self.compress_above {
            Ok((compress(&bytes)?, true))
        } else {
            Ok((bytes, false))
        }
    }
}

fn compress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    ZlibDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

fn write_block(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CodecError> {
    let len = i32::try_from(bytes.len()).map_err(|_| CodecError::TooLarge(bytes.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        let available = self.buf.len() - self.pos;
        if needed > available {
            return Err(CodecError::Truncated {
                offset: self.pos,
                needed,
                available,
            });
        }
        let slice = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn block(&mut self) -> Result<&'a [u8], CodecError> {
        let mut len = [0u8; 4];
        len.copy_from_slice(self.take(4)?);
        let len = i32::from_be_bytes(len);
        let len = usize::try_from(len).map_err(|_| CodecError::NegativeLength(len))?;
        self.take(len)
    }

    fn finish(&self) -> Result<(), CodecError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            left => Err(CodecError::TrailingBytes(left)),
        }
    }

    fn flag(&mut self) -> Result<bool, CodecError> {
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidFlag(other)),
        }
    }
}
