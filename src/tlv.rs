//! BER-TLV length codec and a minimal tag-length-value reader/writer.
//!
//! Segment lengths use the short form and the one- and two-byte long forms.
//! Package containers may exceed 64 KiB, so the reader also accepts the
//! three- and four-byte long forms.

use crate::types::{BspError, Result};

/// Encode a segment length field.
///
/// # Arguments
/// * `length` - Length to encode (must be below 0x10000)
///
/// # Returns
/// 1 to 3 bytes of BER length
pub fn encode_length(length: usize) -> Result<Vec<u8>> {
    if length < 0x80 {
        Ok(vec![length as u8])
    } else if length < 0x100 {
        Ok(vec![0x81, length as u8])
    } else if length < 0x10000 {
        Ok(vec![0x82, (length >> 8) as u8, length as u8])
    } else {
        Err(BspError::LengthOutOfRange(length))
    }
}

/// Encode a container length field, allowing up to four length bytes.
pub fn encode_container_length(length: usize) -> Result<Vec<u8>> {
    if length < 0x10000 {
        return encode_length(length);
    }
    if length < 0x100_0000 {
        Ok(vec![0x83, (length >> 16) as u8, (length >> 8) as u8, length as u8])
    } else if length <= u32::MAX as usize {
        let mut out = vec![0x84];
        out.extend_from_slice(&(length as u32).to_be_bytes());
        Ok(out)
    } else {
        Err(BspError::LengthOutOfRange(length))
    }
}

/// Decode a BER length field at the start of `data`.
///
/// # Returns
/// `(length, bytes_consumed)`
pub fn decode_length(data: &[u8]) -> Result<(usize, usize)> {
    let first = *data
        .first()
        .ok_or_else(|| BspError::MalformedPackage("Missing length field".into()))?;

    if first < 0x80 {
        return Ok((first as usize, 1));
    }

    let count = (first & 0x7F) as usize;
    if count == 0 || count > 4 {
        return Err(BspError::MalformedPackage(format!(
            "Unsupported length encoding: 0x{:02X}",
            first
        )));
    }
    if data.len() < 1 + count {
        return Err(BspError::MalformedPackage(
            "Truncated length encoding".into(),
        ));
    }

    let length = data[1..=count]
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
    let length = usize::try_from(length).map_err(|_| {
        BspError::MalformedPackage(format!("Length {} exceeds addressable size", length))
    })?;
    Ok((length, 1 + count))
}

/// Encode a tag value (1 to 3 bytes, big-endian) followed by length and value.
pub fn encode_tlv(tag: u32, value: &[u8]) -> Result<Vec<u8>> {
    let length = encode_container_length(value.len())?;
    let mut out = Vec::with_capacity(3 + length.len() + value.len());
    if tag > 0xFFFF {
        out.push((tag >> 16) as u8);
    }
    if tag > 0xFF {
        out.push((tag >> 8) as u8);
    }
    out.push(tag as u8);
    out.extend_from_slice(&length);
    out.extend_from_slice(value);
    Ok(out)
}

fn decode_tag(data: &[u8]) -> Result<(u32, usize)> {
    let first = *data
        .first()
        .ok_or_else(|| BspError::MalformedPackage("Missing tag".into()))?;

    let mut tag = first as u32;
    let mut consumed = 1;
    if first & 0x1F == 0x1F {
        loop {
            let b = *data
                .get(consumed)
                .ok_or_else(|| BspError::MalformedPackage("Truncated tag".into()))?;
            tag = (tag << 8) | b as u32;
            consumed += 1;
            if b & 0x80 == 0 {
                break;
            }
            if consumed >= 3 {
                return Err(BspError::MalformedPackage("Tag too long".into()));
            }
        }
    }
    Ok((tag, consumed))
}

/// One decoded tag-length-value element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    /// Tag bytes packed big-endian (`0xBF36`, `0x87`, ...).
    pub tag: u32,
    /// Value bytes.
    pub value: &'a [u8],
    /// The complete element as it appeared on the wire.
    pub raw: &'a [u8],
}

/// Sequential reader over concatenated TLV elements.
pub struct TlvReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> TlvReader<'a> {
    /// Create a reader over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Whether every element has been consumed.
    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// Tag of the next element without consuming it.
    pub fn peek_tag(&self) -> Result<Option<u32>> {
        if self.is_empty() {
            return Ok(None);
        }
        decode_tag(&self.data[self.offset..]).map(|(tag, _)| Some(tag))
    }

    /// Read the next element.
    pub fn read(&mut self) -> Result<Tlv<'a>> {
        let rest = &self.data[self.offset..];
        if rest.is_empty() {
            return Err(BspError::MalformedPackage("Unexpected end of data".into()));
        }

        let (tag, tag_len) = decode_tag(rest)?;
        let (length, len_len) = decode_length(&rest[tag_len..])?;
        let header = tag_len + len_len;
        let end = header
            .checked_add(length)
            .filter(|end| *end <= rest.len())
            .ok_or_else(|| {
                BspError::MalformedPackage(format!(
                    "Element 0x{:X} length {} exceeds available {} bytes",
                    tag,
                    length,
                    rest.len() - header
                ))
            })?;

        self.offset += end;
        Ok(Tlv {
            tag,
            value: &rest[header..end],
            raw: &rest[..end],
        })
    }

    /// Read the next element and require a specific tag.
    ///
    /// # Arguments
    /// * `tag` - Expected tag
    /// * `what` - Element name used in the error message
    pub fn read_expected(&mut self, tag: u32, what: &str) -> Result<Tlv<'a>> {
        match self.peek_tag()? {
            Some(found) if found == tag => self.read(),
            Some(found) => Err(BspError::MalformedPackage(format!(
                "Expected {} (0x{:X}), found 0x{:X}",
                what, tag, found
            ))),
            None => Err(BspError::MalformedPackage(format!("Missing {}", what))),
        }
    }

    /// Read the next element only if it carries `tag`.
    pub fn read_optional(&mut self, tag: u32) -> Result<Option<Tlv<'a>>> {
        match self.peek_tag()? {
            Some(found) if found == tag => self.read().map(Some),
            _ => Ok(None),
        }
    }

    /// Fail if unread bytes remain.
    pub fn finish(&self, what: &str) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(BspError::MalformedPackage(format!(
                "{} trailing bytes after {}",
                self.data.len() - self.offset,
                what
            )))
        }
    }
}
