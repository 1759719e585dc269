/*++

Licensed under the Apache-2.0 license.

File Name:

    der_helper.rs

Abstract:

    Helpers for encoding and walking DER: length forms, unsigned integers,
    a TLV writer with exact and measure modes, and a TLV reader.

--*/

use sdcle_error::{SdcleError, SdcleResult};

pub mod tag {
    pub const INTEGER: u8 = 0x02;
    pub const BIT_STRING: u8 = 0x03;
    pub const OCTET_STRING: u8 = 0x04;
    pub const NULL: u8 = 0x05;
    pub const OID: u8 = 0x06;
    pub const UTF8_STRING: u8 = 0x0C;
    pub const PRINTABLE_STRING: u8 = 0x13;
    pub const T61_STRING: u8 = 0x14;
    pub const IA5_STRING: u8 = 0x16;
    pub const UTC_TIME: u8 = 0x17;
    pub const GENERALIZED_TIME: u8 = 0x18;
    pub const SEQUENCE: u8 = 0x30;
    pub const SET: u8 = 0x31;
    pub const CONTEXT_0: u8 = 0xA0;
    pub const CONTEXT_3: u8 = 0xA3;
}

/// Largest length the encoder emits (`0x82 HH LL`).
pub const MAX_DER_LEN: usize = 0xFFFF;

fn trim_leading_zeros(val: &[u8]) -> &[u8] {
    match val.iter().position(|&b| b != 0) {
        Some(i) => &val[i..],
        // If everything is 0, then we need len 1, and 0 as value
        None => val.get(..1).unwrap_or(&[]),
    }
}

/// Content length of the DER INTEGER encoding of an unsigned value.
fn encode_length(val: &[u8]) -> usize {
    for (i, &b) in val.iter().enumerate() {
        if b != 0 {
            return val.len() - i + (b >> 7) as usize;
        }
    }
    1
}

/// Size of the length field for a content of `len` bytes.
pub fn der_len_field_size(len: usize) -> Option<usize> {
    match len {
        0..=127 => Some(1),
        128..=255 => Some(2),
        256..=MAX_DER_LEN => Some(3),
        _ => None,
    }
}

/// Compute len of DER encoding of an unsigned integer
pub fn der_uint_len(val: &[u8]) -> Option<usize> {
    let encode_length = encode_length(val);
    // Tag + len + int
    Some(1 + der_len_field_size(encode_length)? + encode_length)
}

/// Encode a DER length
pub fn der_encode_len(len: usize, buf: &mut [u8]) -> Option<usize> {
    match len {
        0..=127 => {
            *buf.get_mut(0)? = len as u8;
            Some(1)
        }
        128..=255 => {
            buf.get_mut(..2)?.copy_from_slice(&[0x81, len as u8]);
            Some(2)
        }
        256..=MAX_DER_LEN => {
            buf.get_mut(..3)?
                .copy_from_slice(&[0x82, (len >> 8) as u8, len as u8]);
            Some(3)
        }
        _ => None,
    }
}

/// DER Encode unsigned integer
pub fn der_encode_uint(val: &[u8], buf: &mut [u8]) -> Option<usize> {
    let mut pos = 0;

    *buf.get_mut(pos)? = tag::INTEGER;
    pos += 1;

    let sub_val = trim_leading_zeros(val);
    let encode_len = encode_length(val);

    pos += der_encode_len(encode_len, buf.get_mut(pos..)?)?;

    if *sub_val.first()? > 127 {
        *buf.get_mut(pos)? = 0;
        pos += 1;
    }

    buf.get_mut(pos..)?
        .get_mut(..sub_val.len())?
        .copy_from_slice(sub_val);
    pos += sub_val.len();

    Some(pos)
}

/// TLV writer over a caller buffer.
///
/// In exact mode every write is bounds checked and overflowing the buffer
/// fails with `DER_BUFFER_TOO_SMALL`. In measure mode nothing is written
/// and only the running length is kept.
pub struct DerWriter<'a> {
    buf: Option<&'a mut [u8]>,
    pos: usize,
}

impl<'a> DerWriter<'a> {
    pub fn exact(buf: &'a mut [u8]) -> Self {
        Self {
            buf: Some(buf),
            pos: 0,
        }
    }

    pub fn measure() -> Self {
        Self { buf: None, pos: 0 }
    }

    pub fn is_measuring(&self) -> bool {
        self.buf.is_none()
    }

    /// Bytes emitted (or counted) so far.
    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    pub fn raw(&mut self, bytes: &[u8]) -> SdcleResult<()> {
        if let Some(buf) = self.buf.as_deref_mut() {
            buf.get_mut(self.pos..)
                .and_then(|b| b.get_mut(..bytes.len()))
                .ok_or(SdcleError::DER_BUFFER_TOO_SMALL)?
                .copy_from_slice(bytes);
        }
        self.pos += bytes.len();
        Ok(())
    }

    pub fn header(&mut self, tag: u8, len: usize) -> SdcleResult<()> {
        let mut hdr = [0u8; 4];
        hdr[0] = tag;
        let len_size =
            der_encode_len(len, &mut hdr[1..]).ok_or(SdcleError::DER_LENGTH_UNSUPPORTED)?;
        self.raw(&hdr[..1 + len_size])
    }

    pub fn tlv(&mut self, tag: u8, value: &[u8]) -> SdcleResult<()> {
        self.header(tag, value.len())?;
        self.raw(value)
    }

    /// Unsigned big-endian integer with minimal encoding.
    pub fn uint(&mut self, val: &[u8]) -> SdcleResult<()> {
        let content_len = encode_length(val);
        self.header(tag::INTEGER, content_len)?;
        let sub_val = trim_leading_zeros(val);
        if content_len > sub_val.len() {
            self.raw(&[0])?;
        }
        self.raw(sub_val)
    }

    /// Constructed TLV whose content is produced by `content`.
    ///
    /// The content is measured first, then the header and content are
    /// emitted.
    pub fn nested<F>(&mut self, tag: u8, content: F) -> SdcleResult<()>
    where
        F: Fn(&mut DerWriter) -> SdcleResult<()>,
    {
        let mut measure = DerWriter::measure();
        content(&mut measure)?;
        self.header(tag, measure.len())?;
        let start = self.pos;
        content(self)?;
        debug_assert_eq!(self.pos - start, measure.len());
        Ok(())
    }
}

/// One decoded TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub value: &'a [u8],
}

/// Split the first TLV off `input`. Long form lengths of up to two bytes
/// are accepted.
pub fn read_tlv(input: &[u8]) -> SdcleResult<(Tlv<'_>, &[u8])> {
    let (&tag, rest) = input.split_first().ok_or(SdcleError::X509_MALFORMED)?;
    let (&first, rest) = rest.split_first().ok_or(SdcleError::X509_MALFORMED)?;
    let (len, rest) = match first {
        0..=0x7F => (usize::from(first), rest),
        0x81 => match rest {
            [l, tail @ ..] => (usize::from(*l), tail),
            _ => return Err(SdcleError::X509_MALFORMED),
        },
        0x82 => match rest {
            [h, l, tail @ ..] => ((usize::from(*h) << 8) | usize::from(*l), tail),
            _ => return Err(SdcleError::X509_MALFORMED),
        },
        _ => return Err(SdcleError::DER_LENGTH_UNSUPPORTED),
    };
    if rest.len() < len {
        return Err(SdcleError::X509_MALFORMED);
    }
    let (value, rest) = rest.split_at(len);
    Ok((Tlv { tag, value }, rest))
}

/// Like [`read_tlv`] but requires `tag`.
pub fn expect_tlv(input: &[u8], tag: u8) -> SdcleResult<(&[u8], &[u8])> {
    let (tlv, rest) = read_tlv(input)?;
    if tlv.tag != tag {
        return Err(SdcleError::X509_MALFORMED);
    }
    Ok((tlv.value, rest))
}
