/*!
A Self-Delimiting Numeric Value (SDNV) encoder/decoder.

SDNVs are the variable-length unsigned integer encoding used throughout the
Bundle Protocol wire format, as specified in
[RFC 5050](https://www.rfc-editor.org/rfc/rfc5050.html) and
[RFC 6256](https://www.rfc-editor.org/rfc/rfc6256.html). Each octet carries
seven value bits, most-significant group first, with the high bit set on
every octet except the last.

Values up to 64 bits are supported; longer encodings are rejected with
[`Error::Overflow`]. A buffer that ends mid-value is not an error: the
decoding functions return `None` so callers consuming a byte stream in
chunks can retry once more data has arrived.

# Usage

```
let mut buf = [0u8; perigee_sdnv::MAX_LENGTH];
let len = perigee_sdnv::encode(0xABC, &mut buf).unwrap();
assert_eq!(&buf[..len], &[0x95, 0x3C]);

let (value, consumed) = perigee_sdnv::decode(&buf[..len]).unwrap().unwrap();
assert_eq!(value, 0xABC);
assert_eq!(consumed, len);
```
*/
#![no_std]
extern crate alloc;

use alloc::vec::Vec;
use thiserror::Error;


/// The longest possible encoding of a 64-bit value: ceil(64 / 7) octets.
pub const MAX_LENGTH: usize = 10;

/// An error that can occur during SDNV processing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The encoded value does not fit in 64 bits.
    #[error("SDNV value overflows 64 bits")]
    Overflow,

    /// The output buffer is too small for the encoded value.
    #[error("Output buffer too small: need {need}, have {have}")]
    Insufficient {
        /// Octets required by the encoding.
        need: usize,
        /// Octets available in the buffer.
        have: usize,
    },
}

/// Returns the number of octets [`encode`] will emit for `value`.
pub const fn encoding_len(value: u64) -> usize {
    // Every 7 bits of magnitude costs one octet; zero still takes one.
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Encodes `value` into the front of `buf`, returning the octet count.
///
/// Fails with [`Error::Insufficient`] if `buf` cannot hold the complete
/// encoding; nothing is written in that case.
pub fn encode(value: u64, buf: &mut [u8]) -> Result<usize, Error> {
    let len = encoding_len(value);
    if buf.len() < len {
        return Err(Error::Insufficient {
            need: len,
            have: buf.len(),
        });
    }
    for (i, b) in buf[..len].iter_mut().enumerate() {
        let shift = 7 * (len - 1 - i);
        *b = ((value >> shift) & 0x7F) as u8;
        if shift != 0 {
            *b |= 0x80;
        }
    }
    Ok(len)
}

/// Appends the encoding of `value` to `out`.
pub fn encode_into(value: u64, out: &mut Vec<u8>) {
    let mut buf = [0u8; MAX_LENGTH];
    let len = encode(value, &mut buf).expect("MAX_LENGTH sized buffer");
    out.extend_from_slice(&buf[..len]);
}

/// Decodes an SDNV from the front of `buf`.
///
/// Returns `Ok(Some((value, consumed)))` on success, `Ok(None)` if `buf`
/// ends before the final octet of the value, and [`Error::Overflow`] if the
/// encoding exceeds 64 bits of value.
pub fn decode(buf: &[u8]) -> Result<Option<(u64, usize)>, Error> {
    let mut value: u64 = 0;
    for (i, b) in buf.iter().enumerate() {
        if i >= MAX_LENGTH {
            return Err(Error::Overflow);
        }
        // The 10th octet may only contribute the single remaining bit.
        if i == MAX_LENGTH - 1 && (value >> 57) != 0 {
            return Err(Error::Overflow);
        }
        value = (value << 7) | u64::from(b & 0x7F);
        if b & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_LENGTH {
        return Err(Error::Overflow);
    }
    Ok(None)
}

/// Returns the encoded length of the SDNV at the front of `buf` without
/// materialising its value, or `None` if `buf` ends mid-value.
pub fn len(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|b| b & 0x80 == 0).map(|n| n + 1)
}
