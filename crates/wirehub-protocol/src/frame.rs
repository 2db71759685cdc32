//! Frame header encoding and decoding.
//!
//! A frame is a 4-byte header followed by a raw payload: payload length
//! as a little-endian `u16` (header bytes excluded), then the message tag
//! as a little-endian `u16`. There is no in-band escaping or terminator;
//! payload semantics belong to the handler registered for the tag.

use std::io;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use wirehub_core::constants::HEADER_SIZE;

/// A decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Payload byte count, excluding the header itself.
    pub length: u16,
    /// Message-type identifier.
    pub tag: u16,
}

impl Header {
    /// Decodes a header from the first [`HEADER_SIZE`] bytes of `bytes`.
    ///
    /// Callers must ensure at least [`HEADER_SIZE`] bytes are present.
    pub fn decode(bytes: &[u8]) -> Header {
        Header {
            length: LittleEndian::read_u16(&bytes[..2]),
            tag: LittleEndian::read_u16(&bytes[2..4]),
        }
    }

    /// Encodes the header into its 4-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        LittleEndian::write_u16(&mut out[..2], self.length);
        LittleEndian::write_u16(&mut out[2..4], self.tag);
        out
    }
}

/// Appends a complete frame for `tag` carrying `payload` to `buf`.
///
/// Fails with `InvalidInput` if the payload cannot be described by the
/// 16-bit length field.
pub fn encode_frame_into(buf: &mut Vec<u8>, tag: u16, payload: &[u8]) -> io::Result<()> {
    let length = u16::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {} bytes does not fit a frame", payload.len()),
        )
    })?;
    buf.write_u16::<LittleEndian>(length)?;
    buf.write_u16::<LittleEndian>(tag)?;
    buf.extend_from_slice(payload);
    Ok(())
}

/// Encodes a complete frame for `tag` carrying `payload`.
pub fn encode_frame(tag: u16, payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    encode_frame_into(&mut buf, tag, payload)?;
    Ok(buf)
}
