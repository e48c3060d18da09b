//! Byte-level codec for the HL7 MLLP framing protocol.
//!
//! MLLP wraps each HL7 message in a single-byte header (0x0B) and a
//! two-byte trailer (0x1C 0x0D). There is no length prefix, so resync after
//! garbage is achieved by anchoring on the next header byte. The codec does
//! not interpret payload content in any way.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Vertical-Tab char, the marker for the start of a message
pub const START_BLOCK: u8 = 0x0B;
/// File-Separator char, the first trailer byte
pub const END_BLOCK: u8 = 0x1C;
/// CR, the second trailer byte and the HL7 segment terminator
pub const CARRIAGE_RETURN: u8 = 0x0D;

/// A [`tokio_util::codec`] implementation of MLLP framing, for use within a
/// `FramedRead`/`FramedWrite` pair over a TCP stream.
pub struct MllpCodec {}

impl MllpCodec {
    pub fn new() -> Self {
        MllpCodec {}
    }
}

impl Default for MllpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MllpCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Bytes ahead of the start block are noise between records.
        match memchr::memchr(START_BLOCK, src) {
            Some(0) => {}
            Some(n) => {
                debug!(discarded = n, "skipping bytes outside mllp frame");
                src.advance(n);
            }
            None => {
                if !src.is_empty() {
                    debug!(discarded = src.len(), "skipping bytes outside mllp frame");
                    src.clear();
                }
                return Ok(None);
            }
        }

        // Scan for the exact 0x1C 0x0D pair. A 0x1C followed by anything
        // else is payload, verbatim; a lone 0x1C at the buffer end waits
        // for the next read.
        let mut from = 1;
        while let Some(i) = memchr::memchr(END_BLOCK, &src[from..]) {
            let end = from + i;
            match src.get(end + 1) {
                Some(&CARRIAGE_RETURN) => {
                    let frame = src.split_to(end + 2).freeze();
                    return Ok(Some(frame.slice(1..frame.len() - 2)));
                }
                Some(_) => from = end + 2,
                None => break,
            }
        }
        Ok(None)
    }

    // EOF mid-record: the partial buffer is discarded and the stream is done.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    debug!(discarded = src.len(), "discarding partial record at eof");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for MllpCodec {
    type Error = std::io::Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(payload.len() + 3);
        dst.put_u8(START_BLOCK);
        dst.extend_from_slice(&payload);
        dst.put_u8(END_BLOCK);
        dst.put_u8(CARRIAGE_RETURN);
        Ok(())
    }
}
