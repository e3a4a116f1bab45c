//! Payload framing for use with tokio `Framed`.
//!
//! One logical payload maps to one or more packets: chunks of exactly
//! [`MAX_PACKET_SIZE`] bytes followed by a final shorter packet, with a
//! zero-length terminator when the payload length is an exact multiple of
//! the chunk size. The codec owns the connection's packet sequence counter
//! and treats any received packet that does not match the expected sequence
//! number as a fatal protocol error.
//!
//! The codec is a pure data transformation over `BytesMut`, so the same
//! logic drives any stream the `Framed` adapter can wrap.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::protocol::compress::{CompressionContext, FRAME_HEADER_SIZE};
use crate::protocol::packet::{Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// Codec mapping whole payloads to sequence-numbered packets.
#[derive(Debug, Default)]
pub struct PayloadCodec {
    /// Next expected (rx) / next stamped (tx) sequence number. The protocol
    /// is half-duplex, so one counter serves both directions.
    seq: u8,
    /// Accumulated chunks of a payload still being reassembled.
    partial: BytesMut,
    /// Set while the last chunk read was exactly `MAX_PACKET_SIZE`.
    mid_payload: bool,
    /// Compressed-protocol state, present once negotiated.
    compression: Option<CompressionContext>,
    /// Packet bytes recovered from compressed frames, awaiting reassembly.
    inflated: BytesMut,
}

impl PayloadCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the sequence counter at a command boundary.
    pub fn reset_sequence(&mut self) {
        self.seq = 0;
        if let Some(ctx) = &mut self.compression {
            ctx.reset_sequence();
        }
    }

    /// Switch to the compressed protocol. Called once, after the handshake
    /// negotiated CLIENT_COMPRESS.
    pub fn enable_compression(&mut self) {
        self.compression = Some(CompressionContext::new());
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression.is_some()
    }

    fn take_seq(&mut self) -> u8 {
        let s = self.seq;
        self.seq = self.seq.wrapping_add(1);
        s
    }
}

impl Encoder<Bytes> for PayloadCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        let mut scratch = BytesMut::new();
        let out = if self.compression.is_some() {
            &mut scratch
        } else {
            &mut *dst
        };

        let len = item.len();
        let mut offset = 0;
        loop {
            let end = (offset + MAX_PACKET_SIZE).min(len);
            let chunk_len = end - offset;
            Packet::new(self.take_seq(), item.slice(offset..end)).encode(out);
            offset = end;
            if chunk_len < MAX_PACKET_SIZE {
                break;
            }
            if offset == len {
                // Exact multiple of the chunk size: a zero-length terminator
                // tells the reader the payload ends here.
                Packet::new(self.take_seq(), Bytes::new()).encode(out);
                break;
            }
        }

        if let Some(ctx) = &mut self.compression {
            ctx.compress_into(&scratch, dst)?;
        }
        Ok(())
    }
}

impl Decoder for PayloadCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        let buf = if let Some(ctx) = &mut self.compression {
            while ctx.decompress_frame(src, &mut self.inflated)? {}
            &mut self.inflated
        } else {
            &mut *src
        };

        while let Some(packet) = Packet::decode(buf) {
            let expected = self.seq;
            if packet.sequence_id != expected {
                return Err(Error::PacketOutOfOrder {
                    expected,
                    actual: packet.sequence_id,
                });
            }
            self.seq = self.seq.wrapping_add(1);

            let full_chunk = packet.payload.len() == MAX_PACKET_SIZE;
            if !self.mid_payload && !full_chunk {
                // Whole payload in a single packet.
                return Ok(Some(packet.payload));
            }

            self.partial.extend_from_slice(&packet.payload);
            self.mid_payload = full_chunk;
            if !full_chunk {
                return Ok(Some(self.partial.split().freeze()));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        if let Some(payload) = self.decode(src)? {
            return Ok(Some(payload));
        }

        // With compression, `decode` consumes whole frames into `inflated`;
        // anything left in `src` is a frame cut short by the close.
        if self.compression.is_some() && !src.is_empty() {
            let expected = if src.len() >= FRAME_HEADER_SIZE {
                let promised =
                    src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);
                FRAME_HEADER_SIZE + promised
            } else {
                FRAME_HEADER_SIZE
            };
            return Err(Error::IncompleteResponse {
                expected,
                actual: src.len(),
            });
        }

        let buf = if self.compression.is_some() {
            &self.inflated
        } else {
            &*src
        };

        // EOF in the middle of a packet or payload is a truncation, not a
        // clean close; report how much was promised vs. delivered.
        if buf.len() >= PACKET_HEADER_SIZE {
            let promised =
                buf[0] as usize | ((buf[1] as usize) << 8) | ((buf[2] as usize) << 16);
            return Err(Error::IncompleteResponse {
                expected: PACKET_HEADER_SIZE + promised,
                actual: buf.len(),
            });
        }
        if !buf.is_empty() || self.mid_payload {
            return Err(Error::IncompleteResponse {
                expected: PACKET_HEADER_SIZE,
                actual: buf.len(),
            });
        }
        Ok(None)
    }
}
