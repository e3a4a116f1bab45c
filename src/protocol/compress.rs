//! Compressed protocol framing, negotiated via CLIENT_COMPRESS.
//!
//! Once enabled, the raw packet stream is carried inside compressed frames:
//! 3-byte compressed length, 1-byte compressed sequence number, 3-byte
//! uncompressed length, then the frame body. Frames below
//! [`MIN_COMPRESS_LENGTH`] are sent as-is with uncompressed length 0 as the
//! "not actually compressed" sentinel.
//!
//! The compressed sequence counter is independent of the packet sequence
//! counter and resets at the same command boundaries.

use std::io::Write;

use bytes::{Buf, BufMut, BytesMut};
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use crate::error::{Error, Result};
use crate::protocol::packet::MAX_PACKET_SIZE;

/// Payloads shorter than this are not worth deflating.
pub const MIN_COMPRESS_LENGTH: usize = 50;

/// Compressed frame header: 3-byte compressed length, 1-byte sequence,
/// 3-byte uncompressed length.
pub const FRAME_HEADER_SIZE: usize = 7;

/// Per-connection compression state: the compressed sequence counter.
#[derive(Debug, Default)]
pub struct CompressionContext {
    seq: u8,
}

impl CompressionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_sequence(&mut self) {
        self.seq = 0;
    }

    fn take_seq(&mut self) -> u8 {
        let s = self.seq;
        self.seq = self.seq.wrapping_add(1);
        s
    }

    /// Wrap a run of packet bytes into one or more compressed frames.
    pub fn compress_into(&mut self, packets: &[u8], dst: &mut BytesMut) -> Result<()> {
        if packets.is_empty() {
            write_frame_header(dst, 0, self.take_seq(), 0);
            return Ok(());
        }

        // A frame body is bounded by the same 3-byte length as a packet.
        for chunk in packets.chunks(MAX_PACKET_SIZE) {
            if chunk.len() < MIN_COMPRESS_LENGTH {
                write_frame_header(dst, chunk.len(), self.take_seq(), 0);
                dst.extend_from_slice(chunk);
                continue;
            }

            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(chunk)
                .and_then(|()| encoder.finish())
                .map_err(Error::Io)
                .and_then(|deflated| {
                    if deflated.len() < chunk.len() {
                        write_frame_header(dst, deflated.len(), self.take_seq(), chunk.len());
                        dst.extend_from_slice(&deflated);
                    } else {
                        // Deflate did not help; fall back to the raw sentinel.
                        write_frame_header(dst, chunk.len(), self.take_seq(), 0);
                        dst.extend_from_slice(chunk);
                    }
                    Ok(())
                })?;
        }
        Ok(())
    }

    /// Consume one compressed frame from `src`, appending the carried packet
    /// bytes to `out`. Returns `false` when `src` does not yet hold a full
    /// frame.
    pub fn decompress_frame(&mut self, src: &mut BytesMut, out: &mut BytesMut) -> Result<bool> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(false);
        }

        let compressed_len =
            src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);
        let seq = src[3];
        let uncompressed_len =
            src[4] as usize | ((src[5] as usize) << 8) | ((src[6] as usize) << 16);

        if src.len() < FRAME_HEADER_SIZE + compressed_len {
            return Ok(false);
        }

        let expected = self.seq;
        if seq != expected {
            return Err(Error::PacketOutOfOrder {
                expected,
                actual: seq,
            });
        }
        self.seq = self.seq.wrapping_add(1);

        src.advance(FRAME_HEADER_SIZE);
        let body = src.split_to(compressed_len);

        if uncompressed_len == 0 {
            // Sentinel: body was sent uncompressed.
            out.extend_from_slice(&body);
        } else {
            let mut decoder = ZlibDecoder::new(Vec::with_capacity(uncompressed_len));
            decoder
                .write_all(&body)
                .and_then(|()| decoder.finish())
                .map_err(|e| Error::Protocol(format!("corrupt compressed frame: {e}")))
                .and_then(|inflated| {
                    if inflated.len() != uncompressed_len {
                        return Err(Error::Protocol(format!(
                            "compressed frame inflated to {} bytes, header claimed {}",
                            inflated.len(),
                            uncompressed_len
                        )));
                    }
                    out.extend_from_slice(&inflated);
                    Ok(())
                })?;
        }
        Ok(true)
    }
}

fn write_frame_header(dst: &mut BytesMut, compressed_len: usize, seq: u8, uncompressed_len: usize) {
    debug_assert!(compressed_len <= MAX_PACKET_SIZE);
    debug_assert!(uncompressed_len <= MAX_PACKET_SIZE);
    dst.reserve(FRAME_HEADER_SIZE + compressed_len);
    dst.put_u8((compressed_len & 0xFF) as u8);
    dst.put_u8(((compressed_len >> 8) & 0xFF) as u8);
    dst.put_u8(((compressed_len >> 16) & 0xFF) as u8);
    dst.put_u8(seq);
    dst.put_u8((uncompressed_len & 0xFF) as u8);
    dst.put_u8(((uncompressed_len >> 8) & 0xFF) as u8);
    dst.put_u8(((uncompressed_len >> 16) & 0xFF) as u8);
}
