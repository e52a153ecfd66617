// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::BytesMut;

use crate::{ByteArray, DecodeError, EncodeError, EncodePacket, MqttPacket, Packet};

/// Incremental packet parser over an arbitrarily fragmented byte stream.
///
/// Bytes from the transport arrive in chunks that need not line up with
/// packet boundaries; the decoder buffers a trailing partial frame across
/// calls and emits every complete packet it can.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug)]
pub struct PacketDecoder {
    buf: BytesMut,

    /// Frames longer than this fail with `PacketTooLarge`.
    max_packet_size: usize,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            max_packet_size: usize::MAX,
        }
    }

    #[must_use]
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_packet_size,
        }
    }

    /// Get number of buffered bytes belonging to a partial frame.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Discard any buffered partial frame. Called when the connection is
    /// replaced, the next byte then starts a fresh frame.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Append `chunk` and parse every complete packet out of the buffer.
    ///
    /// # Errors
    ///
    /// Returns error if the buffered bytes do not form valid packets; the
    /// caller is expected to tear down the connection.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<MqttPacket>, DecodeError> {
        self.buf.extend_from_slice(chunk);

        let mut packets = Vec::new();
        while let Some(frame_len) = Self::frame_length(&self.buf)? {
            if frame_len > self.max_packet_size {
                return Err(DecodeError::PacketTooLarge);
            }
            if self.buf.len() < frame_len {
                break;
            }
            let frame = self.buf.split_to(frame_len);
            let mut ba = ByteArray::new(&frame);
            packets.push(MqttPacket::decode(&mut ba)?);
        }
        Ok(packets)
    }

    /// Total frame length declared by the fixed header at the front of
    /// `buf`, or `None` when more bytes are needed to know it.
    fn frame_length(buf: &[u8]) -> Result<Option<usize>, DecodeError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let mut value: usize = 0;
        let mut multiplier: usize = 1;
        for i in 0..4 {
            let Some(&byte) = buf.get(1 + i) else {
                return Ok(None);
            };
            value += ((byte & 0x7f) as usize) * multiplier;
            if byte & 0x80 == 0 {
                return Ok(Some(1 + (i + 1) + value));
            }
            multiplier *= 128;
        }
        Err(DecodeError::InvalidVarInt)
    }
}

/// One frame produced by `FrameEncoder`.
#[derive(Debug, Default)]
pub struct EncodedFrame {
    /// Concatenated packet bytes, at most the frame budget.
    pub buf: Vec<u8>,

    /// Number of bytes in `buf`. Always equals the sum of the wire sizes of
    /// the packed packets.
    pub written: usize,

    /// How many leading packets of the input were handled, packed or
    /// dropped. The caller removes this many from its queue.
    pub consumed: usize,

    /// Input indices of packets dropped because they alone exceed the
    /// budget. Their waiters are failed by the caller.
    pub dropped: Vec<usize>,
}

/// Packs consecutive packets into a single output buffer bounded by the
/// transport's frame budget.
///
/// Grouping small packets into one write keeps syscall count down on busy
/// connections. A packet that cannot fit even in an empty frame is dropped
/// and reported rather than stalling everything behind it.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    max_frame_size: usize,
}

impl FrameEncoder {
    #[must_use]
    pub const fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode leading packets of `packets` into one frame.
    ///
    /// Stops at the first packet that would push the frame over budget;
    /// that packet and everything after it stay queued for the next frame.
    ///
    /// # Errors
    ///
    /// Returns error if a packet fails to serialize.
    pub fn encode(&self, packets: &[MqttPacket]) -> Result<EncodedFrame, EncodeError> {
        let mut frame = EncodedFrame::default();
        for (index, packet) in packets.iter().enumerate() {
            let size = packet.bytes().map_err(EncodeError::from)?;
            if size > self.max_frame_size {
                log::warn!(
                    "codec: dropping oversize {:?} packet, {size} bytes exceeds frame budget {}",
                    packet.packet_type(),
                    self.max_frame_size
                );
                frame.dropped.push(index);
                frame.consumed += 1;
                continue;
            }
            if frame.written + size > self.max_frame_size {
                break;
            }
            let written = packet.encode(&mut frame.buf)?;
            debug_assert_eq!(written, size);
            frame.written += written;
            frame.consumed += 1;
        }
        Ok(frame)
    }
}
