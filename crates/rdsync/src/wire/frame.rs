// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame codec for stream transports.
//!
//! TCP has no message boundaries; every frame carries its target id and
//! payload length:
//!
//! ```text
//! +-----------------+------------------+-------------------+
//! | Id (8B LE, i64) | Length (4B LE)   | Payload           |
//! +-----------------+------------------+-------------------+
//! ```
//!
//! The length is written as a placeholder and patched once the payload has
//! been serialized. A receiver that has no handler for the id still knows
//! exactly how many bytes to skip.

use super::{with_scratch, PayloadWriter, WireResult};
use crate::config::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};
use crate::core::RdId;
use std::io::{self, Read};

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub id: RdId,
    pub payload: Vec<u8>,
}

/// Incremental frame decoder with anti-OOM limit.
#[derive(Debug)]
pub struct FrameCodec {
    /// Current read state
    state: ReadState,

    /// Header bytes, then body bytes
    buffer: Vec<u8>,

    /// Id of the frame whose body is being read
    current_id: RdId,

    /// Maximum allowed payload size
    max_size: usize,

    /// Statistics: frames decoded
    frames_decoded: u64,

    /// Statistics: payload bytes decoded
    bytes_decoded: u64,

    /// Statistics: frames too large (rejected)
    frames_rejected: u64,

    /// Accumulation buffer for [`feed`](Self::feed)
    accumulator: Vec<u8>,

    /// Read position in accumulator
    accumulator_pos: usize,
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    ReadingHeader { bytes_read: usize },
    ReadingBody { expected_len: usize, bytes_read: usize },
    /// Discarding the body of a rejected frame (buffered mode only)
    Skipping { remaining: usize },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingHeader { bytes_read: 0 }
    }
}

fn parse_header(header: &[u8]) -> (RdId, i32) {
    let mut id = [0u8; 8];
    id.copy_from_slice(&header[..8]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[8..FRAME_HEADER_SIZE]);
    (RdId::new(i64::from_le_bytes(id)), i32::from_le_bytes(len))
}

impl FrameCodec {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            buffer: vec![0u8; FRAME_HEADER_SIZE],
            current_id: RdId::NULL,
            max_size,
            frames_decoded: 0,
            bytes_decoded: 0,
            frames_rejected: 0,
            accumulator: Vec::new(),
            accumulator_pos: 0,
        }
    }

    pub fn with_default_max() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Reset the read state (e.g. after reconnect).
    pub fn reset(&mut self) {
        self.state = ReadState::default();
        self.buffer.resize(FRAME_HEADER_SIZE, 0);
        self.accumulator.clear();
        self.accumulator_pos = 0;
    }

    /// Frame an already serialized payload.
    pub fn encode(id: RdId, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&id.raw().to_le_bytes());
        frame.extend_from_slice(&(payload.len() as i32).to_le_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    /// Serialize a payload straight into a frame (placeholder, body, patch).
    pub fn encode_with(id: RdId, writer: PayloadWriter<'_>) -> WireResult<Vec<u8>> {
        with_scratch(|out| {
            out.write_rd_id(id);
            let at = out.write_length_placeholder();
            writer(out)?;
            out.patch_length(at);
            Ok(())
        })
    }

    fn finish_header(&mut self) -> io::Result<Option<InboundFrame>> {
        let (id, len) = parse_header(&self.buffer[..FRAME_HEADER_SIZE]);
        if len < 0 || len as usize > self.max_size {
            self.frames_rejected += 1;
            self.state = ReadState::default();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "bad frame length {} for id {} (max {})",
                    len, id, self.max_size
                ),
            ));
        }
        let len = len as usize;
        if len == 0 {
            self.frames_decoded += 1;
            self.state = ReadState::default();
            return Ok(Some(InboundFrame {
                id,
                payload: Vec::new(),
            }));
        }
        self.current_id = id;
        self.buffer.resize(len, 0);
        self.state = ReadState::ReadingBody {
            expected_len: len,
            bytes_read: 0,
        };
        Ok(None)
    }

    fn finish_body(&mut self, expected_len: usize) -> InboundFrame {
        let payload = self.buffer[..expected_len].to_vec();
        self.frames_decoded += 1;
        self.bytes_decoded += expected_len as u64;
        self.buffer.resize(FRAME_HEADER_SIZE, 0);
        self.state = ReadState::default();
        InboundFrame {
            id: self.current_id,
            payload,
        }
    }

    /// Try to decode one complete frame from `reader`.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` - a complete frame was decoded
    /// - `Ok(None)` - need more data (WouldBlock)
    /// - `Err(e)` - I/O error, EOF, or a frame above the size limit
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<InboundFrame>> {
        loop {
            match self.state {
                ReadState::ReadingHeader { bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..FRAME_HEADER_SIZE]) {
                        Ok(0) => {
                            let reason = if bytes_read == 0 {
                                "connection closed"
                            } else {
                                "incomplete frame header"
                            };
                            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, reason));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < FRAME_HEADER_SIZE {
                                self.state = ReadState::ReadingHeader { bytes_read: total };
                                continue;
                            }
                            if let Some(frame) = self.finish_header()? {
                                return Ok(Some(frame));
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }

                ReadState::ReadingBody {
                    expected_len,
                    bytes_read,
                } => match reader.read(&mut self.buffer[bytes_read..expected_len]) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "incomplete frame body",
                        ));
                    }
                    Ok(n) => {
                        let total = bytes_read + n;
                        if total < expected_len {
                            self.state = ReadState::ReadingBody {
                                expected_len,
                                bytes_read: total,
                            };
                            continue;
                        }
                        return Ok(Some(self.finish_body(expected_len)));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                },

                ReadState::Skipping { remaining } => {
                    let mut sink = [0u8; 1024];
                    let chunk = remaining.min(sink.len());
                    match reader.read(&mut sink[..chunk]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "incomplete skipped frame",
                            ));
                        }
                        Ok(n) if n < remaining => {
                            self.state = ReadState::Skipping {
                                remaining: remaining - n,
                            };
                        }
                        Ok(_) => self.state = ReadState::default(),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Append raw stream bytes for [`decode_buffered`](Self::decode_buffered).
    pub fn feed(&mut self, data: &[u8]) {
        if self.accumulator_pos > 0 && self.accumulator_pos > self.accumulator.len() / 2 {
            self.accumulator.drain(..self.accumulator_pos);
            self.accumulator_pos = 0;
        }
        self.accumulator.extend_from_slice(data);
    }

    /// Decode the next complete frame from fed bytes, if any.
    ///
    /// Oversized frames are skipped (their bodies are discarded as they
    /// arrive) and counted in [`frames_rejected`](Self::frames_rejected).
    pub fn decode_buffered(&mut self) -> Option<InboundFrame> {
        loop {
            let available = self.accumulator.len() - self.accumulator_pos;
            match self.state {
                ReadState::ReadingHeader { .. } => {
                    if available < FRAME_HEADER_SIZE {
                        return None;
                    }
                    let start = self.accumulator_pos;
                    self.buffer[..FRAME_HEADER_SIZE]
                        .copy_from_slice(&self.accumulator[start..start + FRAME_HEADER_SIZE]);
                    self.accumulator_pos += FRAME_HEADER_SIZE;

                    let (id, len) = parse_header(&self.buffer[..FRAME_HEADER_SIZE]);
                    if len < 0 {
                        // Unrecoverable framing: drop everything buffered.
                        self.frames_rejected += 1;
                        self.accumulator.clear();
                        self.accumulator_pos = 0;
                        return None;
                    }
                    if len as usize > self.max_size {
                        self.frames_rejected += 1;
                        log::debug!(
                            target: "rdsync::recv",
                            "skipping oversized frame for id {} ({} bytes)",
                            id,
                            len
                        );
                        self.state = ReadState::Skipping {
                            remaining: len as usize,
                        };
                        continue;
                    }
                    match self.finish_header() {
                        Ok(Some(frame)) => return Some(frame),
                        Ok(None) => {}
                        Err(_) => return None,
                    }
                }

                ReadState::Skipping { remaining } => {
                    let skip = remaining.min(available);
                    self.accumulator_pos += skip;
                    if skip < remaining {
                        self.state = ReadState::Skipping {
                            remaining: remaining - skip,
                        };
                        return None;
                    }
                    self.state = ReadState::default();
                }

                ReadState::ReadingBody {
                    expected_len,
                    bytes_read,
                } => {
                    let needed = expected_len - bytes_read;
                    if available < needed {
                        return None;
                    }
                    let start = self.accumulator_pos;
                    self.buffer[bytes_read..expected_len]
                        .copy_from_slice(&self.accumulator[start..start + needed]);
                    self.accumulator_pos += needed;
                    return Some(self.finish_body(expected_len));
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
