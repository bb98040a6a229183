//! Framing for one vote exchange.
//!
//! Inbound, the codec first reports which protocol the peer is speaking
//! (from the first two bytes), then yields exactly one frame: a fixed-size
//! RSA block for V1 or a length-prefixed JSON body for V2. Bytes after the
//! frame are discarded. Outbound it writes the greeting and the V2
//! acknowledgement line.

use crate::config::{MAX_ENCODABLE_FRAME_SIZE, V2_MAGIC};
use crate::core::envelope::StatusReply;
use crate::error::{DecodeError, ProtocolError, Result};
use crate::protocol::ProtocolVersion;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Bytes in the V2 length prefix
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Item produced by [`VoteFrameCodec`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Protocol selected from the first bytes on the wire
    Negotiated(ProtocolVersion),
    /// The complete vote frame (magic and length prefix stripped)
    Frame(Bytes),
}

/// Item written by [`VoteFrameCodec`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Greeting line, newline included
    Greeting(String),
    /// `{"status":"ok"}\r\n`
    Acknowledge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Detect,
    Block,
    Length,
    Body(usize),
    Done,
}

/// Codec for a single vote exchange
#[derive(Debug)]
pub struct VoteFrameCodec {
    state: FrameState,
    /// RSA modulus size in bytes; `None` when the listener has no key pair
    block_size: Option<usize>,
    /// Whether the V2 magic is recognised at all
    v2_enabled: bool,
    max_frame_size: usize,
}

impl VoteFrameCodec {
    pub fn new(block_size: Option<usize>, max_frame_size: usize) -> Self {
        Self {
            state: FrameState::Detect,
            block_size,
            v2_enabled: true,
            max_frame_size,
        }
    }

    /// Turn V2 detection on or off. With V2 off every stream is a legacy
    /// block, even one whose ciphertext happens to open with the magic.
    pub fn with_v2(mut self, enabled: bool) -> Self {
        self.v2_enabled = enabled;
        self
    }

    /// Whether the one frame of this exchange has been produced
    pub fn is_done(&self) -> bool {
        self.state == FrameState::Done
    }
}

impl Decoder for VoteFrameCodec {
    type Item = Inbound;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>> {
        loop {
            match self.state {
                FrameState::Detect => {
                    if src.len() < V2_MAGIC.len() {
                        return Ok(None);
                    }
                    if self.v2_enabled && src[..V2_MAGIC.len()] == V2_MAGIC {
                        src.advance(V2_MAGIC.len());
                        self.state = FrameState::Length;
                        return Ok(Some(Inbound::Negotiated(ProtocolVersion::V2)));
                    }
                    // Legacy blocks carry no magic; these bytes open the block.
                    self.state = FrameState::Block;
                    return Ok(Some(Inbound::Negotiated(ProtocolVersion::V1)));
                }
                FrameState::Block => {
                    let block = self.block_size.ok_or(DecodeError::UnknownOpcode)?;
                    if src.len() < block {
                        src.reserve(block - src.len());
                        return Ok(None);
                    }
                    let frame = src.split_to(block).freeze();
                    self.state = FrameState::Done;
                    return Ok(Some(Inbound::Frame(frame)));
                }
                FrameState::Length => {
                    if src.len() < LENGTH_PREFIX_LEN {
                        return Ok(None);
                    }
                    let len = u16::from_be_bytes([src[0], src[1]]) as usize;
                    if len > self.max_frame_size {
                        return Err(DecodeError::FrameTooLarge.into());
                    }
                    if len == 0 {
                        return Err(DecodeError::MalformedPayload.into());
                    }
                    src.advance(LENGTH_PREFIX_LEN);
                    self.state = FrameState::Body(len);
                }
                FrameState::Body(len) => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let frame = src.split_to(len).freeze();
                    self.state = FrameState::Done;
                    return Ok(Some(Inbound::Frame(frame)));
                }
                FrameState::Done => {
                    src.clear();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>> {
        // A truncated frame simply ends the stream; the session decides what
        // an early close means.
        let item = self.decode(src)?;
        if item.is_none() {
            src.clear();
        }
        Ok(item)
    }
}

impl Encoder<Outbound> for VoteFrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<()> {
        match item {
            Outbound::Greeting(line) => {
                dst.reserve(line.len());
                dst.put_slice(line.as_bytes());
            }
            Outbound::Acknowledge => {
                let body = serde_json::to_vec(&StatusReply::ok())?;
                dst.reserve(body.len() + 2);
                dst.put_slice(&body);
                dst.put_slice(b"\r\n");
            }
        }
        Ok(())
    }
}

/// Build a V2 wire frame around `body`.
pub fn encode_v2_frame(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_ENCODABLE_FRAME_SIZE {
        return Err(DecodeError::FrameTooLarge.into());
    }
    let mut frame = Vec::with_capacity(V2_MAGIC.len() + LENGTH_PREFIX_LEN + body.len());
    frame.extend_from_slice(&V2_MAGIC);
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}
