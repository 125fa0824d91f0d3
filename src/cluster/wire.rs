//! Binary framing for the gather exchange.
//!
//! Every frame is a 16 byte header followed by a type-specific payload.
//! All integers are little-endian.
//!
//! ```text
//! 0      4     5      6          8      12           16
//! | TAGG | ver | type | reserved | rank | payload len | payload ...
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::stats::ProcessSummary;

/// Frame magic, `TAGG` on the wire.
pub const MAGIC: [u8; 4] = *b"TAGG";
/// Supported wire format version.
pub const VERSION: u8 = 1;
/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 16;
/// Size of the NUL-padded process name in a summary record.
pub const COMM_LEN: usize = 256;
/// Size of one encoded summary record.
pub const RECORD_LEN: usize = 4 + 4 + 8 + 8 + 8 + 8 + 8 + 8 + COMM_LEN;
/// Largest payload accepted from a peer.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;
/// Most summaries one `Records` frame can carry.
pub const MAX_RECORDS_PER_FRAME: usize = MAX_PAYLOAD_LEN / RECORD_LEN;

/// Codec failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("bad magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("short header: {0} bytes")]
    ShortHeader(usize),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("{frame_type} payload truncated: got {got} bytes, expected {expected}")]
    Truncated {
        frame_type: FrameType,
        got: usize,
        expected: usize,
    },

    #[error("payload of {len} bytes exceeds limit of {MAX_PAYLOAD_LEN}")]
    Oversized { len: usize },
}

/// Discriminant carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Hello = 1,
    Count = 2,
    Proceed = 3,
    Abort = 4,
    Records = 5,
    Done = 6,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Hello),
            2 => Some(Self::Count),
            3 => Some(Self::Proceed),
            4 => Some(Self::Abort),
            5 => Some(Self::Records),
            6 => Some(Self::Done),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Count => "count",
            Self::Proceed => "proceed",
            Self::Abort => "abort",
            Self::Records => "records",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub frame_type: FrameType,
    /// Rank of the sender.
    pub rank: u32,
    pub payload_len: usize,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Worker registration; the rank travels in the header.
    Hello,
    /// Number of summaries a worker holds this cycle.
    Count(u64),
    /// Coordinator has room; send records.
    Proceed,
    /// Coordinator cannot take the cycle's records.
    Abort { incoming: u64, free: u64 },
    Records(Vec<ProcessSummary>),
    /// Merge finished; the cycle's barrier.
    Done,
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Hello => FrameType::Hello,
            Self::Count(_) => FrameType::Count,
            Self::Proceed => FrameType::Proceed,
            Self::Abort { .. } => FrameType::Abort,
            Self::Records(_) => FrameType::Records,
            Self::Done => FrameType::Done,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::Hello | Self::Proceed | Self::Done => 0,
            Self::Count(_) => 8,
            Self::Abort { .. } => 16,
            Self::Records(records) => records.len() * RECORD_LEN,
        }
    }
}

/// Appends the encoded frame to `buf`.
pub fn encode_frame(rank: u32, frame: &Frame, buf: &mut BytesMut) -> Result<(), WireError> {
    let len = frame.payload_len();
    if len > MAX_PAYLOAD_LEN {
        return Err(WireError::Oversized { len });
    }

    buf.reserve(HEADER_LEN + len);
    buf.put_slice(&MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(frame.frame_type() as u8);
    buf.put_u16_le(0);
    buf.put_u32_le(rank);
    buf.put_u32_le(len as u32);

    match frame {
        Frame::Hello | Frame::Proceed | Frame::Done => {}
        Frame::Count(n) => buf.put_u64_le(*n),
        Frame::Abort { incoming, free } => {
            buf.put_u64_le(*incoming);
            buf.put_u64_le(*free);
        }
        Frame::Records(records) => {
            for r in records {
                encode_summary(r, buf);
            }
        }
    }

    Ok(())
}

/// Decodes and validates a frame header.
pub fn decode_header(mut b: &[u8]) -> Result<Header, WireError> {
    if b.len() < HEADER_LEN {
        return Err(WireError::ShortHeader(b.len()));
    }

    let mut magic = [0u8; 4];
    b.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(WireError::BadMagic(magic));
    }

    let version = b.get_u8();
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }

    let raw_type = b.get_u8();
    let frame_type = FrameType::from_u8(raw_type).ok_or(WireError::UnknownFrameType(raw_type))?;

    // reserved(2)
    b.advance(2);

    let rank = b.get_u32_le();
    let payload_len = b.get_u32_le() as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(WireError::Oversized { len: payload_len });
    }

    Ok(Header {
        frame_type,
        rank,
        payload_len,
    })
}

/// Decodes a payload whose header has already been read.
pub fn decode_payload(header: &Header, mut payload: Bytes) -> Result<Frame, WireError> {
    let expected = match header.frame_type {
        FrameType::Hello | FrameType::Proceed | FrameType::Done => 0,
        FrameType::Count => 8,
        FrameType::Abort => 16,
        FrameType::Records => payload.len().div_ceil(RECORD_LEN) * RECORD_LEN,
    };
    if payload.len() != expected {
        return Err(WireError::Truncated {
            frame_type: header.frame_type,
            got: payload.len(),
            expected,
        });
    }

    Ok(match header.frame_type {
        FrameType::Hello => Frame::Hello,
        FrameType::Proceed => Frame::Proceed,
        FrameType::Done => Frame::Done,
        FrameType::Count => Frame::Count(payload.get_u64_le()),
        FrameType::Abort => Frame::Abort {
            incoming: payload.get_u64_le(),
            free: payload.get_u64_le(),
        },
        FrameType::Records => {
            let mut records = Vec::with_capacity(payload.len() / RECORD_LEN);
            while payload.has_remaining() {
                records.push(decode_summary(&mut payload));
            }
            Frame::Records(records)
        }
    })
}

fn encode_summary(s: &ProcessSummary, buf: &mut BytesMut) {
    buf.put_u32_le(s.pid);
    buf.put_u32_le(s.rank);
    buf.put_i64_le(s.tx_kb);
    buf.put_i64_le(s.rx_kb);
    buf.put_u64_le(s.n_event);
    buf.put_f64_le(s.avg_latency_ms);
    buf.put_f64_le(s.avg_lifetime_ms);
    buf.put_f64_le(s.fraction_ipv6);

    let comm = truncate_utf8(&s.comm, COMM_LEN);
    buf.put_slice(comm.as_bytes());
    buf.put_bytes(0, COMM_LEN - comm.len());
}

/// Caller guarantees at least [`RECORD_LEN`] bytes remain.
fn decode_summary(b: &mut Bytes) -> ProcessSummary {
    let pid = b.get_u32_le();
    let rank = b.get_u32_le();
    let tx_kb = b.get_i64_le();
    let rx_kb = b.get_i64_le();
    let n_event = b.get_u64_le();
    let avg_latency_ms = b.get_f64_le();
    let avg_lifetime_ms = b.get_f64_le();
    let fraction_ipv6 = b.get_f64_le();

    let raw = b.split_to(COMM_LEN);
    let end = raw.iter().position(|&c| c == 0).unwrap_or(COMM_LEN);
    let comm = String::from_utf8_lossy(raw.get(..end).unwrap_or_default()).into_owned();

    ProcessSummary {
        pid,
        rank,
        tx_kb,
        rx_kb,
        n_event,
        avg_latency_ms,
        avg_lifetime_ms,
        fraction_ipv6,
        comm,
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.get(..end).unwrap_or_default()
}
