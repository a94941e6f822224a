//! Stream multiplexing used by attached execs without a TTY.
//!
//! Each frame is an 8-byte header `[stream, 0, 0, 0, len_be_u32]`
//! followed by `len` payload bytes.

use std::borrow::Cow;

const HEADER_LEN: usize = 8;

/// Origin of a multiplexed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard input (echoed back by some runtimes).
    Stdin,
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl StreamKind {
    const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }

    const fn as_byte(self) -> u8 {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }
}

/// One decoded frame borrowing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Stream the payload belongs to.
    pub kind: StreamKind,
    /// Payload bytes.
    pub payload: &'a [u8],
}

/// Splits `raw` into frames.
///
/// Returns `None` unless the whole buffer is a sequence of well-formed
/// frames.
#[must_use]
pub fn parse_frames(raw: &[u8]) -> Option<Vec<Frame<'_>>> {
    let mut frames = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        if rest.len() < HEADER_LEN || rest[1..4] != [0, 0, 0] {
            return None;
        }
        let kind = StreamKind::from_byte(rest[0])?;
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = HEADER_LEN.checked_add(len)?;
        if rest.len() < end {
            return None;
        }
        frames.push(Frame {
            kind,
            payload: &rest[HEADER_LEN..end],
        });
        rest = &rest[end..];
    }
    Some(frames)
}

/// Returns the combined output carried by `raw`.
///
/// Frame payloads are concatenated in arrival order. Buffers that are not
/// multiplexed are returned unchanged.
#[must_use]
pub fn combined(raw: &[u8]) -> Cow<'_, [u8]> {
    match parse_frames(raw) {
        Some(frames) if !frames.is_empty() => {
            Cow::Owned(frames.iter().flat_map(|f| f.payload.iter().copied()).collect())
        }
        _ => Cow::Borrowed(raw),
    }
}

/// Encodes `payload` as frames of the given stream.
#[must_use]
pub fn encode(kind: StreamKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + HEADER_LEN);
    let mut push = |chunk: &[u8]| {
        let len = u32::try_from(chunk.len()).unwrap_or(u32::MAX);
        out.extend_from_slice(&[kind.as_byte(), 0, 0, 0]);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(chunk);
    };
    if payload.is_empty() {
        push(payload);
    }
    for chunk in payload.chunks(u32::MAX as usize) {
        push(chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_frames_keep_arrival_order() {
        let mut raw = encode(StreamKind::Stdout, b"restoring ");
        raw.extend(encode(StreamKind::Stderr, b"warning "));
        raw.extend(encode(StreamKind::Stdout, b"done"));

        let frames = parse_frames(&raw).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].kind, StreamKind::Stderr);
        assert_eq!(&*combined(&raw), b"restoring warning done");
    }

    #[test]
    fn plain_text_is_passed_through() {
        let raw = b"2024-01-01 finished restoring\n";
        assert!(parse_frames(raw).is_none());
        assert_eq!(&*combined(raw), raw);
    }

    #[test]
    fn truncated_frame_is_not_multiplexed() {
        let mut raw = encode(StreamKind::Stdout, b"hello");
        raw.truncate(raw.len() - 1);
        assert!(parse_frames(&raw).is_none());
        assert_eq!(combined(&raw).len(), raw.len());
    }

    #[test]
    fn empty_buffer_has_no_frames() {
        assert_eq!(parse_frames(b"").unwrap().len(), 0);
        assert!(combined(b"").is_empty());
    }

    #[test]
    fn empty_payload_frame_is_valid() {
        let raw = encode(StreamKind::Stderr, b"");
        assert_eq!(raw.len(), 8);
        assert!(combined(&raw).is_empty());
    }
}
