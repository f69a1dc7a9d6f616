//! Builder for multi-frame protocol messages.
//!
//! Control information travels as a JSON envelope frame; payloads and
//! routing information travel as their own frames around it.

use crate::envelope::{Ack, Envelope};
use bytes::Bytes;
use smallvec::SmallVec;

/// Addressing frames that precede the envelope of a routed request.
///
/// A direct responder sees four of them, a pooled responder five.
pub type RoutingHeader = SmallVec<[Bytes; 5]>;

/// Builder for a multi-frame message.
///
/// # Examples
///
/// ```
/// use liaison_core::envelope::Envelope;
/// use liaison_core::message::Frames;
///
/// // [identity, envelope, payload]
/// let frames = Frames::new()
///     .push_str("1:positions")
///     .push_envelope(&Envelope::new(liaison_core::envelope::MessageType::Stream))
///     .push(&b"payload"[..])
///     .into_frames();
/// assert_eq!(frames.len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frames {
    frames: Vec<Bytes>,
}

impl Frames {
    #[must_use]
    pub const fn new() -> Self {
        Self { frames: Vec::new() }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
        }
    }

    /// Start a reply addressed through `header`.
    #[must_use]
    pub fn routed(header: &RoutingHeader) -> Self {
        let mut frames = Vec::with_capacity(header.len() + 2);
        frames.extend(header.iter().cloned());
        Self { frames }
    }

    #[must_use]
    pub fn push(mut self, frame: impl Into<Bytes>) -> Self {
        self.frames.push(frame.into());
        self
    }

    #[must_use]
    pub fn push_str(mut self, s: &str) -> Self {
        self.frames.push(Bytes::copy_from_slice(s.as_bytes()));
        self
    }

    /// Empty frames delimit routing envelopes.
    #[must_use]
    pub fn push_empty(mut self) -> Self {
        self.frames.push(Bytes::new());
        self
    }

    #[must_use]
    pub fn push_envelope(mut self, envelope: &Envelope) -> Self {
        self.frames.push(envelope.encode());
        self
    }

    #[must_use]
    pub fn push_ack(mut self, ack: &Ack) -> Self {
        self.frames.push(ack.encode());
        self
    }

    /// Append payload parts, copying borrowed slices.
    #[must_use]
    pub fn push_parts(mut self, parts: &[&[u8]]) -> Self {
        self.frames
            .extend(parts.iter().map(|part| Bytes::copy_from_slice(part)));
        self
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    #[must_use]
    pub fn into_frames(self) -> Vec<Bytes> {
        self.frames
    }
}

impl From<Vec<Bytes>> for Frames {
    fn from(frames: Vec<Bytes>) -> Self {
        Self { frames }
    }
}

impl IntoIterator for Frames {
    type Item = Bytes;
    type IntoIter = std::vec::IntoIter<Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;
    use smallvec::smallvec;

    #[test]
    fn test_routed_reply_layout() {
        let header: RoutingHeader = smallvec![
            Bytes::from_static(b"peer"),
            Bytes::new(),
            Bytes::from_static(b"1:rpc"),
            Bytes::new(),
        ];
        let frames = Frames::routed(&header)
            .push_envelope(&Envelope::response())
            .push_parts(&[&b"pong"[..]])
            .into_frames();

        assert_eq!(frames.len(), 6);
        assert_eq!(&frames[..4], &header[..]);
        assert_eq!(
            Envelope::decode(&frames[4]).unwrap().kind(),
            MessageType::Response
        );
        assert_eq!(&frames[5][..], b"pong");
    }

    #[test]
    fn test_empty_frames_are_preserved() {
        let frames = Frames::new().push_empty().push_parts(&[&b""[..], &b"x"[..]]);
        assert_eq!(frames.len(), 3);
        assert!(frames.frames()[0].is_empty());
        assert!(frames.frames()[1].is_empty());
    }

    #[test]
    fn test_ack_frame() {
        let frames = Frames::new().push_ack(&Ack::ok()).into_frames();
        assert!(Ack::decode(&frames[0]).unwrap().is_ok());
    }
}
