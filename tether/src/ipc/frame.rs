//! One datagram on the wire.
//!
//! ```text
//! ┌──────────┬─────────────┬──────────┬──────────┬──────────────────┐
//! │ to (ctx) │ signature   │ origin   │ priority │ payload (opt)    │
//! └──────────┴─────────────┴──────────┴──────────┴──────────────────┘
//! ```
//!
//! The whole frame is postcard-encoded; the payload bytes are produced by the
//! codec registered for the signature's type tag.

use serde::{Deserialize, Serialize};

use crate::dispatch::Signature;
use crate::types::{Context, Priority};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame encoding failed: {0}")]
    Encode(#[source] postcard::Error),
    #[error("frame decoding failed: {0}")]
    Decode(#[source] postcard::Error),
    #[error("frame of {len} bytes exceeds capacity {cap}")]
    TooLarge { len: usize, cap: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    /// Destination context on the receiving side.
    pub to: Context,
    pub signature: Signature,
    pub origin: Context,
    pub priority: Priority,
    pub payload: Option<Vec<u8>>,
}

impl WireFrame {
    /// Encodes the frame, refusing anything over `cap` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLarge`] if the encoded frame does not fit.
    pub fn encode(&self, cap: usize) -> Result<Vec<u8>, FrameError> {
        let bytes = postcard::to_allocvec(self).map_err(FrameError::Encode)?;
        if bytes.len() > cap {
            return Err(FrameError::TooLarge {
                len: bytes.len(),
                cap,
            });
        }
        Ok(bytes)
    }

    /// # Errors
    ///
    /// Returns [`FrameError::Decode`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        postcard::from_bytes(bytes).map_err(FrameError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Interaction, Route};
    use crate::types::{ProcessId, SeqId, ServiceId, ThreadId};

    fn frame() -> WireFrame {
        let route = Route {
            role: "media".into(),
            interaction: Interaction::Request,
            from: ServiceId(3),
            to: ServiceId(4),
            seq: SeqId(17),
        };
        WireFrame {
            to: Context::new(ThreadId(1), ProcessId(2)),
            signature: Signature::routed("player::method", "play", route),
            origin: Context::new(ThreadId(0), ProcessId(9)),
            priority: Priority(3),
            payload: Some(vec![1, 2, 3]),
        }
    }

    #[test]
    fn routed_frame_survives_the_wire() {
        let original = frame();
        let bytes = original.encode(4096).unwrap();
        let decoded = WireFrame::decode(&bytes).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.signature.route().map(|r| r.seq), Some(SeqId(17)));
    }

    #[test]
    fn oversized_frame_is_refused() {
        let mut big = frame();
        big.payload = Some(vec![0; 128]);
        assert!(matches!(big.encode(64), Err(FrameError::TooLarge { cap: 64, .. })));
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(WireFrame::decode(&[0xff; 3]), Err(FrameError::Decode(_))));
    }
}
