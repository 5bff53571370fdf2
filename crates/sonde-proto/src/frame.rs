//! Frame structure and serialization

use crate::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Frame flags for connection control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// No special flags
    pub const NONE: Self = Self(0);
    /// Deliberate close announcement; EOF without this flag means the
    /// remote peer vanished
    pub const BYE: Self = Self(1);

    /// Check if a flag is set
    pub fn has_flag(self, flag: FrameFlags) -> bool {
        (self.0 & flag.0) != 0
    }
}

/// One unit of the agent wire protocol
///
/// A connection carries exactly one logical conversation, so frames need
/// no stream identifier; the serial only exists for log correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Per-connection serial, assigned by the sender
    pub serial: u32,
    /// Frame flags
    pub flags: FrameFlags,
    /// Serialized [`crate::Message`], empty for pure control frames
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame carrying a message payload
    pub fn data(serial: u32, payload: Bytes) -> Self {
        Self {
            serial,
            flags: FrameFlags::NONE,
            payload,
        }
    }

    /// Create a deliberate-close frame
    pub fn bye(serial: u32) -> Self {
        Self {
            serial,
            flags: FrameFlags::BYE,
            payload: Bytes::new(),
        }
    }

    /// Check whether this frame announces a deliberate close
    pub fn is_bye(&self) -> bool {
        self.flags.has_flag(FrameFlags::BYE)
    }

    /// Serialize the frame to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize a frame from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_data_frame() {
        let frame = Frame::data(7, Bytes::from("payload"));
        assert_eq!(frame.serial, 7);
        assert!(!frame.is_bye());
        assert_eq!(frame.payload, Bytes::from("payload"));
    }

    #[test]
    fn test_bye_frame() {
        let frame = Frame::bye(3);
        assert!(frame.is_bye());
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_msgpack_roundtrip() {
        let original = Frame::data(42, Bytes::from("script message"));
        let bytes = original.to_msgpack().unwrap();
        let decoded = Frame::from_msgpack(&bytes).unwrap();

        assert_eq!(original.serial, decoded.serial);
        assert_eq!(original.flags, decoded.flags);
        assert_eq!(original.payload, decoded.payload);
    }

    proptest! {
        #[test]
        fn test_frame_roundtrip_properties(
            serial in any::<u32>(),
            flags in any::<u8>(),
            payload in prop::collection::vec(any::<u8>(), 0..1024)
        ) {
            let frame = Frame {
                serial,
                flags: FrameFlags(flags),
                payload: Bytes::from(payload),
            };

            let bytes = frame.to_msgpack().unwrap();
            let decoded = Frame::from_msgpack(&bytes).unwrap();

            prop_assert_eq!(frame.serial, decoded.serial);
            prop_assert_eq!(frame.flags, decoded.flags);
            prop_assert_eq!(frame.payload, decoded.payload);
        }
    }
}
