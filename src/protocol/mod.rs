//! Wire protocol codec.
//!
//! Two message families travel between the device and the host:
//!
//! - the **video channel** carries a one-time codec-name header
//!   followed by a sequence of [`VideoPacketHeader`]-prefixed encoded
//!   payloads ([`video`]);
//! - the **control channel** carries variant-tagged [`ControlMessage`]s
//!   in both directions ([`control`]).
//!
//! Encodings are byte-accurate: fixed-width little-endian integers and
//! length-prefixed variable fields, identical on both session ends
//! regardless of host architecture.

pub mod control;
pub mod video;

pub use control::{ControlMessage, KeyAction, MotionAction, PHYSICAL_DEVICE_STATE, Pointer};
pub use video::{CHANNEL_HEADER_LENGTH, VideoPacketHeader};
