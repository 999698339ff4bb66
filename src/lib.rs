//! # mirrorcast
//!
//! Device screen-mirroring session protocol: video streaming over one
//! socket channel and control message relay over another.
//!
//! This crate contains:
//! - **Channels**: `ByteChannel` for suspending reads/writes over any
//!   byte stream, with cooperative close
//! - **Wire protocol**: `VideoPacketHeader`, the codec-name handshake,
//!   and the `ControlMessage` tagged union
//! - **Video**: `DisplayImage` plus the `VideoEncoder`/`VideoDecoder`
//!   seam, with a bundled zstd codec
//! - **Device side**: `DisplayStreamer`, `DeviceController`, and the
//!   composed `DeviceAgent`
//! - **Host side**: `MirroringSession` lifecycle, `VideoReceiver`,
//!   and the `ClientCoordinator` for input mapping
//! - **Benchmark**: a touch round-trip latency harness
//! - **Error**: `MirrorError`, a typed `thiserror`-based error
//!   hierarchy, with `Disconnect` for end-of-session reasons

pub mod agent;
pub mod benchmark;
pub mod channel;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod session;
pub mod streamer;
pub mod video;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use agent::{AgentConfig, AgentExit, DeviceAgent, DeviceState, DisplayHandle};
pub use benchmark::{BenchmarkConfig, BenchmarkOutcome, BenchmarkReport, run_benchmark};
pub use channel::ByteChannel;
pub use controller::{ControlDelegate, DeviceController, NotificationSender};
pub use coordinator::{ClientCoordinator, PointerIdAllocator, Viewport};
pub use error::{Disconnect, MirrorError};
pub use protocol::{
    CHANNEL_HEADER_LENGTH, ControlMessage, KeyAction, MotionAction, PHYSICAL_DEVICE_STATE,
    Pointer, VideoPacketHeader,
};
pub use session::{MirroringSession, SessionState};
pub use streamer::{
    DisplaySettings, DisplayStreamer, Size, VideoFrame, VideoReceiver, negotiate_video_size,
};
pub use video::{DisplayImage, EncodedPacket, VideoDecoder, VideoEncoder, ZstdDecoder, ZstdEncoder};
