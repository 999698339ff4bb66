//! Display streaming.
//!
//! The device side turns display contents into a numbered sequence of
//! encoded video packets ([`DisplayStreamer`]); the host side turns
//! the inbound byte stream back into frames ([`VideoReceiver`]),
//! enforcing the strict frame-number sequencing invariant.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::debug;

use crate::channel::ByteChannel;
use crate::error::MirrorError;
use crate::protocol::video::{
    CHANNEL_HEADER_LENGTH, VideoPacketHeader, decode_channel_header, encode_channel_header,
};
use crate::video::{DisplayImage, VideoDecoder, VideoEncoder};

// ── Size ─────────────────────────────────────────────────────────

/// A display dimension in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// The size after rotating by the given quarter turns.
    pub fn rotated_by_quadrants(self, quadrants: i32) -> Size {
        if quadrants.rem_euclid(2) == 0 {
            self
        } else {
            Size::new(self.height, self.width)
        }
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ── DisplaySettings ──────────────────────────────────────────────

/// The mutable per-session display parameters.
///
/// Written only by the controller's dispatch (single writer); the
/// streamer takes one consistent snapshot per encode cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplaySettings {
    /// Current orientation in quarter turns (0–3).
    pub orientation: i32,
    /// Negotiated cap on the encoded video size.
    pub max_resolution: Size,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            orientation: 0,
            max_resolution: Size::new(u32::MAX, u32::MAX),
        }
    }
}

// ── Resolution negotiation ───────────────────────────────────────

/// Smallest usable encode dimension; requests below this are floored.
pub const MIN_VIDEO_DIMENSION: u32 = 128;

/// Compute the encoded video size for a physical display under a
/// resolution cap.
///
/// The display's aspect ratio is preserved by scaling both dimensions
/// with the single factor that fits the rotated display inside the
/// cap. The width is aligned up to a multiple of 8 and the height to
/// a multiple of 2 (codec block alignment), then both are clamped so
/// the result never exceeds the physical size.
pub fn negotiate_video_size(physical: Size, orientation: i32, max_resolution: Size) -> Size {
    let rotated = physical.rotated_by_quadrants(orientation);
    let (dw, dh) = (rotated.width as f64, rotated.height as f64);

    let fit = (max_resolution.width as f64 / dw).min(max_resolution.height as f64 / dh);
    let floor = (MIN_VIDEO_DIMENSION as f64 / dw).max(MIN_VIDEO_DIMENSION as f64 / dh);
    let scale = fit.min(1.0).max(floor.min(1.0));

    let width = round_up((dw * scale).round() as u32, 8).min(round_down(rotated.width, 8).max(8));
    let height = round_up((dh * scale).round() as u32, 2).min(round_down(rotated.height, 2).max(2));
    Size::new(width, height)
}

fn round_up(value: u32, multiple: u32) -> u32 {
    value.div_ceil(multiple) * multiple
}

fn round_down(value: u32, multiple: u32) -> u32 {
    value / multiple * multiple
}

// ── DisplayStreamer ──────────────────────────────────────────────

/// Device-side video producer.
///
/// Owns the session's frame-number counter, the single source of
/// truth for the video sequence, and the presentation timestamp
/// offset. One encode cycle per display change; no fixed frame rate.
pub struct DisplayStreamer {
    channel: ByteChannel,
    encoder: Box<dyn VideoEncoder>,
    physical_size: Size,
    settings: watch::Receiver<DisplaySettings>,
    frame_number: Arc<AtomicU64>,
    presentation_offset: i64,
}

impl DisplayStreamer {
    pub fn new(
        channel: ByteChannel,
        encoder: Box<dyn VideoEncoder>,
        physical_size: Size,
        settings: watch::Receiver<DisplaySettings>,
    ) -> Self {
        Self {
            channel,
            encoder,
            physical_size,
            settings,
            frame_number: Arc::new(AtomicU64::new(0)),
            presentation_offset: 0,
        }
    }

    /// Write the one-time codec identification header. Must be the
    /// first bytes on the video channel.
    pub async fn send_channel_header(&self) -> Result<(), MirrorError> {
        let header = encode_channel_header(self.encoder.codec_name())?;
        self.channel.write(&header).await
    }

    /// A shared handle on the frame-number counter (read by tests and
    /// the agent's status surface).
    pub fn frame_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.frame_number)
    }

    /// Run one encode cycle for the given display contents.
    ///
    /// Takes a single settings snapshot, rotates and scales the image
    /// to the negotiated size, encodes it, drains any delayed encoder
    /// output, and sends every produced packet with a fresh frame
    /// number in encounter order. A closed channel mid-send is a
    /// normal disconnect, not an error.
    pub async fn render(&mut self, contents: &DisplayImage) -> Result<(), MirrorError> {
        let settings = *self.settings.borrow();
        let video_size =
            negotiate_video_size(self.physical_size, settings.orientation, settings.max_resolution);

        let rotated = contents.rotated_by_quadrants(settings.orientation);
        let scaled = rotated.scaled_to(video_size.width, video_size.height);

        self.encoder.configure(video_size.width, video_size.height)?;
        let pts_us = monotonic_pts_us();
        let mut packets = self.encoder.encode(&scaled, pts_us)?;
        packets.extend(self.encoder.flush()?);

        for packet in packets {
            let header = VideoPacketHeader {
                display_width: video_size.width as i32,
                display_height: video_size.height as i32,
                display_orientation: settings.orientation,
                packet_size: packet.data.len() as i32,
                frame_number: self.frame_number.fetch_add(1, Ordering::SeqCst),
                origination_timestamp_us: wall_clock_us(),
                presentation_timestamp_us: self
                    .session_presentation_us(packet.presentation_timestamp_us),
            };

            let mut buffer = Vec::with_capacity(VideoPacketHeader::WIRE_SIZE + packet.data.len());
            buffer.extend_from_slice(&header.encode());
            buffer.extend_from_slice(&packet.data);
            match self.channel.write(&buffer).await {
                Ok(()) => {}
                Err(e) if e.is_lost_connection() => {
                    // The host closed the socket; nothing left to send.
                    debug!("video channel closed while sending frame {}", header.frame_number);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Map an encoder pts to the session-relative presentation clock.
    /// The first non-trivial pts establishes the offset, so session
    /// presentation timestamps start near zero.
    fn session_presentation_us(&mut self, pts_us: i64) -> i64 {
        if pts_us == 0 {
            return 0;
        }
        if self.presentation_offset == 0 {
            self.presentation_offset = pts_us - 1;
        }
        pts_us - self.presentation_offset
    }
}

fn wall_clock_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn monotonic_pts_us() -> i64 {
    // Encoder pts only needs to be monotonic within a session.
    wall_clock_us()
}

// ── VideoReceiver ────────────────────────────────────────────────

/// A decoded frame with its per-packet stream metadata.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: DisplayImage,
    /// Encoded size as negotiated for this packet.
    pub display_size: Size,
    /// Orientation the image was captured at, in quarter turns.
    pub orientation: i32,
    pub frame_number: u64,
    pub origination_timestamp_us: i64,
    pub presentation_timestamp_us: i64,
}

/// Host-side video consumer: reads headers and payloads off the video
/// channel, verifies sequencing, and decodes payloads to images.
pub struct VideoReceiver {
    channel: ByteChannel,
    decoder: Box<dyn VideoDecoder>,
    expected_frame_number: u64,
}

impl VideoReceiver {
    pub fn new(channel: ByteChannel, decoder: Box<dyn VideoDecoder>) -> Self {
        Self {
            channel,
            decoder,
            expected_frame_number: 0,
        }
    }

    /// Read the 20-byte codec identification header. Must be called
    /// exactly once, before [`next_frame`](Self::next_frame).
    ///
    /// Fails with [`MirrorError::ProtocolViolation`] if the peer's
    /// codec does not match the local decoder.
    pub async fn read_channel_header(&mut self) -> Result<String, MirrorError> {
        let bytes = self.channel.read_exact(CHANNEL_HEADER_LENGTH).await?;
        let name = decode_channel_header(&bytes)?;
        if name != self.decoder.codec_name() {
            return Err(MirrorError::ProtocolViolation("codec mismatch on video channel"));
        }
        Ok(name)
    }

    /// Read and decode the next video frame, suspending until one is
    /// available.
    ///
    /// A frame-number gap is fatal: it means a packet was lost or
    /// corrupted and the sequence cannot be trusted afterwards.
    pub async fn next_frame(&mut self) -> Result<VideoFrame, MirrorError> {
        let header_bytes = self.channel.read_exact(VideoPacketHeader::WIRE_SIZE).await?;
        let header = VideoPacketHeader::decode(&header_bytes)?;

        if header.frame_number != self.expected_frame_number {
            return Err(MirrorError::FrameNumberGap {
                expected: self.expected_frame_number,
                actual: header.frame_number,
            });
        }
        self.expected_frame_number += 1;

        let payload = self.channel.read_exact(header.packet_size as usize).await?;
        let image = self.decoder.decode(
            header.display_width as u32,
            header.display_height as u32,
            &payload,
        )?;

        Ok(VideoFrame {
            image,
            display_size: Size::new(header.display_width as u32, header.display_height as u32),
            orientation: header.display_orientation,
            frame_number: header.frame_number,
            origination_timestamp_us: header.origination_timestamp_us,
            presentation_timestamp_us: header.presentation_timestamp_us,
        })
    }

    /// The frame number the receiver expects next.
    pub fn expected_frame_number(&self) -> u64 {
        self.expected_frame_number
    }
}

// ── Tests ────────────────────────────────────────────────────────
