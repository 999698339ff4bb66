//! Video channel wire format.
//!
//! Upon connecting, the device writes a fixed-length space-padded
//! ASCII codec name before any packet data. Every encoded payload is
//! then prefixed by a fixed-layout header.
//!
//! **Video packet header** (40 bytes, little-endian):
//! ```text
//! display_width:              i32  (4)
//! display_height:             i32  (4)
//! display_orientation:        i32  (4)
//! packet_size:                i32  (4)
//! frame_number:               i64  (8)
//! origination_timestamp_us:   i64  (8)
//! presentation_timestamp_us:  i64  (8)
//! ```

use crate::error::MirrorError;

// ── Constants ────────────────────────────────────────────────────

/// Length of the one-time codec-name header on the video channel.
pub const CHANNEL_HEADER_LENGTH: usize = 20;

// ── Channel header ───────────────────────────────────────────────

/// Encode a codec name as the fixed-length channel header.
///
/// The name must be non-empty ASCII and fit in
/// [`CHANNEL_HEADER_LENGTH`] bytes; the remainder is space-padded.
pub fn encode_channel_header(codec_name: &str) -> Result<[u8; CHANNEL_HEADER_LENGTH], MirrorError> {
    if codec_name.is_empty() || !codec_name.is_ascii() || codec_name.contains(' ') {
        return Err(MirrorError::MalformedMessage("codec name must be non-empty ASCII"));
    }
    if codec_name.len() > CHANNEL_HEADER_LENGTH {
        return Err(MirrorError::MalformedMessage("codec name too long"));
    }
    let mut header = [b' '; CHANNEL_HEADER_LENGTH];
    header[..codec_name.len()].copy_from_slice(codec_name.as_bytes());
    Ok(header)
}

/// Decode a received channel header back into the codec name.
pub fn decode_channel_header(header: &[u8]) -> Result<String, MirrorError> {
    if header.len() != CHANNEL_HEADER_LENGTH {
        return Err(MirrorError::MalformedMessage("channel header has wrong length"));
    }
    if !header.is_ascii() {
        return Err(MirrorError::MalformedMessage("channel header is not ASCII"));
    }
    let name = std::str::from_utf8(header)
        .map_err(|_| MirrorError::MalformedMessage("channel header is not ASCII"))?
        .trim_end_matches(' ');
    if name.is_empty() {
        return Err(MirrorError::MalformedMessage("channel header has empty codec name"));
    }
    Ok(name.to_string())
}

// ── VideoPacketHeader ────────────────────────────────────────────

/// Per-packet metadata sent immediately before each encoded payload.
///
/// Width, height and orientation are those negotiated at encode time,
/// so they may differ per packet when the resolution or orientation
/// changes mid-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoPacketHeader {
    pub display_width: i32,
    pub display_height: i32,
    /// Display rotation in quarter turns (0–3).
    pub display_orientation: i32,
    /// Size in bytes of the encoded payload that follows.
    pub packet_size: i32,
    /// Monotonic sequence number, starting at 0, incremented by 1 for
    /// every packet sent on a given video channel.
    pub frame_number: u64,
    /// Wall-clock time at encode, microseconds since the Unix epoch.
    pub origination_timestamp_us: i64,
    /// Encoder-relative presentation offset in microseconds.
    pub presentation_timestamp_us: i64,
}

impl VideoPacketHeader {
    /// Encoded size on the wire.
    pub const WIRE_SIZE: usize = 40;

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.display_width.to_le_bytes());
        buf[4..8].copy_from_slice(&self.display_height.to_le_bytes());
        buf[8..12].copy_from_slice(&self.display_orientation.to_le_bytes());
        buf[12..16].copy_from_slice(&self.packet_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.frame_number.to_le_bytes());
        buf[24..32].copy_from_slice(&self.origination_timestamp_us.to_le_bytes());
        buf[32..40].copy_from_slice(&self.presentation_timestamp_us.to_le_bytes());
        buf
    }

    /// Deserialize from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, MirrorError> {
        if data.len() < Self::WIRE_SIZE {
            return Err(MirrorError::MalformedMessage("video packet header too short"));
        }
        let header = Self {
            display_width: i32::from_le_bytes(data[0..4].try_into().unwrap()),
            display_height: i32::from_le_bytes(data[4..8].try_into().unwrap()),
            display_orientation: i32::from_le_bytes(data[8..12].try_into().unwrap()),
            packet_size: i32::from_le_bytes(data[12..16].try_into().unwrap()),
            frame_number: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            origination_timestamp_us: i64::from_le_bytes(data[24..32].try_into().unwrap()),
            presentation_timestamp_us: i64::from_le_bytes(data[32..40].try_into().unwrap()),
        };
        if header.display_width <= 0 || header.display_height <= 0 {
            return Err(MirrorError::MalformedMessage("non-positive display dimensions"));
        }
        if !(0..4).contains(&header.display_orientation) {
            return Err(MirrorError::MalformedMessage("orientation out of range"));
        }
        if header.packet_size < 0 {
            return Err(MirrorError::MalformedMessage("negative packet size"));
        }
        Ok(header)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_header_roundtrip() {
        let hdr = VideoPacketHeader {
            display_width: 1080,
            display_height: 2280,
            display_orientation: 3,
            packet_size: 65321,
            frame_number: u64::MAX / 2,
            origination_timestamp_us: 1_700_000_123_456_789,
            presentation_timestamp_us: 41_667,
        };

        let encoded = hdr.encode();
        assert_eq!(encoded.len(), VideoPacketHeader::WIRE_SIZE);
        let decoded = VideoPacketHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn packet_header_layout_is_little_endian() {
        let hdr = VideoPacketHeader {
            display_width: 0x0102_0304,
            display_height: 1,
            display_orientation: 0,
            packet_size: 0,
            frame_number: 0x0A0B_0C0D_0E0F_1011,
            origination_timestamp_us: 0,
            presentation_timestamp_us: 0,
        };
        let bytes = hdr.encode();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(
            &bytes[16..24],
            &[0x11, 0x10, 0x0F, 0x0E, 0x0D, 0x0C, 0x0B, 0x0A]
        );
    }

    #[test]
    fn packet_header_too_short() {
        let short = [0u8; VideoPacketHeader::WIRE_SIZE - 1];
        assert!(VideoPacketHeader::decode(&short).is_err());
    }

    #[test]
    fn packet_header_rejects_bad_orientation() {
        let mut hdr = VideoPacketHeader {
            display_width: 100,
            display_height: 100,
            display_orientation: 4,
            packet_size: 0,
            frame_number: 0,
            origination_timestamp_us: 0,
            presentation_timestamp_us: 0,
        };
        assert!(VideoPacketHeader::decode(&hdr.encode()).is_err());
        hdr.display_orientation = 0;
        hdr.display_width = 0;
        assert!(VideoPacketHeader::decode(&hdr.encode()).is_err());
    }

    #[test]
    fn channel_header_roundtrip() {
        let header = encode_channel_header("zstd").unwrap();
        assert_eq!(header.len(), CHANNEL_HEADER_LENGTH);
        assert_eq!(&header[..4], b"zstd");
        assert!(header[4..].iter().all(|&b| b == b' '));
        assert_eq!(decode_channel_header(&header).unwrap(), "zstd");
    }

    #[test]
    fn channel_header_rejects_invalid_names() {
        assert!(encode_channel_header("").is_err());
        assert!(encode_channel_header("name with space").is_err());
        assert!(encode_channel_header("a-codec-name-that-is-too-long").is_err());
        assert!(encode_channel_header("héllo").is_err());
    }

    #[test]
    fn channel_header_rejects_wrong_length() {
        assert!(decode_channel_header(b"zstd").is_err());
        assert!(decode_channel_header(&[b' '; CHANNEL_HEADER_LENGTH]).is_err());
    }
}
