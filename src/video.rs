//! Opaque video encode/decode boundary.
//!
//! The mirroring protocol does not define compression internals; it
//! only requires an encoder that turns display images into payload
//! packets (possibly buffering some internally) and a decoder that
//! turns payloads back into images. Those seams are the
//! [`VideoEncoder`] and [`VideoDecoder`] traits. A zstd-backed
//! implementation is bundled for the device agent and for tests.

use crate::error::MirrorError;

// ── DisplayImage ─────────────────────────────────────────────────

/// Raw display contents: tightly packed RGBA rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayImage {
    pub width: u32,
    pub height: u32,
    /// `width * height * 4` bytes.
    pub data: Vec<u8>,
}

impl DisplayImage {
    pub const BYTES_PER_PIXEL: usize = 4;

    /// A black image of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * Self::BYTES_PER_PIXEL],
        }
    }

    /// Wrap raw pixel data, validating its length.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, MirrorError> {
        let expected = width as usize * height as usize * Self::BYTES_PER_PIXEL;
        if data.len() != expected {
            return Err(MirrorError::Decoder(format!(
                "pixel buffer length {} does not match {width}x{height}",
                data.len()
            )));
        }
        Ok(Self { width, height, data })
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let off = (y as usize * self.width as usize + x as usize) * Self::BYTES_PER_PIXEL;
        self.data[off..off + 4].try_into().unwrap()
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let off = (y as usize * self.width as usize + x as usize) * Self::BYTES_PER_PIXEL;
        self.data[off..off + 4].copy_from_slice(&rgba);
    }

    /// Rotate clockwise by the given number of quarter turns.
    /// Negative values rotate counter-clockwise.
    pub fn rotated_by_quadrants(&self, quadrants: i32) -> DisplayImage {
        match quadrants.rem_euclid(4) {
            0 => self.clone(),
            1 => self.rotated_cw(),
            2 => self.rotated_cw().rotated_cw(),
            _ => self.rotated_cw().rotated_cw().rotated_cw(),
        }
    }

    fn rotated_cw(&self) -> DisplayImage {
        let (w, h) = (self.width, self.height);
        let mut out = DisplayImage::new(h, w);
        for dy in 0..w {
            for dx in 0..h {
                // dst(dx, dy) = src(dy, h - 1 - dx)
                out.set_pixel(dx, dy, self.pixel(dy, h - 1 - dx));
            }
        }
        out
    }

    /// Nearest-neighbor scale to the given size. Never called to
    /// upscale by the streamer (negotiation clamps to physical size),
    /// but works either way.
    pub fn scaled_to(&self, width: u32, height: u32) -> DisplayImage {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let mut out = DisplayImage::new(width, height);
        for y in 0..height {
            let sy = (y as u64 * self.height as u64 / height as u64) as u32;
            for x in 0..width {
                let sx = (x as u64 * self.width as u64 / width as u64) as u32;
                out.set_pixel(x, y, self.pixel(sx.min(self.width - 1), sy.min(self.height - 1)));
            }
        }
        out
    }
}

// ── EncodedPacket ────────────────────────────────────────────────

/// One encoded payload emitted by a [`VideoEncoder`].
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
    /// Encoder presentation timestamp in microseconds, before the
    /// per-session offset is applied.
    pub presentation_timestamp_us: i64,
}

// ── Codec traits ─────────────────────────────────────────────────

/// Opaque video encoder.
///
/// Pipelined encoders may buffer frames internally; the streamer
/// calls [`flush`](Self::flush) after every [`encode`](Self::encode)
/// and numbers all drained packets in encounter order.
pub trait VideoEncoder: Send {
    /// Short ASCII codec identifier sent in the channel header.
    fn codec_name(&self) -> &str;

    /// Open/reconfigure the encoder for the given frame size.
    /// Failures here are fatal to the session.
    fn configure(&mut self, width: u32, height: u32) -> Result<(), MirrorError>;

    /// Encode one image, returning zero or more output packets.
    fn encode(
        &mut self,
        image: &DisplayImage,
        pts_us: i64,
    ) -> Result<Vec<EncodedPacket>, MirrorError>;

    /// Drain any internally buffered output.
    fn flush(&mut self) -> Result<Vec<EncodedPacket>, MirrorError>;
}

/// Opaque video decoder, the inverse seam of [`VideoEncoder`].
pub trait VideoDecoder: Send {
    fn codec_name(&self) -> &str;

    /// Decode one payload into an image of the dimensions announced
    /// in its packet header.
    fn decode(
        &mut self,
        width: u32,
        height: u32,
        payload: &[u8],
    ) -> Result<DisplayImage, MirrorError>;
}

// ── Bundled zstd codec ───────────────────────────────────────────

/// Lossless frame encoder compressing raw RGBA with zstd.
pub struct ZstdEncoder {
    level: i32,
    configured: Option<(u32, u32)>,
}

impl ZstdEncoder {
    pub fn new() -> Self {
        Self {
            level: 3,
            configured: None,
        }
    }

    pub fn with_level(level: i32) -> Self {
        Self {
            level,
            configured: None,
        }
    }
}

impl Default for ZstdEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder for ZstdEncoder {
    fn codec_name(&self) -> &str {
        "zstd"
    }

    fn configure(&mut self, width: u32, height: u32) -> Result<(), MirrorError> {
        if width == 0 || height == 0 {
            return Err(MirrorError::Encoder(format!(
                "cannot configure encoder for {width}x{height}"
            )));
        }
        self.configured = Some((width, height));
        Ok(())
    }

    fn encode(
        &mut self,
        image: &DisplayImage,
        pts_us: i64,
    ) -> Result<Vec<EncodedPacket>, MirrorError> {
        let Some((w, h)) = self.configured else {
            return Err(MirrorError::Encoder("encoder not configured".to_string()));
        };
        if image.width != w || image.height != h {
            return Err(MirrorError::Encoder(format!(
                "image size {}x{} does not match configured {w}x{h}",
                image.width, image.height
            )));
        }
        let data = zstd::encode_all(image.data.as_slice(), self.level)
            .map_err(|e| MirrorError::Encoder(format!("zstd encode failed: {e}")))?;
        Ok(vec![EncodedPacket {
            data,
            presentation_timestamp_us: pts_us,
        }])
    }

    fn flush(&mut self) -> Result<Vec<EncodedPacket>, MirrorError> {
        // This codec buffers nothing.
        Ok(Vec::new())
    }
}

/// Decoder counterpart of [`ZstdEncoder`].
pub struct ZstdDecoder;

impl ZstdDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ZstdDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoDecoder for ZstdDecoder {
    fn codec_name(&self) -> &str {
        "zstd"
    }

    fn decode(
        &mut self,
        width: u32,
        height: u32,
        payload: &[u8],
    ) -> Result<DisplayImage, MirrorError> {
        let data = zstd::decode_all(payload)
            .map_err(|e| MirrorError::Decoder(format!("zstd decode failed: {e}")))?;
        DisplayImage::from_raw(width, height, data)
    }
}

// ── Tests ────────────────────────────────────────────────────────
