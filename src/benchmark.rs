//! Input-latency benchmarking harness.
//!
//! Drives the coordinator's touch path at a fixed rate against a
//! cooperating device app that marks its touchable area in pixel
//! data and echoes each touch back into a subsequent frame. A
//! touchable pixel has a saturated green channel and no red; an
//! acknowledged touch turns the pixel's red channel on, with the
//! device's own latency estimate in microseconds packed into the
//! green (high byte) and blue (low byte) channels.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::{Instant as TokioInstant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{ClientCoordinator, Viewport};
use crate::error::MirrorError;
use crate::session::MirroringSession;
use crate::streamer::{Size, VideoFrame};
use crate::video::DisplayImage;

// ── Pixel encoding ───────────────────────────────────────────────

/// Whether a pixel advertises itself as touchable.
pub fn is_touchable(rgba: [u8; 4]) -> bool {
    rgba[1] == 0xFF && rgba[0] == 0
}

/// The device latency hint carried by an acknowledged pixel, if the
/// pixel is an acknowledgement at all.
pub fn decode_ack(rgba: [u8; 4]) -> Option<u64> {
    if rgba[0] != 0xFF {
        return None;
    }
    Some(((rgba[1] as u64) << 8) | rgba[2] as u64)
}

/// Paint an acknowledgement for a touch, device side.
pub fn encode_ack(latency_hint_us: u64) -> [u8; 4] {
    let clamped = latency_hint_us.min(0xFFFF);
    [0xFF, (clamped >> 8) as u8, (clamped & 0xFF) as u8, 0xFF]
}

/// Touchable pixels of a frame in raster order, keeping only every
/// `step`-th candidate.
pub fn touchable_pixels(image: &DisplayImage, step: usize) -> Vec<(u32, u32)> {
    let step = step.max(1);
    let mut out = Vec::new();
    let mut index = 0usize;
    for y in 0..image.height {
        for x in 0..image.width {
            if is_touchable(image.pixel(x, y)) {
                if index % step == 0 {
                    out.push((x, y));
                }
                index += 1;
            }
        }
    }
    out
}

// ── Percentile ───────────────────────────────────────────────────

/// Percentile over `samples` with linear interpolation: the lowest
/// sample is percentile 0 and the highest percentile 100.
pub fn percentile(samples: &[u64], p: f64) -> Option<f64> {
    if samples.is_empty() || !(0.0..=100.0).contains(&p) {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    if sorted.len() == 1 {
        return Some(sorted[0] as f64);
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    let fraction = rank - low as f64;
    Some(sorted[low] as f64 + (sorted[high] as f64 - sorted[low] as f64) * fraction)
}

// ── Configuration and results ────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    /// Stop after this many touches.
    pub max_touches: usize,
    /// Touch only every `step`-th touchable pixel.
    pub step: usize,
    /// Interval between consecutive touches.
    pub touch_interval: Duration,
    /// How long to wait for a frame advertising a touchable area.
    pub discovery_timeout: Duration,
    /// How long to wait for each touch's acknowledgement.
    pub ack_timeout: Duration,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            max_touches: 1000,
            step: 1,
            touch_interval: Duration::from_millis(10),
            discovery_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
pub struct BenchmarkReport {
    /// Touches issued.
    pub touches: usize,
    /// Touches whose acknowledgement never arrived in time.
    pub missed: usize,
    /// Observed round-trip latency per acknowledged touch, µs.
    pub latencies_us: Vec<u64>,
    /// The device's own latency estimates, µs.
    pub device_hints_us: Vec<u64>,
}

impl BenchmarkReport {
    pub fn latency_percentile(&self, p: f64) -> Option<f64> {
        percentile(&self.latencies_us, p)
    }
}

#[derive(Debug)]
pub enum BenchmarkOutcome {
    /// Ran to `max_touches` or exhausted the touchable area.
    Completed(BenchmarkReport),
    /// Caller-initiated stop; the report covers what ran.
    Stopped(BenchmarkReport),
    /// No frame advertised a touchable area within the discovery
    /// window. Non-fatal.
    NoTouchableArea,
}

// ── Harness ──────────────────────────────────────────────────────

/// A touch whose acknowledgement has not arrived yet.
struct PendingTouch {
    x: u32,
    y: u32,
    issued: Instant,
    deadline: TokioInstant,
}

/// Run the benchmark against a running session.
///
/// `frames` is the session's frame stream; `device_display_size` the
/// unrotated native display size. Touches go out on the
/// `touch_interval` cadence regardless of when acknowledgements come
/// back; each outstanding touch is matched against incoming frames
/// until its own `ack_timeout` expires. Cancelling `stop` ends the
/// run early with [`BenchmarkOutcome::Stopped`]. The frame stream
/// closing (session crash) is an error.
pub async fn run_benchmark(
    session: &MirroringSession,
    frames: &mut mpsc::Receiver<VideoFrame>,
    device_display_size: Size,
    config: &BenchmarkConfig,
    stop: CancellationToken,
) -> Result<BenchmarkOutcome, MirrorError> {
    let mut coordinator = ClientCoordinator::new(device_display_size);

    // Discovery: wait for a frame that advertises a touchable area.
    let discovery = timeout(config.discovery_timeout, async {
        loop {
            let frame = frames.recv().await.ok_or(MirrorError::ChannelClosed)?;
            coordinator.frame_rendered(&frame);
            if touchable_pixels(&frame.image, 1).is_empty() {
                continue;
            }
            return Ok::<VideoFrame, MirrorError>(frame);
        }
    })
    .await;
    let reference = match discovery {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            warn!("no touchable area found within the discovery window");
            return Ok(BenchmarkOutcome::NoTouchableArea);
        }
    };

    // Frame pixels map straight onto view coordinates once the
    // viewport scale matches the encoded size.
    let rotated = device_display_size.rotated_by_quadrants(reference.orientation);
    coordinator.set_viewport(Viewport {
        offset_x: 0.0,
        offset_y: 0.0,
        scale: reference.display_size.width as f64 / rotated.width as f64,
    });

    let candidates = touchable_pixels(&reference.image, config.step);
    info!(
        candidates = candidates.len(),
        step = config.step,
        "touchable area discovered"
    );

    let mut report = BenchmarkReport::default();
    let mut candidates = candidates.into_iter();
    let mut pending: Vec<PendingTouch> = Vec::new();
    let mut next_touch = TokioInstant::now();
    let mut issuing = true;

    while issuing || !pending.is_empty() {
        let expiry = pending
            .iter()
            .map(|touch| touch.deadline)
            .min()
            .unwrap_or_else(TokioInstant::now);

        tokio::select! {
            _ = stop.cancelled() => return Ok(BenchmarkOutcome::Stopped(report)),
            _ = sleep_until(next_touch), if issuing => {
                next_touch += config.touch_interval;
                match candidates.next() {
                    Some((x, y)) if report.touches < config.max_touches => {
                        let Some((id, press)) = coordinator.begin_touch(x as f64, y as f64) else {
                            debug!(x, y, "candidate fell outside the display, skipped");
                            continue;
                        };
                        let issued = Instant::now();
                        session.send_control(&press).await?;
                        if let Some(release) = coordinator.end_touch(id) {
                            session.send_control(&release).await?;
                        }
                        report.touches += 1;
                        pending.push(PendingTouch {
                            x,
                            y,
                            issued,
                            deadline: TokioInstant::now() + config.ack_timeout,
                        });
                    }
                    _ => issuing = false,
                }
            }
            frame = frames.recv(), if !pending.is_empty() => {
                let frame = frame.ok_or(MirrorError::ChannelClosed)?;
                coordinator.frame_rendered(&frame);
                pending.retain(|touch| {
                    if touch.x < frame.image.width && touch.y < frame.image.height {
                        if let Some(hint) = decode_ack(frame.image.pixel(touch.x, touch.y)) {
                            report.latencies_us.push(touch.issued.elapsed().as_micros() as u64);
                            report.device_hints_us.push(hint);
                            return false;
                        }
                    }
                    true
                });
            }
            _ = sleep_until(expiry), if !pending.is_empty() => {
                let now = TokioInstant::now();
                pending.retain(|touch| {
                    if touch.deadline <= now {
                        report.missed += 1;
                        false
                    } else {
                        true
                    }
                });
            }
        }
    }

    info!(
        touches = report.touches,
        missed = report.missed,
        "benchmark finished"
    );
    Ok(BenchmarkOutcome::Completed(report))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_endpoints_are_min_and_max() {
        let samples = [40, 10, 30, 20];
        assert_eq!(percentile(&samples, 0.0), Some(10.0));
        assert_eq!(percentile(&samples, 100.0), Some(40.0));
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let samples = [0, 10, 20, 30];
        assert_eq!(percentile(&samples, 50.0), Some(15.0));
        assert_eq!(percentile(&samples, 25.0), Some(7.5));
    }

    #[test]
    fn percentile_rejects_out_of_range() {
        assert_eq!(percentile(&[1, 2], -1.0), None);
        assert_eq!(percentile(&[1, 2], 100.5), None);
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn percentile_single_sample_is_constant() {
        assert_eq!(percentile(&[7], 0.0), Some(7.0));
        assert_eq!(percentile(&[7], 63.0), Some(7.0));
        assert_eq!(percentile(&[7], 100.0), Some(7.0));
    }

    #[test]
    fn touchable_scan_is_raster_ordered_and_decimated() {
        let mut image = DisplayImage::new(4, 2);
        // Touchable pixels at (1,0), (3,0), (0,1), (2,1).
        for (x, y) in [(1, 0), (3, 0), (0, 1), (2, 1)] {
            image.set_pixel(x, y, [0, 0xFF, 0, 0xFF]);
        }
        // A red-tinted green pixel is not touchable.
        image.set_pixel(2, 0, [10, 0xFF, 0, 0xFF]);

        assert_eq!(
            touchable_pixels(&image, 1),
            vec![(1, 0), (3, 0), (0, 1), (2, 1)]
        );
        assert_eq!(touchable_pixels(&image, 2), vec![(1, 0), (0, 1)]);
        assert_eq!(touchable_pixels(&image, 3), vec![(1, 0), (2, 1)]);
    }

    #[test]
    fn ack_encoding_round_trips() {
        assert_eq!(decode_ack(encode_ack(0)), Some(0));
        assert_eq!(decode_ack(encode_ack(0x1234)), Some(0x1234));
        // Hints saturate at 16 bits.
        assert_eq!(decode_ack(encode_ack(1 << 20)), Some(0xFFFF));
        // A touchable pixel is not an acknowledgement.
        assert_eq!(decode_ack([0, 0xFF, 0, 0xFF]), None);
    }
}
