//! Host-side mirroring session lifecycle.
//!
//! A [`MirroringSession`] owns one device pairing: the video and
//! control channels, the receive loops, and the state machine
//! `NotStarted → Starting → Running → (Stopped | Crashed)`. Terminal
//! states are final; reconnecting means building a fresh session over
//! fresh channels.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::ByteChannel;
use crate::error::{Disconnect, MirrorError};
use crate::protocol::ControlMessage;
use crate::streamer::{VideoFrame, VideoReceiver};
use crate::video::VideoDecoder;

/// How long the host waits for the device's codec header.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const FRAME_QUEUE_DEPTH: usize = 16;

// ── SessionState ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Starting,
    Running,
    Stopped,
    Crashed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Crashed)
    }
}

type NotificationHandler = Box<dyn Fn(ControlMessage) + Send + Sync>;
type CrashHandler = Box<dyn Fn(MirrorError) + Send + Sync>;

// ── Shared internals ─────────────────────────────────────────────

struct SessionShared {
    state: watch::Sender<SessionState>,
    video: ByteChannel,
    control: ByteChannel,
    /// Set before the channels are closed by `stop()`, so the loops
    /// can tell an orderly teardown from a peer failure.
    stop_requested: AtomicBool,
    last_frame_number: AtomicU64,
    notification_handler: StdMutex<Option<NotificationHandler>>,
    crash_handler: StdMutex<Option<CrashHandler>>,
}

impl SessionShared {
    /// Move to a new state unless already terminal. Returns whether
    /// the transition happened.
    fn transition(&self, to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == to {
                false
            } else {
                *state = to;
                true
            }
        })
    }

    /// A loop failed while the session was supposed to be running.
    /// First caller wins; the sibling loop's error is swallowed.
    async fn crash(&self, error: MirrorError) {
        if self.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        if !self.transition(SessionState::Crashed) {
            return;
        }
        warn!(%error, "mirroring session crashed");
        self.video.close().await;
        self.control.close().await;
        let handler = self.crash_handler.lock();
        if let Ok(guard) = handler {
            if let Some(callback) = guard.as_ref() {
                callback(error);
            }
        }
    }
}

// ── MirroringSession ─────────────────────────────────────────────

pub struct MirroringSession {
    shared: Arc<SessionShared>,
    state_rx: watch::Receiver<SessionState>,
    frames: Option<mpsc::Receiver<VideoFrame>>,
}

impl MirroringSession {
    /// Connect a session over two established channels.
    ///
    /// Reads and validates the device's codec header before
    /// reporting `Running`. Every failure up to that point is an
    /// initialization failure, distinct from a later crash.
    pub async fn start(
        video: ByteChannel,
        control: ByteChannel,
        decoder: Box<dyn VideoDecoder>,
    ) -> Result<MirroringSession, Disconnect> {
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let shared = Arc::new(SessionShared {
            state: state_tx,
            video: video.clone(),
            control: control.clone(),
            stop_requested: AtomicBool::new(false),
            last_frame_number: AtomicU64::new(0),
            notification_handler: StdMutex::new(None),
            crash_handler: StdMutex::new(None),
        });

        let mut receiver = VideoReceiver::new(video.clone(), decoder);
        let codec = match timeout(HANDSHAKE_TIMEOUT, receiver.read_channel_header()).await {
            Ok(Ok(codec)) => codec,
            Ok(Err(e)) => {
                shared.transition(SessionState::Crashed);
                video.close().await;
                control.close().await;
                return Err(Disconnect::InitFailure(e));
            }
            Err(_) => {
                shared.transition(SessionState::Crashed);
                video.close().await;
                control.close().await;
                return Err(Disconnect::InitFailure(MirrorError::Timeout(HANDSHAKE_TIMEOUT)));
            }
        };
        info!(codec = %codec, "mirroring session connected");
        shared.transition(SessionState::Running);

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        tokio::spawn(Self::video_loop(Arc::clone(&shared), receiver, frames_tx));
        tokio::spawn(Self::notification_loop(Arc::clone(&shared)));
        tokio::spawn(Self::channel_synchronizer(video, control));

        Ok(MirroringSession {
            shared,
            state_rx,
            frames: Some(frames_rx),
        })
    }

    /// Closing either channel closes its sibling, so the two streams
    /// fail as one unit.
    async fn channel_synchronizer(video: ByteChannel, control: ByteChannel) {
        let video_closed = video.closed_token();
        let control_closed = control.closed_token();
        tokio::select! {
            _ = video_closed.cancelled() => {}
            _ = control_closed.cancelled() => {}
        }
        video.close().await;
        control.close().await;
    }

    async fn video_loop(
        shared: Arc<SessionShared>,
        mut receiver: VideoReceiver,
        frames: mpsc::Sender<VideoFrame>,
    ) {
        loop {
            match receiver.next_frame().await {
                Ok(frame) => {
                    shared
                        .last_frame_number
                        .store(frame.frame_number, Ordering::SeqCst);
                    // A consumer that went away does not stop the
                    // stream; sequencing still gets verified.
                    let _ = frames.send(frame).await;
                }
                Err(e) => {
                    shared.crash(e).await;
                    return;
                }
            }
        }
    }

    async fn notification_loop(shared: Arc<SessionShared>) {
        loop {
            match ControlMessage::read_from(&shared.control).await {
                Ok(message) => {
                    debug!(?message, "notification received");
                    let handler = shared.notification_handler.lock();
                    if let Ok(guard) = handler {
                        if let Some(callback) = guard.as_ref() {
                            callback(message);
                        }
                    }
                }
                Err(e) => {
                    shared.crash(e).await;
                    return;
                }
            }
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Observe state transitions, for waiting on `Running`,
    /// `Stopped` or `Crashed`.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// The decoded frame stream. Yields `None` once taken.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<VideoFrame>> {
        self.frames.take()
    }

    /// Highest frame number received so far.
    pub fn last_frame_number(&self) -> u64 {
        self.shared.last_frame_number.load(Ordering::SeqCst)
    }

    /// Send one control request to the device.
    pub async fn send_control(&self, message: &ControlMessage) -> Result<(), MirrorError> {
        if self.state() != SessionState::Running {
            return Err(MirrorError::InvalidState("session is not running"));
        }
        message.write_to(&self.shared.control).await
    }

    /// Register the receiver of device notifications. Replaces any
    /// previous handler.
    pub fn on_notification<F>(&self, callback: F)
    where
        F: Fn(ControlMessage) + Send + Sync + 'static,
    {
        if let Ok(mut guard) = self.shared.notification_handler.lock() {
            *guard = Some(Box::new(callback));
        }
    }

    /// Register the crash callback, invoked at most once, when an
    /// unrequested disconnect moves the session to `Crashed`.
    pub fn on_crash<F>(&self, callback: F)
    where
        F: Fn(MirrorError) + Send + Sync + 'static,
    {
        if let Ok(mut guard) = self.shared.crash_handler.lock() {
            *guard = Some(Box::new(callback));
        }
    }

    /// Orderly shutdown: close both channels, cancel the loops, move
    /// to `Stopped`. A no-op after a crash.
    pub async fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.video.close().await;
        self.shared.control.close().await;
        if self.shared.transition(SessionState::Stopped) {
            info!("mirroring session stopped");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
