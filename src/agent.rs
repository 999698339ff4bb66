//! Device-side agent: the peer a host session talks to.
//!
//! Composes a [`DisplayStreamer`] encode loop and a
//! [`DeviceController`] dispatch loop over one shared display state.
//! Orientation and resolution are mutated only from the controller's
//! dispatch and read as one snapshot per encode cycle; the clipboard
//! value and sync flag are the only state touched from more than one
//! task.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ByteChannel;
use crate::controller::{ControlDelegate, DeviceController, NotificationSender};
use crate::error::MirrorError;
use crate::protocol::{ControlMessage, PHYSICAL_DEVICE_STATE};
use crate::streamer::{DisplaySettings, DisplayStreamer, Size};
use crate::video::{DisplayImage, VideoEncoder};

// ── Configuration ────────────────────────────────────────────────

/// A folding pose the device can assume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub display_size: Size,
    pub initial_orientation: i32,
    /// Supported folding poses; empty for a non-foldable device.
    pub device_states: Vec<DeviceState>,
    /// The pose assumed at startup and on a physical-state request.
    pub base_device_state: i32,
}

impl AgentConfig {
    pub fn new(display_size: Size) -> Self {
        Self {
            display_size,
            initial_orientation: 0,
            device_states: Vec::new(),
            base_device_state: 0,
        }
    }
}

/// How an agent's run came to an end.
#[derive(Debug)]
pub enum AgentExit {
    /// Orderly shutdown requested on the device.
    Stopped,
    /// One of the agent's loops failed.
    Crashed(MirrorError),
}

// ── Shared state ─────────────────────────────────────────────────

struct ClipboardState {
    text: String,
    max_sync_length: usize,
}

struct AgentShared {
    settings: watch::Sender<DisplaySettings>,
    display: Mutex<DisplayImage>,
    render_trigger: mpsc::Sender<()>,
    clipboard: Mutex<ClipboardState>,
    clipboard_sync: AtomicBool,
    device_state: AtomicI32,
    config: AgentConfig,
    input_events: mpsc::UnboundedSender<ControlMessage>,
    shutdown: CancellationToken,
}

impl AgentShared {
    /// Coalescing render request: a trigger while one is already
    /// queued is a no-op, the next cycle covers both.
    fn request_render(&self) {
        let _ = self.render_trigger.try_send(());
    }
}

// ── Control dispatch ─────────────────────────────────────────────

struct AgentDelegate {
    shared: Arc<AgentShared>,
    notifier: NotificationSender,
}

#[async_trait]
impl ControlDelegate for AgentDelegate {
    async fn handle_message(&mut self, message: ControlMessage) -> Result<(), MirrorError> {
        let shared = &self.shared;
        match message {
            ControlMessage::SetDeviceOrientation { orientation } => {
                shared
                    .settings
                    .send_modify(|s| s.orientation = orientation.rem_euclid(4));
                shared.request_render();
            }
            ControlMessage::SetMaxVideoResolution { width, height } => {
                if width <= 0 || height <= 0 {
                    return Err(MirrorError::MalformedMessage("non-positive resolution cap"));
                }
                shared
                    .settings
                    .send_modify(|s| s.max_resolution = Size::new(width as u32, height as u32));
                shared.request_render();
            }
            ControlMessage::StartClipboardSync { max_length, text } => {
                let mut clipboard = shared.clipboard.lock().await;
                clipboard.text = text;
                clipboard.max_sync_length = max_length.max(0) as usize;
                shared.clipboard_sync.store(true, Ordering::SeqCst);
            }
            ControlMessage::StopClipboardSync => {
                shared.clipboard_sync.store(false, Ordering::SeqCst);
            }
            ControlMessage::ClipboardChanged { text } => {
                // Host pushed its clipboard; no echo back.
                shared.clipboard.lock().await.text = text;
            }
            ControlMessage::RequestDeviceState { state_id } => {
                self.apply_device_state(state_id).await?;
            }
            message @ (ControlMessage::KeyEvent { .. }
            | ControlMessage::TextInput { .. }
            | ControlMessage::MotionEvent { .. }) => {
                // Input injection is the embedder's business.
                let _ = shared.input_events.send(message);
            }
            ControlMessage::DeviceStateChanged { .. } => {
                return Err(MirrorError::ProtocolViolation(
                    "device-state notification received by device",
                ));
            }
            ControlMessage::Unrecognized { tag } => {
                debug!(tag, "ignoring unrecognized control message");
            }
        }
        Ok(())
    }
}

impl AgentDelegate {
    async fn apply_device_state(&mut self, state_id: i32) -> Result<(), MirrorError> {
        let shared = &self.shared;
        let target = if state_id == PHYSICAL_DEVICE_STATE {
            shared.config.base_device_state
        } else {
            state_id
        };
        let known = shared.config.device_states.iter().any(|s| s.id == target);
        if !known {
            warn!(state_id, "request for unsupported device state ignored");
            return Ok(());
        }
        if shared.device_state.swap(target, Ordering::SeqCst) != target {
            self.notifier
                .send(&ControlMessage::DeviceStateChanged { state_id: target })
                .await?;
        }
        Ok(())
    }
}

// ── DeviceAgent ──────────────────────────────────────────────────

/// A running device agent. Dropping the handle does not stop the
/// loops; call [`stop`](Self::stop) or [`crash`](Self::crash).
pub struct DeviceAgent {
    shared: Arc<AgentShared>,
    video: ByteChannel,
    control: ByteChannel,
    streamer_task: JoinHandle<Result<(), MirrorError>>,
    controller_task: JoinHandle<Result<(), MirrorError>>,
    input_rx: Option<mpsc::UnboundedReceiver<ControlMessage>>,
}

impl DeviceAgent {
    /// Send the codec handshake and start the streaming and control
    /// loops. The first frame is rendered immediately.
    pub async fn start(
        video: ByteChannel,
        control: ByteChannel,
        encoder: Box<dyn VideoEncoder>,
        config: AgentConfig,
    ) -> Result<DeviceAgent, MirrorError> {
        let (settings_tx, settings_rx) = watch::channel(DisplaySettings {
            orientation: config.initial_orientation.rem_euclid(4),
            max_resolution: Size::new(u32::MAX, u32::MAX),
        });
        let (render_tx, render_rx) = mpsc::channel(1);
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(AgentShared {
            settings: settings_tx,
            display: Mutex::new(DisplayImage::new(
                config.display_size.width,
                config.display_size.height,
            )),
            render_trigger: render_tx,
            clipboard: Mutex::new(ClipboardState {
                text: String::new(),
                max_sync_length: 0,
            }),
            clipboard_sync: AtomicBool::new(false),
            device_state: AtomicI32::new(config.base_device_state),
            config: config.clone(),
            input_events: input_tx,
            shutdown: CancellationToken::new(),
        });

        let streamer = DisplayStreamer::new(
            video.clone(),
            encoder,
            config.display_size,
            settings_rx.clone(),
        );
        streamer.send_channel_header().await?;

        let controller = DeviceController::new(
            control.clone(),
            AgentDelegate {
                shared: Arc::clone(&shared),
                notifier: NotificationSender::new(control.clone()),
            },
        );

        shared.request_render();
        let streamer_task = tokio::spawn(Self::teardown_on_error(
            Arc::clone(&shared),
            video.clone(),
            control.clone(),
            Self::streaming_loop(Arc::clone(&shared), streamer, settings_rx, render_rx),
        ));
        let controller_task = tokio::spawn(Self::teardown_on_error(
            Arc::clone(&shared),
            video.clone(),
            control.clone(),
            controller.run(),
        ));

        info!(display = %config.display_size, "device agent started");
        Ok(DeviceAgent {
            shared,
            video,
            control,
            streamer_task,
            controller_task,
            input_rx: Some(input_rx),
        })
    }

    /// A fatal loop error stops the sibling loop and closes both
    /// channels, so the host observes the failure instead of an idle
    /// stream that never ends.
    async fn teardown_on_error(
        shared: Arc<AgentShared>,
        video: ByteChannel,
        control: ByteChannel,
        task: impl Future<Output = Result<(), MirrorError>>,
    ) -> Result<(), MirrorError> {
        let result = task.await;
        if let Err(error) = &result {
            warn!(%error, "agent loop failed, tearing the pairing down");
            shared.shutdown.cancel();
            video.close().await;
            control.close().await;
        }
        result
    }

    async fn streaming_loop(
        shared: Arc<AgentShared>,
        mut streamer: DisplayStreamer,
        mut settings_rx: watch::Receiver<DisplaySettings>,
        mut render_rx: mpsc::Receiver<()>,
    ) -> Result<(), MirrorError> {
        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => return Ok(()),
                changed = settings_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                trigger = render_rx.recv() => {
                    if trigger.is_none() {
                        return Ok(());
                    }
                }
            }
            let contents = shared.display.lock().await.clone();
            streamer.render(&contents).await?;
        }
    }

    /// Replace display contents and schedule a re-encode.
    pub async fn update_display<F>(&self, mutate: F)
    where
        F: FnOnce(&mut DisplayImage),
    {
        mutate(&mut *self.shared.display.lock().await);
        self.shared.request_render();
    }

    /// A cheap cloneable handle for updating display contents from
    /// other tasks, an on-device app for instance.
    pub fn display_handle(&self) -> DisplayHandle {
        DisplayHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// A device-side clipboard change. Emits `ClipboardChanged` to
    /// the host only when sync is active, the value differs from the
    /// current one, and its length is within the negotiated maximum.
    pub async fn set_device_clipboard(&self, text: &str) -> Result<(), MirrorError> {
        let notify = {
            let mut clipboard = self.shared.clipboard.lock().await;
            if clipboard.text == text {
                return Ok(());
            }
            clipboard.text = text.to_owned();
            self.shared.clipboard_sync.load(Ordering::SeqCst)
                && text.len() <= clipboard.max_sync_length
        };
        if notify {
            NotificationSender::new(self.control.clone())
                .send(&ControlMessage::ClipboardChanged {
                    text: text.to_owned(),
                })
                .await?;
        }
        Ok(())
    }

    /// The stream of host input events (key, text, motion). Yields
    /// `None` once taken.
    pub fn take_input_events(&mut self) -> Option<mpsc::UnboundedReceiver<ControlMessage>> {
        self.input_rx.take()
    }

    pub fn current_device_state(&self) -> i32 {
        self.shared.device_state.load(Ordering::SeqCst)
    }

    /// Orderly shutdown: cancel both loops, close both channels, and
    /// report how the run ended. Loop failures that raced the
    /// shutdown turn the exit into [`AgentExit::Crashed`].
    pub async fn stop(self) -> AgentExit {
        self.shared.shutdown.cancel();
        self.video.close().await;
        self.control.close().await;

        for task in [self.streamer_task, self.controller_task] {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return AgentExit::Crashed(e),
                Err(join_error) => {
                    return AgentExit::Crashed(MirrorError::Io(std::io::Error::other(join_error)));
                }
            }
        }
        info!("device agent stopped");
        AgentExit::Stopped
    }

    /// Simulated abnormal termination: both loops are torn down
    /// abruptly without draining.
    pub async fn crash(self) {
        self.streamer_task.abort();
        self.controller_task.abort();
        self.video.close().await;
        self.control.close().await;
        warn!("device agent terminated abnormally");
    }
}

/// See [`DeviceAgent::display_handle`].
#[derive(Clone)]
pub struct DisplayHandle {
    shared: Arc<AgentShared>,
}

impl DisplayHandle {
    pub async fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut DisplayImage),
    {
        mutate(&mut *self.shared.display.lock().await);
        self.shared.request_render();
    }
}

// ── Tests ────────────────────────────────────────────────────────
