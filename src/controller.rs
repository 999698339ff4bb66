//! Device-side control relay.
//!
//! [`DeviceController`] reads control messages off the control
//! channel one at a time and hands each to a [`ControlDelegate`] for
//! execution. Notifications travel the other way through a cloneable
//! [`NotificationSender`]; sends race naturally with session shutdown,
//! so a closed channel is tolerated there.

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::channel::ByteChannel;
use crate::error::MirrorError;
use crate::protocol::ControlMessage;

/// Receiver of decoded host requests, implemented by the agent.
///
/// Messages are dispatched strictly in wire order; the next read does
/// not start until the handler returns.
#[async_trait]
pub trait ControlDelegate: Send {
    async fn handle_message(&mut self, message: ControlMessage) -> Result<(), MirrorError>;
}

// ── DeviceController ─────────────────────────────────────────────

/// The control-channel read loop.
pub struct DeviceController<D> {
    channel: ByteChannel,
    delegate: D,
}

impl<D: ControlDelegate> DeviceController<D> {
    pub fn new(channel: ByteChannel, delegate: D) -> Self {
        Self { channel, delegate }
    }

    /// A handle for sending device-to-host notifications over this
    /// controller's channel.
    pub fn notifier(&self) -> NotificationSender {
        NotificationSender {
            channel: self.channel.clone(),
        }
    }

    /// Read and dispatch messages until the host disconnects.
    ///
    /// The host closing the channel ends the loop cleanly. Anything
    /// else, a malformed frame or a delegate failure, is fatal and
    /// propagated to the caller.
    pub async fn run(mut self) -> Result<(), MirrorError> {
        loop {
            let message = match ControlMessage::read_from(&self.channel).await {
                Ok(message) => message,
                Err(e) if e.is_lost_connection() => {
                    debug!("control channel closed by peer");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            trace!(?message, "control message received");
            self.delegate.handle_message(message).await?;
        }
    }
}

// ── NotificationSender ───────────────────────────────────────────

/// Device-to-host notification writer.
///
/// Each message is framed into a single channel write, so concurrent
/// senders cannot interleave frames.
#[derive(Clone)]
pub struct NotificationSender {
    channel: ByteChannel,
}

impl NotificationSender {
    pub fn new(channel: ByteChannel) -> Self {
        Self { channel }
    }

    /// Send one notification. A channel already closed by session
    /// teardown is not an error; the notification is simply dropped.
    pub async fn send(&self, message: &ControlMessage) -> Result<(), MirrorError> {
        match message.write_to(&self.channel).await {
            Err(e) if e.is_lost_connection() => {
                debug!("notification dropped, control channel closed");
                Ok(())
            }
            other => other,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{KeyAction, MotionAction, Pointer};
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn channel_pair() -> (ByteChannel, ByteChannel) {
        let (a, b) = duplex(64 * 1024);
        (ByteChannel::from_stream(a), ByteChannel::from_stream(b))
    }

    struct Recording {
        seen: mpsc::UnboundedSender<ControlMessage>,
    }

    #[async_trait]
    impl ControlDelegate for Recording {
        async fn handle_message(&mut self, message: ControlMessage) -> Result<(), MirrorError> {
            self.seen.send(message).map_err(|_| MirrorError::ChannelClosed)
        }
    }

    #[tokio::test]
    async fn messages_are_dispatched_in_order() {
        let (host, device) = channel_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = DeviceController::new(device, Recording { seen: tx });
        let loop_handle = tokio::spawn(controller.run());

        let sent = [
            ControlMessage::SetDeviceOrientation { orientation: 1 },
            ControlMessage::KeyEvent {
                action: KeyAction::DownAndUp,
                key_code: 66,
                meta_state: 0,
            },
            ControlMessage::MotionEvent {
                pointers: vec![Pointer {
                    x: 10,
                    y: 20,
                    pointer_id: 0,
                }],
                action: MotionAction::Down,
                meta_state: 0,
            },
        ];
        for message in &sent {
            message.write_to(&host).await.unwrap();
        }

        for expected in &sent {
            let got = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            assert_eq!(&got, expected);
        }

        host.close().await;
        let result = timeout(Duration::from_secs(5), loop_handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn peer_disconnect_ends_loop_cleanly() {
        let (host, device) = channel_pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        let controller = DeviceController::new(device, Recording { seen: tx });

        host.close().await;
        drop(host);

        let result = timeout(Duration::from_secs(5), controller.run()).await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn malformed_frame_is_fatal() {
        let (host, device) = channel_pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        let controller = DeviceController::new(device, Recording { seen: tx });

        // Known tag with a truncated 2-byte payload; orientation
        // needs 4 bytes.
        host.write(&[1u8, 2, 0, 0, 0, 0xAB, 0xCD]).await.unwrap();

        let result = timeout(Duration::from_secs(5), controller.run()).await.unwrap();
        assert!(matches!(result, Err(MirrorError::MalformedMessage(_))));
    }

    #[tokio::test]
    async fn unrecognized_message_reaches_delegate() {
        let (host, device) = channel_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = DeviceController::new(device, Recording { seen: tx });
        let loop_handle = tokio::spawn(controller.run());

        host.write(&[200u8, 3, 0, 0, 0, 1, 2, 3]).await.unwrap();
        ControlMessage::StopClipboardSync.write_to(&host).await.unwrap();

        let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, ControlMessage::Unrecognized { tag: 200 });
        // The stream stays aligned after the unknown payload.
        let second = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(second, ControlMessage::StopClipboardSync);

        host.close().await;
        timeout(Duration::from_secs(5), loop_handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn notification_after_host_close_is_dropped() {
        let (host, device) = channel_pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        let controller = DeviceController::new(device.clone(), Recording { seen: tx });
        let notifier = controller.notifier();

        host.close().await;
        drop(host);
        device.close().await;

        let result = notifier
            .send(&ControlMessage::DeviceStateChanged { state_id: 2 })
            .await;
        assert!(result.is_ok());
    }
}
