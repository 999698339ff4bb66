//! Control channel wire format.
//!
//! Control messages form a closed tagged union. Every message is
//! framed as
//!
//! ```text
//! tag:          u8   (1)
//! payload_len:  u32  (4, little-endian)
//! payload:      [u8] (payload_len bytes)
//! ```
//!
//! so a reader can dispatch on the tag without external schema
//! knowledge, and can skip a message whose tag it does not recognize.
//! Strings inside payloads are `u32`-length-prefixed UTF-8; integers
//! are `i32` little-endian.

use crate::channel::ByteChannel;
use crate::error::MirrorError;

/// Upper bound on a control message payload. Clipboard text is the
/// only unbounded field and sessions cap it well below this.
pub const MAX_CONTROL_PAYLOAD: usize = 256 * 1024;

// ── Message tags ─────────────────────────────────────────────────

const TAG_SET_DEVICE_ORIENTATION: u8 = 1;
const TAG_SET_MAX_VIDEO_RESOLUTION: u8 = 2;
const TAG_START_CLIPBOARD_SYNC: u8 = 3;
const TAG_STOP_CLIPBOARD_SYNC: u8 = 4;
const TAG_CLIPBOARD_CHANGED: u8 = 5;
const TAG_KEY_EVENT: u8 = 6;
const TAG_TEXT_INPUT: u8 = 7;
const TAG_MOTION_EVENT: u8 = 8;
const TAG_REQUEST_DEVICE_STATE: u8 = 9;
const TAG_DEVICE_STATE_CHANGED: u8 = 10;

// ── Enumerations ─────────────────────────────────────────────────

/// Keyboard key transition.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Down = 0,
    Up = 1,
    /// A press and release delivered as one event.
    DownAndUp = 2,
}

impl TryFrom<i32> for KeyAction {
    type Error = MirrorError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(KeyAction::Down),
            1 => Ok(KeyAction::Up),
            2 => Ok(KeyAction::DownAndUp),
            _ => Err(MirrorError::MalformedMessage("unrecognized key action")),
        }
    }
}

/// Touch contact transition.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionAction {
    Down = 0,
    Up = 1,
    Move = 2,
    Cancel = 3,
    /// A non-primary pointer went down while others are held.
    PointerDown = 5,
    /// A non-primary pointer went up while others remain held.
    PointerUp = 6,
}

impl TryFrom<i32> for MotionAction {
    type Error = MirrorError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MotionAction::Down),
            1 => Ok(MotionAction::Up),
            2 => Ok(MotionAction::Move),
            3 => Ok(MotionAction::Cancel),
            5 => Ok(MotionAction::PointerDown),
            6 => Ok(MotionAction::PointerUp),
            _ => Err(MirrorError::MalformedMessage("unrecognized motion action")),
        }
    }
}

/// One touch contact in device-native coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pointer {
    pub x: i32,
    pub y: i32,
    /// Stable for the duration of a press-move-release sequence.
    pub pointer_id: i32,
}

// ── ControlMessage ───────────────────────────────────────────────

/// All control messages understood by the mirroring protocol.
///
/// Requests flow host → device; notifications flow device → host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Rotate the device display to the given quarter-turn orientation.
    SetDeviceOrientation { orientation: i32 },
    /// Cap the encoded video resolution.
    SetMaxVideoResolution { width: i32, height: i32 },
    /// Set the device clipboard and subscribe to its changes.
    StartClipboardSync { max_length: i32, text: String },
    /// Unsubscribe from device clipboard changes.
    StopClipboardSync,
    /// The clipboard changed on the sending side.
    ClipboardChanged { text: String },
    /// A key was pressed or released.
    KeyEvent {
        action: KeyAction,
        key_code: i32,
        meta_state: i32,
    },
    /// Characters typed on a keyboard.
    TextInput { text: String },
    /// One or more touch contacts changed.
    MotionEvent {
        pointers: Vec<Pointer>,
        action: MotionAction,
        meta_state: i32,
    },
    /// Request a device state (folding pose) change.
    RequestDeviceState { state_id: i32 },
    /// The device state actually changed.
    DeviceStateChanged { state_id: i32 },
    /// A message with a tag this build does not know. The payload was
    /// consumed from the wire, so subsequent messages stay aligned.
    Unrecognized { tag: u8 },
}

/// Sentinel state id meaning "return to the physical device state".
pub const PHYSICAL_DEVICE_STATE: i32 = -1;

impl ControlMessage {
    /// Serialize to a complete wire frame (tag, length, payload).
    pub fn encode(&self) -> Result<Vec<u8>, MirrorError> {
        let mut payload = Vec::new();
        let tag = match self {
            ControlMessage::SetDeviceOrientation { orientation } => {
                put_i32(&mut payload, *orientation);
                TAG_SET_DEVICE_ORIENTATION
            }
            ControlMessage::SetMaxVideoResolution { width, height } => {
                put_i32(&mut payload, *width);
                put_i32(&mut payload, *height);
                TAG_SET_MAX_VIDEO_RESOLUTION
            }
            ControlMessage::StartClipboardSync { max_length, text } => {
                put_i32(&mut payload, *max_length);
                put_string(&mut payload, text);
                TAG_START_CLIPBOARD_SYNC
            }
            ControlMessage::StopClipboardSync => TAG_STOP_CLIPBOARD_SYNC,
            ControlMessage::ClipboardChanged { text } => {
                put_string(&mut payload, text);
                TAG_CLIPBOARD_CHANGED
            }
            ControlMessage::KeyEvent {
                action,
                key_code,
                meta_state,
            } => {
                put_i32(&mut payload, *action as i32);
                put_i32(&mut payload, *key_code);
                put_i32(&mut payload, *meta_state);
                TAG_KEY_EVENT
            }
            ControlMessage::TextInput { text } => {
                put_string(&mut payload, text);
                TAG_TEXT_INPUT
            }
            ControlMessage::MotionEvent {
                pointers,
                action,
                meta_state,
            } => {
                put_i32(&mut payload, pointers.len() as i32);
                for p in pointers {
                    put_i32(&mut payload, p.x);
                    put_i32(&mut payload, p.y);
                    put_i32(&mut payload, p.pointer_id);
                }
                put_i32(&mut payload, *action as i32);
                put_i32(&mut payload, *meta_state);
                TAG_MOTION_EVENT
            }
            // Offset by 1 so the PHYSICAL_DEVICE_STATE sentinel (-1)
            // encodes as 0.
            ControlMessage::RequestDeviceState { state_id } => {
                put_i32(&mut payload, *state_id + 1);
                TAG_REQUEST_DEVICE_STATE
            }
            ControlMessage::DeviceStateChanged { state_id } => {
                put_i32(&mut payload, *state_id + 1);
                TAG_DEVICE_STATE_CHANGED
            }
            ControlMessage::Unrecognized { .. } => {
                return Err(MirrorError::ProtocolViolation(
                    "cannot encode an unrecognized control message",
                ));
            }
        };

        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.push(tag);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Deserialize from a tag and its payload bytes.
    ///
    /// An unknown tag yields [`MirrorError::UnknownMessageType`]; the
    /// channel-level reader downgrades that to
    /// [`ControlMessage::Unrecognized`] since the payload has already
    /// been consumed.
    pub fn decode(tag: u8, payload: &[u8]) -> Result<Self, MirrorError> {
        let mut r = PayloadReader::new(payload);
        let message = match tag {
            TAG_SET_DEVICE_ORIENTATION => ControlMessage::SetDeviceOrientation {
                orientation: r.get_i32()?,
            },
            TAG_SET_MAX_VIDEO_RESOLUTION => ControlMessage::SetMaxVideoResolution {
                width: r.get_i32()?,
                height: r.get_i32()?,
            },
            TAG_START_CLIPBOARD_SYNC => ControlMessage::StartClipboardSync {
                max_length: r.get_i32()?,
                text: r.get_string()?,
            },
            TAG_STOP_CLIPBOARD_SYNC => ControlMessage::StopClipboardSync,
            TAG_CLIPBOARD_CHANGED => ControlMessage::ClipboardChanged {
                text: r.get_string()?,
            },
            TAG_KEY_EVENT => ControlMessage::KeyEvent {
                action: KeyAction::try_from(r.get_i32()?)?,
                key_code: r.get_i32()?,
                meta_state: r.get_i32()?,
            },
            TAG_TEXT_INPUT => ControlMessage::TextInput {
                text: r.get_string()?,
            },
            TAG_MOTION_EVENT => {
                let count = r.get_i32()?;
                if !(0..=64).contains(&count) {
                    return Err(MirrorError::MalformedMessage("implausible pointer count"));
                }
                let mut pointers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    pointers.push(Pointer {
                        x: r.get_i32()?,
                        y: r.get_i32()?,
                        pointer_id: r.get_i32()?,
                    });
                }
                ControlMessage::MotionEvent {
                    pointers,
                    action: MotionAction::try_from(r.get_i32()?)?,
                    meta_state: r.get_i32()?,
                }
            }
            TAG_REQUEST_DEVICE_STATE => ControlMessage::RequestDeviceState {
                state_id: r.get_i32()? - 1,
            },
            TAG_DEVICE_STATE_CHANGED => ControlMessage::DeviceStateChanged {
                state_id: r.get_i32()? - 1,
            },
            unknown => return Err(MirrorError::UnknownMessageType(unknown)),
        };
        r.finish()?;
        Ok(message)
    }

    /// Read the next control message from a channel, suspending until
    /// a complete frame is available.
    ///
    /// Unknown tags are consumed and surfaced as
    /// [`ControlMessage::Unrecognized`] so the stream stays usable
    /// across protocol revisions.
    pub async fn read_from(channel: &ByteChannel) -> Result<Self, MirrorError> {
        let prefix = channel.read_exact(5).await?;
        let tag = prefix[0];
        let len = u32::from_le_bytes(prefix[1..5].try_into().unwrap()) as usize;
        if len > MAX_CONTROL_PAYLOAD {
            return Err(MirrorError::MalformedMessage("control payload too large"));
        }
        let payload = channel.read_exact(len).await?;
        match Self::decode(tag, &payload) {
            Err(MirrorError::UnknownMessageType(tag)) => {
                tracing::debug!(tag, len, "skipping unrecognized control message");
                Ok(ControlMessage::Unrecognized { tag })
            }
            other => other,
        }
    }

    /// Serialize and write this message to a channel as one frame.
    pub async fn write_to(&self, channel: &ByteChannel) -> Result<(), MirrorError> {
        channel.write(&self.encode()?).await
    }
}

// ── Payload primitives ───────────────────────────────────────────

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Bounds-checked cursor over one message payload.
struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn get_i32(&mut self) -> Result<i32, MirrorError> {
        let end = self.pos + 4;
        if end > self.data.len() {
            return Err(MirrorError::MalformedMessage("truncated control payload"));
        }
        let value = i32::from_le_bytes(self.data[self.pos..end].try_into().unwrap());
        self.pos = end;
        Ok(value)
    }

    fn get_string(&mut self) -> Result<String, MirrorError> {
        let len = self.get_i32()?;
        if len < 0 {
            return Err(MirrorError::MalformedMessage("negative string length"));
        }
        let end = self.pos + len as usize;
        if end > self.data.len() {
            return Err(MirrorError::MalformedMessage("truncated control payload"));
        }
        let s = std::str::from_utf8(&self.data[self.pos..end])
            .map_err(|_| MirrorError::MalformedMessage("string is not valid UTF-8"))?
            .to_string();
        self.pos = end;
        Ok(s)
    }

    /// All payload bytes must be consumed; trailing garbage means the
    /// two ends disagree about the message layout.
    fn finish(&self) -> Result<(), MirrorError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(MirrorError::MalformedMessage("trailing bytes in control payload"))
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
