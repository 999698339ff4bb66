//! Client-side coordinate and input bookkeeping.
//!
//! The inbound frame is already rotated for display, but control
//! coordinates must be expressed against the device's unrotated
//! native frame. [`ClientCoordinator`] undoes the viewport transform,
//! then rotates by the negative of the current orientation, and
//! assigns stable pointer ids to multi-touch contacts.

use std::collections::BTreeMap;

use crate::protocol::{ControlMessage, KeyAction, MotionAction, Pointer};
use crate::streamer::{Size, VideoFrame};

// ── Viewport ─────────────────────────────────────────────────────

/// Placement of the displayed frame inside the hosting view: the
/// frame's top-left corner offset and the uniform scale from rotated
/// device pixels to view pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub offset_x: f64,
    pub offset_y: f64,
    pub scale: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            offset_x: 0.0,
            offset_y: 0.0,
            scale: 1.0,
        }
    }
}

// ── PointerIdAllocator ───────────────────────────────────────────

/// Stable pointer ids for simultaneous contacts. The lowest free id
/// is handed out; an id becomes free only on release.
#[derive(Debug, Default)]
pub struct PointerIdAllocator {
    in_use: Vec<bool>,
}

impl PointerIdAllocator {
    pub fn acquire(&mut self) -> i32 {
        for (id, used) in self.in_use.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return id as i32;
            }
        }
        self.in_use.push(true);
        (self.in_use.len() - 1) as i32
    }

    pub fn release(&mut self, id: i32) {
        if let Some(used) = self.in_use.get_mut(id as usize) {
            *used = false;
        }
    }
}

// ── ClientCoordinator ────────────────────────────────────────────

pub struct ClientCoordinator {
    device_display_size: Size,
    orientation: i32,
    viewport: Viewport,
    pointer_ids: PointerIdAllocator,
    /// Active contacts by pointer id, in device-native coordinates.
    contacts: BTreeMap<i32, (i32, i32)>,
    last_frame_number: u64,
}

impl ClientCoordinator {
    /// `device_display_size` is the unrotated native display size.
    pub fn new(device_display_size: Size) -> Self {
        Self {
            device_display_size,
            orientation: 0,
            viewport: Viewport::default(),
            pointer_ids: PointerIdAllocator::default(),
            contacts: BTreeMap::new(),
            last_frame_number: 0,
        }
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    /// Track a rendered frame: adopts its per-packet orientation and
    /// remembers its frame number, so a caller can tell when a
    /// requested change has visibly taken effect.
    pub fn frame_rendered(&mut self, frame: &VideoFrame) {
        self.orientation = frame.orientation.rem_euclid(4);
        self.last_frame_number = frame.frame_number;
    }

    pub fn last_frame_number(&self) -> u64 {
        self.last_frame_number
    }

    pub fn orientation(&self) -> i32 {
        self.orientation
    }

    /// Map view coordinates to device-native coordinates. `None` when
    /// the point falls outside the device display.
    pub fn device_coordinates(&self, view_x: f64, view_y: f64) -> Option<(i32, i32)> {
        let rotated = self.device_display_size.rotated_by_quadrants(self.orientation);
        let x = (view_x - self.viewport.offset_x) / self.viewport.scale;
        let y = (view_y - self.viewport.offset_y) / self.viewport.scale;
        if x < 0.0 || y < 0.0 || x >= rotated.width as f64 || y >= rotated.height as f64 {
            return None;
        }
        Some(unrotate_point(x as i32, y as i32, rotated, self.orientation))
    }

    // ── Input translation ────────────────────────────────────────

    /// Start a touch contact at view coordinates. Returns the pointer
    /// id assigned to the contact and the message to send. The
    /// pointer the action refers to is listed last.
    pub fn begin_touch(&mut self, view_x: f64, view_y: f64) -> Option<(i32, ControlMessage)> {
        let position = self.device_coordinates(view_x, view_y)?;
        let id = self.pointer_ids.acquire();
        let action = if self.contacts.is_empty() {
            MotionAction::Down
        } else {
            MotionAction::PointerDown
        };
        self.contacts.insert(id, position);
        Some((id, self.motion_message(action, id)))
    }

    /// Move an active contact. `None` if the id is unknown or the
    /// point left the display.
    pub fn move_touch(&mut self, id: i32, view_x: f64, view_y: f64) -> Option<ControlMessage> {
        if !self.contacts.contains_key(&id) {
            return None;
        }
        let position = self.device_coordinates(view_x, view_y)?;
        self.contacts.insert(id, position);
        Some(self.motion_message(MotionAction::Move, id))
    }

    /// Release a contact. Its id becomes reusable afterwards.
    pub fn end_touch(&mut self, id: i32) -> Option<ControlMessage> {
        self.contacts.get(&id)?;
        let action = if self.contacts.len() == 1 {
            MotionAction::Up
        } else {
            MotionAction::PointerUp
        };
        let message = self.motion_message(action, id);
        self.contacts.remove(&id);
        self.pointer_ids.release(id);
        Some(message)
    }

    /// All active contacts with the acting pointer moved to the end.
    fn motion_message(&self, action: MotionAction, acting_id: i32) -> ControlMessage {
        let mut pointers: Vec<Pointer> = self
            .contacts
            .iter()
            .filter(|(id, _)| **id != acting_id)
            .map(|(id, (x, y))| Pointer {
                x: *x,
                y: *y,
                pointer_id: *id,
            })
            .collect();
        if let Some((x, y)) = self.contacts.get(&acting_id) {
            pointers.push(Pointer {
                x: *x,
                y: *y,
                pointer_id: acting_id,
            });
        }
        ControlMessage::MotionEvent {
            pointers,
            action,
            meta_state: 0,
        }
    }

    pub fn key_event(&self, action: KeyAction, key_code: i32, meta_state: i32) -> ControlMessage {
        ControlMessage::KeyEvent {
            action,
            key_code,
            meta_state,
        }
    }

    pub fn text_input(&self, text: &str) -> ControlMessage {
        ControlMessage::TextInput {
            text: text.to_owned(),
        }
    }
}

/// Rotate a point in a rotated frame back into native coordinates by
/// undoing `quadrants` clockwise quarter turns.
fn unrotate_point(x: i32, y: i32, rotated: Size, quadrants: i32) -> (i32, i32) {
    let (mut x, mut y) = (x, y);
    let mut size = rotated;
    for _ in 0..quadrants.rem_euclid(4) {
        // Inverse of one clockwise turn.
        let nx = y;
        let ny = size.width as i32 - 1 - x;
        x = nx;
        y = ny;
        size = Size::new(size.height, size.width);
    }
    (x, y)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> ClientCoordinator {
        ClientCoordinator::new(Size::new(1080, 2280))
    }

    #[test]
    fn identity_viewport_maps_directly() {
        let c = coordinator();
        assert_eq!(c.device_coordinates(100.0, 200.0), Some((100, 200)));
        assert_eq!(c.device_coordinates(-1.0, 0.0), None);
        assert_eq!(c.device_coordinates(1080.0, 0.0), None);
    }

    #[test]
    fn viewport_scale_and_offset_are_undone() {
        let mut c = coordinator();
        c.set_viewport(Viewport {
            offset_x: 10.0,
            offset_y: 20.0,
            scale: 0.5,
        });
        // View point (60, 120) → ((60-10)/0.5, (120-20)/0.5) = (100, 200).
        assert_eq!(c.device_coordinates(60.0, 120.0), Some((100, 200)));
    }

    #[test]
    fn rotated_display_maps_to_native_frame() {
        let mut c = ClientCoordinator::new(Size::new(4, 2));
        c.orientation = 1;
        // Rotated frame is 2 wide, 4 tall. The rotated pixel (0, 0)
        // is the native pixel (0, 1); the native top-left lands at
        // rotated (1, 0).
        assert_eq!(c.device_coordinates(0.0, 0.0), Some((0, 1)));
        assert_eq!(c.device_coordinates(1.0, 0.0), Some((0, 0)));
        assert_eq!(c.device_coordinates(0.0, 3.0), Some((3, 1)));
    }

    #[test]
    fn unrotation_round_trips_through_image_rotation() {
        use crate::video::DisplayImage;
        let mut image = DisplayImage::new(6, 4);
        image.set_pixel(5, 1, [1, 2, 3, 4]);

        for orientation in 0..4 {
            let rotated = image.rotated_by_quadrants(orientation);
            let rotated_size = Size::new(rotated.width, rotated.height);
            // Find the marked pixel in the rotated frame.
            let mut found = None;
            for y in 0..rotated.height {
                for x in 0..rotated.width {
                    if rotated.pixel(x, y) == [1, 2, 3, 4] {
                        found = Some((x as i32, y as i32));
                    }
                }
            }
            let (rx, ry) = found.unwrap();
            assert_eq!(
                unrotate_point(rx, ry, rotated_size, orientation),
                (5, 1),
                "orientation {orientation}"
            );
        }
    }

    #[test]
    fn pointer_ids_are_reused_only_after_release() {
        let mut c = coordinator();
        let (first, msg) = c.begin_touch(100.0, 200.0).unwrap();
        assert_eq!(first, 0);
        assert!(matches!(
            msg,
            ControlMessage::MotionEvent { action: MotionAction::Down, .. }
        ));

        let (second, msg) = c.begin_touch(300.0, 400.0).unwrap();
        assert_eq!(second, 1);
        assert!(matches!(
            msg,
            ControlMessage::MotionEvent { action: MotionAction::PointerDown, .. }
        ));

        // Releasing 0 frees it; the next press takes it again.
        c.end_touch(first).unwrap();
        let (third, _) = c.begin_touch(500.0, 600.0).unwrap();
        assert_eq!(third, 0);
        // Pointer 1 is still held.
        let (fourth, _) = c.begin_touch(700.0, 800.0).unwrap();
        assert_eq!(fourth, 2);
    }

    #[test]
    fn motion_messages_carry_all_contacts_acting_last() {
        let mut c = coordinator();
        let (a, _) = c.begin_touch(100.0, 200.0).unwrap();
        let (b, _) = c.begin_touch(300.0, 400.0).unwrap();

        let msg = c.move_touch(a, 110.0, 210.0).unwrap();
        match msg {
            ControlMessage::MotionEvent { pointers, action, .. } => {
                assert_eq!(action, MotionAction::Move);
                assert_eq!(pointers.len(), 2);
                assert_eq!(pointers[0].pointer_id, b);
                assert_eq!(pointers[1].pointer_id, a);
                assert_eq!((pointers[1].x, pointers[1].y), (110, 210));
            }
            other => panic!("unexpected message {other:?}"),
        }

        let msg = c.end_touch(b).unwrap();
        assert!(matches!(
            msg,
            ControlMessage::MotionEvent { action: MotionAction::PointerUp, .. }
        ));
        let msg = c.end_touch(a).unwrap();
        assert!(matches!(
            msg,
            ControlMessage::MotionEvent { action: MotionAction::Up, .. }
        ));
    }

    #[test]
    fn frame_tracking_follows_the_stream() {
        use crate::video::DisplayImage;
        let mut c = coordinator();
        let frame = VideoFrame {
            image: DisplayImage::new(2, 2),
            display_size: Size::new(2, 2),
            orientation: 3,
            frame_number: 17,
            origination_timestamp_us: 0,
            presentation_timestamp_us: 0,
        };
        c.frame_rendered(&frame);
        assert_eq!(c.last_frame_number(), 17);
        assert_eq!(c.orientation(), 3);
    }
}
