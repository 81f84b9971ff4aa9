//! Decoding of Linux evdev touch reports.
//!
//! Multitouch protocol B reports per-slot tracking ids and positions, committed by
//! `SYN_REPORT`. Devices that never report multitouch axes are decoded as single-touch
//! (`ABS_X`, `ABS_Y`, `BTN_TOUCH`).

use std::collections::VecDeque;

use crate::present::{InputEvent, TouchPhase};

/// Synchronization event type.
pub const EV_SYN: u16 = 0x00;
/// Key and button event type.
pub const EV_KEY: u16 = 0x01;
/// Absolute axis event type.
pub const EV_ABS: u16 = 0x03;

/// Commits the preceding events as one report.
pub const SYN_REPORT: u16 = 0x00;

/// Single-touch X position.
pub const ABS_X: u16 = 0x00;
/// Single-touch Y position.
pub const ABS_Y: u16 = 0x01;
/// Selects the slot later multitouch events apply to.
pub const ABS_MT_SLOT: u16 = 0x2f;
/// Multitouch X position.
pub const ABS_MT_POSITION_X: u16 = 0x35;
/// Multitouch Y position.
pub const ABS_MT_POSITION_Y: u16 = 0x36;
/// Multitouch tracking id; -1 lifts the slot's contact.
pub const ABS_MT_TRACKING_ID: u16 = 0x39;

/// Single-touch contact button.
pub const BTN_TOUCH: u16 = 0x14a;

/// Slots tracked per device.
pub const MAX_SLOTS: usize = 10;

/// One `struct input_event`, without its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    /// `EV_*`
    pub kind: u16,
    /// Axis, key or sync code
    pub code: u16,
    /// Value
    pub value: i32,
}

impl RawEvent {
    /// Creates an event.
    pub const fn new(kind: u16, code: u16, value: i32) -> Self {
        RawEvent { kind, code, value }
    }
}

/// Range an absolute axis reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisRange {
    /// Minimum value
    pub min: i32,
    /// Maximum value
    pub max: i32,
}

impl AxisRange {
    /// Creates a range.
    pub const fn new(min: i32, max: i32) -> Self {
        AxisRange { min, max }
    }

    // Widened so that ranges spanning most of i32 do not overflow.
    fn span(&self) -> f32 {
        (i64::from(self.max) - i64::from(self.min)).max(1) as f32
    }

    fn normalize(&self, value: i32) -> f32 {
        (i64::from(value) - i64::from(self.min)) as f32 / self.span()
    }
}

impl Default for AxisRange {
    fn default() -> Self {
        AxisRange::new(0, 32767)
    }
}

/// Maps sensor coordinates onto the surface.
///
/// The sensor is mounted in a fixed orientation. Axes are swapped when the sensor's
/// aspect differs from the surface's, then flipped according to the display rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordMapper {
    x: AxisRange,
    y: AxisRange,
    width: f32,
    height: f32,
    swap: bool,
    flip_x: bool,
    flip_y: bool,
}

impl CoordMapper {
    /// A mapper for a sensor with ranges `x` and `y` onto a `width` x `height` surface
    /// shown at `rotation` (`Surface.ROTATION_*`).
    pub fn new(x: AxisRange, y: AxisRange, width: f32, height: f32, rotation: i32) -> Self {
        let sensor_landscape = x.span() < y.span();
        let screen_landscape = width < height;

        let (flip_x, flip_y) = match rotation {
            1 => (false, true),
            2 => (true, true),
            3 => (true, false),
            _ => (false, false),
        };

        CoordMapper {
            x,
            y,
            width,
            height,
            swap: sensor_landscape != screen_landscape,
            flip_x,
            flip_y,
        }
    }

    /// Returns true if sensor axes are swapped onto the surface.
    pub fn swaps_axes(&self) -> bool {
        self.swap
    }

    /// Surface position of a sensor position.
    pub fn to_screen(&self, raw_x: i32, raw_y: i32) -> (f32, f32) {
        let mut nx = self.x.normalize(raw_x);
        let mut ny = self.y.normalize(raw_y);

        if self.swap {
            std::mem::swap(&mut nx, &mut ny);
        }
        if self.flip_x {
            nx = 1.0 - nx;
        }
        if self.flip_y {
            ny = 1.0 - ny;
        }

        (nx * self.width, ny * self.height)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    tracking_id: i32,
    committed_id: i32,
    x: i32,
    y: i32,
    moved: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Slot {
            tracking_id: -1,
            committed_id: -1,
            x: 0,
            y: 0,
            moved: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SingleTouch {
    x: i32,
    y: i32,
    down: bool,
    was_down: bool,
}

/// Turns one device's raw events into touch events.
#[derive(Debug, Clone)]
pub struct TouchDecoder {
    device: usize,
    mapper: CoordMapper,
    slots: [Slot; MAX_SLOTS],
    current: usize,
    multitouch: bool,
    single: SingleTouch,
}

impl TouchDecoder {
    /// A decoder for device number `device`.
    pub fn new(device: usize, mapper: CoordMapper) -> Self {
        TouchDecoder {
            device,
            mapper,
            slots: [Slot::default(); MAX_SLOTS],
            current: 0,
            multitouch: false,
            single: SingleTouch::default(),
        }
    }

    /// The device's coordinate mapper.
    pub fn mapper(&self) -> &CoordMapper {
        &self.mapper
    }

    /// Feeds one raw event; a `SYN_REPORT` appends the frame's touches to `out`.
    pub fn feed(&mut self, event: RawEvent, out: &mut VecDeque<InputEvent>) {
        match (event.kind, event.code) {
            (EV_ABS, ABS_MT_SLOT) => {
                self.multitouch = true;
                if let Ok(slot) = usize::try_from(event.value) {
                    if slot < MAX_SLOTS {
                        self.current = slot;
                    }
                }
            }
            (EV_ABS, ABS_MT_TRACKING_ID) => {
                self.multitouch = true;
                self.slots[self.current].tracking_id = event.value;
            }
            (EV_ABS, ABS_MT_POSITION_X) => {
                self.multitouch = true;
                let slot = &mut self.slots[self.current];
                slot.x = event.value;
                slot.moved = true;
            }
            (EV_ABS, ABS_MT_POSITION_Y) => {
                self.multitouch = true;
                let slot = &mut self.slots[self.current];
                slot.y = event.value;
                slot.moved = true;
            }
            (EV_ABS, ABS_X) => self.single.x = event.value,
            (EV_ABS, ABS_Y) => self.single.y = event.value,
            (EV_KEY, BTN_TOUCH) => self.single.down = event.value != 0,
            (EV_SYN, SYN_REPORT) => {
                if self.multitouch {
                    self.commit_slots(out);
                } else {
                    self.commit_single(out);
                }
            }
            _ => {}
        }
    }

    fn commit_slots(&mut self, out: &mut VecDeque<InputEvent>) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let current = slot.tracking_id;
            let previous = slot.committed_id;

            let phase = if previous < 0 && current >= 0 {
                Some(TouchPhase::Start)
            } else if previous >= 0 && current < 0 {
                Some(TouchPhase::End)
            } else if current >= 0 && slot.moved {
                Some(TouchPhase::Move)
            } else {
                None
            };

            slot.committed_id = current;

            let Some(phase) = phase else {
                continue;
            };
            // a finger without a position yet is reported once it has one
            if !slot.moved && phase != TouchPhase::End {
                continue;
            }
            slot.moved = false;

            let (x, y) = self.mapper.to_screen(slot.x, slot.y);
            out.push_back(InputEvent::Touch {
                device: self.device,
                id: (self.device * 1000 + index) as u64,
                phase,
                x,
                y,
            });
        }
    }

    fn commit_single(&mut self, out: &mut VecDeque<InputEvent>) {
        let SingleTouch {
            x,
            y,
            down,
            was_down,
        } = self.single;
        self.single.was_down = down;

        let phase = match (was_down, down) {
            (false, true) => TouchPhase::Start,
            (true, true) => TouchPhase::Move,
            (true, false) => TouchPhase::End,
            (false, false) => return,
        };

        let (x, y) = self.mapper.to_screen(x, y);
        out.push_back(InputEvent::Touch {
            device: self.device,
            id: (self.device * 1000) as u64,
            phase,
            x,
            y,
        });
    }
}
