//! The boundary to the present loop that renders into the bridge's surface.
//!
//! Rendering itself is up to the consumer. This module defines what the consumer
//! drives ([`PresentLoop`]), the input it receives ([`InputEvent`]), a touchscreen
//! source reading Linux evdev devices ([`TouchInput`]) and a minimal frame-paced loop
//! ([`PacedLoop`]).
//!
//! A present loop that runs on its own thread must make its managed calls through
//! [`crate::vm::spawn_attached`] or an [`crate::vm::AttachScope`].

pub mod decoder;
pub mod devices;
mod input;

pub use decoder::{AxisRange, CoordMapper, RawEvent, TouchDecoder};
pub use input::TouchInput;

use std::{
    collections::{vec_deque, VecDeque},
    thread,
    time::{Duration, Instant},
};

use strum::{Display, IntoStaticStr};
use tracing::trace;

use crate::{bridge::SurfaceHandle, Result};

/// Phase of a touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum TouchPhase {
    /// A finger went down
    Start,
    /// A finger moved
    Move,
    /// A finger was lifted
    End,
    /// The touch was aborted
    Cancel,
}

/// An input event in surface coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    /// A touch on device `device`; `id` is `device * 1000 + slot`.
    Touch {
        /// Index of the device among the opened ones
        device: usize,
        /// Stable identity of the finger while it is down
        id: u64,
        /// Phase
        phase: TouchPhase,
        /// Horizontal position in pixels
        x: f32,
        /// Vertical position in pixels
        y: f32,
    },
}

/// Events pending at the time of one pump.
///
/// The sequence is finite, and each pump starts a new one. Events not consumed are
/// discarded when it is dropped.
pub struct InputEvents<'a> {
    drain: Option<vec_deque::Drain<'a, InputEvent>>,
}

impl<'a> InputEvents<'a> {
    /// Drains `queue`.
    pub fn new(queue: &'a mut VecDeque<InputEvent>) -> Self {
        InputEvents {
            drain: Some(queue.drain(..)),
        }
    }

    /// A sequence without events.
    pub fn empty() -> Self {
        InputEvents { drain: None }
    }
}

impl Iterator for InputEvents<'_> {
    type Item = InputEvent;

    fn next(&mut self) -> Option<InputEvent> {
        self.drain.as_mut()?.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.drain
            .as_ref()
            .map_or((0, Some(0)), |drain| drain.size_hint())
    }
}

/// What a present loop is driven through.
pub trait PresentLoop {
    /// State of one frame in flight.
    type Frame;

    /// Starts a frame on `surface`.
    ///
    /// # Errors
    /// Implementation defined.
    fn begin_frame(&mut self, surface: &SurfaceHandle) -> Result<Self::Frame>;

    /// Finishes and presents `frame`.
    ///
    /// # Errors
    /// Implementation defined.
    fn end_frame(&mut self, frame: Self::Frame) -> Result<()>;

    /// Input received since the last pump. Never blocks.
    fn pump_input_events(&mut self) -> InputEvents<'_>;
}

/// A frame of a [`PacedLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number, starting at 0
    pub index: u64,
    /// Surface width
    pub width: i32,
    /// Surface height
    pub height: i32,
    started: Instant,
}

/// A present loop that only keeps time and forwards touch input.
pub struct PacedLoop {
    input: TouchInput,
    interval: Duration,
    frames: u64,
}

impl PacedLoop {
    /// A loop producing at most `fps` frames per second.
    pub fn new(input: TouchInput, fps: u32) -> Self {
        PacedLoop {
            input,
            interval: Duration::from_secs(1) / fps.max(1),
            frames: 0,
        }
    }

    /// Number of frames ended so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// The loop's touch source.
    pub fn input(&self) -> &TouchInput {
        &self.input
    }

    fn start(&self, width: i32, height: i32) -> Frame {
        Frame {
            index: self.frames,
            width,
            height,
            started: Instant::now(),
        }
    }

    fn finish(&mut self, frame: Frame) {
        if let Some(rest) = self.interval.checked_sub(frame.started.elapsed()) {
            thread::sleep(rest);
        }
        self.frames = frame.index + 1;
        trace!(frame = frame.index, "frame presented");
    }
}

impl PresentLoop for PacedLoop {
    type Frame = Frame;

    fn begin_frame(&mut self, surface: &SurfaceHandle) -> Result<Frame> {
        Ok(self.start(surface.width(), surface.height()))
    }

    fn end_frame(&mut self, frame: Frame) -> Result<()> {
        self.finish(frame);
        Ok(())
    }

    fn pump_input_events(&mut self) -> InputEvents<'_> {
        self.input.pump()
    }
}
