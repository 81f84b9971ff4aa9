//! Non-blocking evdev touch source.

use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{ErrorKind, Read},
    mem,
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::{Path, PathBuf},
    ptr,
};

use tracing::{debug, info, warn};

use crate::present::{
    decoder::{
        AxisRange, CoordMapper, RawEvent, TouchDecoder, ABS_MT_POSITION_X, ABS_MT_POSITION_Y,
        ABS_X, ABS_Y,
    },
    devices, InputEvent, InputEvents,
};

const READ_BATCH: usize = 64;

/// `struct input_event`.
#[repr(C)]
#[derive(Clone, Copy)]
struct KernelEvent {
    time: libc::timeval,
    kind: u16,
    code: u16,
    value: i32,
}

/// `struct input_absinfo`.
#[repr(C)]
#[derive(Default)]
struct AbsInfo {
    value: i32,
    minimum: i32,
    maximum: i32,
    fuzz: i32,
    flat: i32,
    resolution: i32,
}

/// `EVIOCGABS(axis)`, `_IOR('E', 0x40 + axis, struct input_absinfo)`.
const fn eviocgabs(axis: u16) -> u32 {
    let size = mem::size_of::<AbsInfo>() as u32;
    (2 << 30) | (size << 16) | ((b'E' as u32) << 8) | (0x40 + axis as u32)
}

fn abs_range(file: &File, axis: u16) -> Option<AxisRange> {
    let mut info = AbsInfo::default();

    // Safety: EVIOCGABS fills exactly one input_absinfo
    let status = unsafe {
        libc::ioctl(
            file.as_raw_fd(),
            eviocgabs(axis) as _,
            &mut info as *mut AbsInfo,
        )
    };
    (status == 0 && info.maximum > info.minimum)
        .then(|| AxisRange::new(info.minimum, info.maximum))
}

struct Device {
    path: PathBuf,
    file: File,
    decoder: TouchDecoder,
}

impl Device {
    fn open(
        path: &Path,
        index: usize,
        width: f32,
        height: f32,
        rotation: i32,
    ) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;

        let x = abs_range(&file, ABS_MT_POSITION_X)
            .or_else(|| abs_range(&file, ABS_X))
            .unwrap_or_default();
        let y = abs_range(&file, ABS_MT_POSITION_Y)
            .or_else(|| abs_range(&file, ABS_Y))
            .unwrap_or_default();

        let mapper = CoordMapper::new(x, y, width, height, rotation);
        info!(
            device = %path.display(),
            x = ?(x.min, x.max),
            y = ?(y.min, y.max),
            swap = mapper.swaps_axes(),
            "touch device opened"
        );

        Ok(Device {
            path: path.to_path_buf(),
            file,
            decoder: TouchDecoder::new(index, mapper),
        })
    }

    /// Reads until the device has nothing more; returns false once it is gone.
    fn drain(&mut self, queue: &mut VecDeque<InputEvent>) -> bool {
        let size = mem::size_of::<KernelEvent>();
        let mut buffer = vec![0u8; size * READ_BATCH];

        loop {
            let read = match self.file.read(&mut buffer) {
                Ok(0) => return true,
                Ok(read) => read,
                Err(error) if error.kind() == ErrorKind::WouldBlock => return true,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    warn!(device = %self.path.display(), %error, "touch device lost");
                    return false;
                }
            };

            for chunk in buffer[..read].chunks_exact(size) {
                // Safety: chunk holds size_of::<KernelEvent>() bytes written by the kernel
                let event: KernelEvent = unsafe { ptr::read_unaligned(chunk.as_ptr().cast()) };
                self.decoder
                    .feed(RawEvent::new(event.kind, event.code, event.value), queue);
            }
        }
    }
}

/// Touch input from every touchscreen of the system.
///
/// Devices are opened non-blocking; [`TouchInput::pump`] never waits.
pub struct TouchInput {
    devices: Vec<Device>,
    queue: VecDeque<InputEvent>,
}

impl TouchInput {
    /// Opens the devices at `paths` for a `width` x `height` surface at `rotation`.
    ///
    /// Devices that cannot be opened are skipped.
    pub fn open(paths: &[PathBuf], width: f32, height: f32, rotation: i32) -> Self {
        let devices = paths
            .iter()
            .enumerate()
            .filter_map(|(index, path)| {
                Device::open(path, index, width, height, rotation)
                    .map_err(|error| warn!(device = %path.display(), %error, "cannot open"))
                    .ok()
            })
            .collect();

        TouchInput {
            devices,
            queue: VecDeque::new(),
        }
    }

    /// Opens the devices [`devices::discover`] finds.
    pub fn discover(width: f32, height: f32, rotation: i32) -> Self {
        Self::open(&devices::discover(), width, height, rotation)
    }

    /// Number of devices still open.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Returns true if no device is open.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Reads what is pending on every device and returns the decoded touches.
    pub fn pump(&mut self) -> InputEvents<'_> {
        let queue = &mut self.queue;
        self.devices.retain_mut(|device| device.drain(queue));

        if !queue.is_empty() {
            debug!(events = queue.len(), "touch events");
        }
        InputEvents::new(queue)
    }
}

#[cfg(test)]
mod tests {
    use std::{env, fs, process};

    use super::*;

    #[test]
    fn ioctl_number() {
        // EVIOCGABS(ABS_MT_POSITION_X) as defined by linux/input.h
        assert_eq!(eviocgabs(ABS_MT_POSITION_X), 0x8018_4575);
        assert_eq!(eviocgabs(ABS_X), 0x8018_4540);
    }

    #[test]
    fn unopenable_devices_are_skipped() {
        let mut input = TouchInput::open(
            &[PathBuf::from("/nonexistent/droidstrap/event0")],
            1080.0,
            2400.0,
            0,
        );

        assert!(input.is_empty());
        assert_eq!(input.pump().count(), 0);
    }

    #[test]
    fn decodes_recorded_events() {
        let path = env::temp_dir().join(format!("droidstrap_event_{}", process::id()));
        let mut recording = Vec::new();
        for (kind, code, value) in [
            (3u16, 0x39u16, 4i32),
            (3, 0x35, 16383),
            (3, 0x36, 16383),
            (0, 0, 0),
        ] {
            let event = KernelEvent {
                // Safety: timeval is plain old data
                time: unsafe { mem::zeroed() },
                kind,
                code,
                value,
            };
            // Safety: KernelEvent is plain old data
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    (&event as *const KernelEvent).cast::<u8>(),
                    mem::size_of::<KernelEvent>(),
                )
            };
            recording.extend_from_slice(bytes);
        }
        fs::write(&path, &recording).unwrap();

        let mut input = TouchInput::open(&[path.clone()], 100.0, 100.0, 0);
        assert_eq!(input.device_count(), 1);

        let events: Vec<_> = input.pump().collect();
        assert_eq!(events.len(), 1);
        let InputEvent::Touch { id, phase, x, .. } = events[0];
        assert_eq!(id, 0);
        assert_eq!(phase, crate::present::TouchPhase::Start);
        assert!((x - 50.0).abs() < 0.01);

        assert_eq!(input.pump().count(), 0);
        fs::remove_file(&path).unwrap();
    }
}
