//! Touch device discovery.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

/// Kernel listing of input devices.
pub const INPUT_DEVICES: &str = "/proc/bus/input/devices";

const EVENT_NODES: usize = 20;

/// One block of `/proc/bus/input/devices`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputDevice {
    /// `N: Name=`
    pub name: String,
    /// `/dev/input/eventN` nodes from `H: Handlers=`
    pub events: Vec<PathBuf>,
    /// Whether a `B: ABS=` line is present
    pub has_abs: bool,
}

impl InputDevice {
    /// Returns true if the name suggests a touchscreen.
    pub fn touch_named(&self) -> bool {
        let name = self.name.to_lowercase();
        name.contains("touch") || name.contains("ts") || name.contains("finger")
    }
}

/// Parses the blank-line separated device blocks.
pub fn parse_devices(text: &str) -> Vec<InputDevice> {
    let mut devices = Vec::new();
    let mut current: Option<InputDevice> = None;

    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            devices.extend(current.take());
            continue;
        }

        let device = current.get_or_insert_with(InputDevice::default);
        if let Some(name) = line.strip_prefix("N: Name=") {
            device.name = name.trim_matches('"').to_string();
        } else if line.starts_with("B: ABS=") {
            device.has_abs = true;
        } else if let Some(handlers) = line.strip_prefix("H: Handlers=") {
            device.events = handlers
                .split_whitespace()
                .filter(|handler| handler.starts_with("event"))
                .map(|handler| Path::new("/dev/input").join(handler))
                .collect();
        }
    }
    devices.extend(current);

    devices
}

/// Event nodes of devices reporting absolute axes, touch-named devices first.
pub fn touch_candidates(devices: &[InputDevice]) -> Vec<PathBuf> {
    let mut candidates: Vec<&InputDevice> = devices
        .iter()
        .filter(|device| device.has_abs && !device.events.is_empty())
        .collect();
    candidates.sort_by_key(|device| !device.touch_named());

    candidates
        .into_iter()
        .flat_map(|device| device.events.iter().cloned())
        .collect()
}

/// Touch device nodes of this system.
///
/// Falls back to every existing `/dev/input/event0` to `event19` when the kernel
/// listing is unreadable or names no candidate.
pub fn discover() -> Vec<PathBuf> {
    let candidates = fs::read_to_string(INPUT_DEVICES)
        .map(|text| touch_candidates(&parse_devices(&text)))
        .unwrap_or_default();
    if !candidates.is_empty() {
        debug!(?candidates, "touch candidates");
        return candidates;
    }

    (0..EVENT_NODES)
        .map(|index| PathBuf::from(format!("/dev/input/event{index}")))
        .filter(|path| path.exists())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
I: Bus=0019 Vendor=0000 Product=0000 Version=0000
N: Name=\"gpio-keys\"
P: Phys=gpio-keys/input0
H: Handlers=kbd event0
B: EV=3
B: KEY=8000 100000 0 0 0

I: Bus=0018 Vendor=0000 Product=0000 Version=0000
N: Name=\"fts_ts\"
P: Phys=
H: Handlers=event2 cpufreq
B: EV=b
B: KEY=400 0 0 0 0 0
B: ABS=2658000 3

I: Bus=0000 Vendor=0000 Product=0000 Version=0000
N: Name=\"accelerometer\"
H: Handlers=event1
B: EV=9
B: ABS=7";

    #[test]
    fn parse() {
        let devices = parse_devices(LISTING);

        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].name, "gpio-keys");
        assert!(!devices[0].has_abs);
        assert_eq!(devices[1].events, vec![PathBuf::from("/dev/input/event2")]);
        assert!(devices[1].touch_named());
        assert!(devices[2].has_abs);
    }

    #[test]
    fn candidates_prefer_touch_names() {
        let candidates = touch_candidates(&parse_devices(LISTING));

        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/dev/input/event2"),
                PathBuf::from("/dev/input/event1"),
            ]
        );
    }

    #[test]
    fn empty_listing() {
        assert!(parse_devices("").is_empty());
        assert!(touch_candidates(&[]).is_empty());
    }
}
