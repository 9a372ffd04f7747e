use std::fmt::Display;

const THRUSTMASTER_VID: u16 = 0x044f;

/// Product IDs that enumerate as the generic "Thrustmaster FFB Wheel" and are
/// recognized entry points into the mode-switch protocol.
const RECOGNIZED_DEVICES: &[RecognizedDevice] = &[
    RecognizedDevice {
        pid: 0xb65d,
        path: ProbePath::Identify,
    },
    RecognizedDevice {
        pid: 0xb664,
        path: ProbePath::Identify,
    },
    // The T128 resets itself when asked for its identity, so it is switched
    // blindly instead of being identified first.
    RecognizedDevice {
        pid: 0xb69c,
        path: ProbePath::BlindSwitch { switch_code: 0x000b },
    },
];

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

#[derive(Copy, Clone, Debug)]
struct RecognizedDevice {
    pid: u16,
    path: ProbePath,
}

/// How a recognized wheel gets from generic to full-featured mode.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ProbePath {
    /// Query the wheel's identity, then send the switch code the catalog
    /// maps it to.
    Identify,
    /// Skip identification and send a hard-coded switch code on connect.
    BlindSwitch { switch_code: u16 },
}

/// Compatibility of a device, with the probe path to take if applicable.
pub enum DeviceCompat {
    /// Enumerates as a generic FFB wheel awaiting a mode switch.
    Recognized(ProbePath),
    /// Carries Thrustmaster's VID but is not a generic pre-switch wheel;
    /// either it already switched and re-enumerated with its real identity,
    /// or it is a product this tool does not handle.
    OtherThrustmaster,
    /// Not a Thrustmaster device at all. Treated as if it doesn't exist.
    Incompatible,
}

impl Display for DeviceCompat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeviceCompat::Recognized(ProbePath::Identify) => {
                write!(f, "generic wheel awaiting identification")
            }
            DeviceCompat::Recognized(ProbePath::BlindSwitch { .. }) => {
                write!(f, "generic wheel, switched without identification")
            }
            DeviceCompat::OtherThrustmaster => write!(f, "not a wheel awaiting initialization"),
            DeviceCompat::Incompatible => write!(f, "incompatible device"),
        }
    }
}

/// Find a device's compatibility and probe path based on its USB ID.
pub fn identify_device(id: UsbId) -> DeviceCompat {
    if id.vid != THRUSTMASTER_VID {
        return DeviceCompat::Incompatible;
    }

    for candidate in RECOGNIZED_DEVICES {
        if candidate.pid == id.pid {
            return DeviceCompat::Recognized(candidate.path);
        }
    }

    DeviceCompat::OtherThrustmaster
}
