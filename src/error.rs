use std::fmt;

/// Errors that can occur while acquiring sensors or running the fusion pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CubicError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Sensor #{0} not found (VID=045E PID=02AE)")]
    DeviceNotFound(usize),

    #[error("Could not open {subdevice}: {source}")]
    Open {
        subdevice: &'static str,
        source: rusb::Error,
    },

    #[error("Could not detach kernel driver for camera: {0}")]
    DetachKernelDriver(rusb::Error),

    #[error("Could not claim interface on {subdevice}: {source}")]
    Claim {
        subdevice: &'static str,
        source: rusb::Error,
    },

    #[error("Motor requested but no motor precedes camera #{0}")]
    MotorNotFound(usize),

    #[error("Camera command 0x{cmd:04x} failed: {reason}")]
    Command { cmd: u16, reason: String },

    #[error("Session is closed")]
    SessionClosed,

    #[error("Device disconnected")]
    DeviceGone,

    #[error("No sensor registered at slot {0}")]
    InvalidDevice(usize),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &CubicError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}
