use crate::protocol;

/// Attributes of an attached sensor, as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttributes {
    pub camera_serial: String,
    pub bus_number: u8,
    pub address: u8,
}

/// Hardware generation, inferred from enumeration order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareRevision {
    /// Camera enumerates right after a separate motor device.
    Xbox360 = 0,
    /// No adjacent motor device.
    KinectForWindows = 1,
}

bitflags::bitflags! {
    /// Sensor sub-devices a session should claim.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(C)]
    pub struct Subdevices: u32 {
        const MOTOR  = 1 << 0;
        const CAMERA = 1 << 1;
    }
}

/// Per-sensor constants relating raw depth to real-world distance.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    /// Size of one pixel at the reference plane, in millimetres.
    pub reference_pixel_size: f64,
    /// Distance of the reference plane, in millimetres.
    pub reference_distance: f64,
}

impl Default for Intrinsics {
    fn default() -> Self {
        Self {
            reference_pixel_size: protocol::DEFAULT_REF_PIXEL_SIZE,
            reference_distance: protocol::DEFAULT_REF_DISTANCE,
        }
    }
}

/// Shape of an isochronous stream's transfer pool.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    pub transfers: usize,
    pub packets_per_transfer: usize,
    pub packet_len: usize,
}

impl StreamGeometry {
    pub fn buffer_len(&self) -> usize {
        self.transfers * self.packets_per_transfer * self.packet_len
    }

    pub fn transfer_len(&self) -> usize {
        self.packets_per_transfer * self.packet_len
    }
}

impl Default for StreamGeometry {
    fn default() -> Self {
        Self {
            transfers: protocol::NUM_XFERS,
            packets_per_transfer: protocol::PKTS_PER_XFER,
            packet_len: protocol::DEPTH_PKTBUF,
        }
    }
}
