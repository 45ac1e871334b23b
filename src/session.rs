use crate::context::UsbContext;
use crate::protocol::{CAMERA_INTERFACE, MOTOR_INTERFACE, PID_NUI_CAMERA, PID_NUI_MOTOR, VID_MICROSOFT};
use crate::types::{HardwareRevision, Subdevices};
use crate::{CubicError, Result};
use rusb::UsbContext as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Where the requested sensor's sub-devices sit in the enumeration list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Located {
    pub camera: usize,
    /// Motor entry immediately preceding the camera, if any.
    pub motor: Option<usize>,
    pub revision: HardwareRevision,
}

/// Find the `index`-th camera in an enumeration list of `(vendor, product)`
/// pairs. `None` entries are devices whose descriptor could not be read.
///
/// Only Microsoft devices count toward adjacency. A camera that directly
/// follows a motor entry is an Xbox 360 unit; its motor is that entry.
pub(crate) fn locate_subdevices(ids: &[Option<(u16, u16)>], index: usize) -> Option<Located> {
    let mut ms_ordinal = 0usize;
    let mut cameras = 0usize;
    let mut last_motor: Option<(usize, usize)> = None;

    for (pos, id) in ids.iter().enumerate() {
        let Some((vid, pid)) = *id else { continue };
        if vid != VID_MICROSOFT {
            continue;
        }

        if pid == PID_NUI_MOTOR {
            last_motor = Some((pos, ms_ordinal));
        }

        if pid == PID_NUI_CAMERA {
            if cameras == index {
                let motor = last_motor
                    .filter(|&(_, ordinal)| ms_ordinal == ordinal + 1)
                    .map(|(motor_pos, _)| motor_pos);
                let revision = if motor.is_some() {
                    HardwareRevision::Xbox360
                } else {
                    HardwareRevision::KinectForWindows
                };
                return Some(Located {
                    camera: pos,
                    motor,
                    revision,
                });
            }
            cameras += 1;
        }
        ms_ordinal += 1;
    }

    None
}

/// Open, claimed USB interfaces of one physical sensor.
///
/// Once the device disappears the session is dead for good; it must be
/// closed and a new one opened.
pub struct DeviceSession {
    index: usize,
    revision: HardwareRevision,
    camera: Option<rusb::DeviceHandle<rusb::Context>>,
    motor: Option<rusb::DeviceHandle<rusb::Context>>,
    kernel_driver_detached: bool,
    device_dead: Arc<AtomicBool>,
    next_tag: u16,
}

impl DeviceSession {
    /// Acquire the `index`-th sensor's requested sub-devices.
    ///
    /// On any failure everything opened so far is released before the error
    /// is returned.
    pub fn open(ctx: &UsbContext, index: usize, subdevices: Subdevices) -> Result<DeviceSession> {
        let list = ctx.raw().devices()?;
        let devices: Vec<rusb::Device<rusb::Context>> = list.iter().collect();
        let ids: Vec<Option<(u16, u16)>> = devices
            .iter()
            .map(|d| {
                d.device_descriptor()
                    .ok()
                    .map(|desc| (desc.vendor_id(), desc.product_id()))
            })
            .collect();

        let located = locate_subdevices(&ids, index).ok_or(CubicError::DeviceNotFound(index))?;

        let mut session = DeviceSession {
            index,
            revision: located.revision,
            camera: None,
            motor: None,
            kernel_driver_detached: false,
            device_dead: Arc::new(AtomicBool::new(false)),
            next_tag: 0,
        };

        // Dropping `session` on an early return releases whatever was claimed.
        if subdevices.contains(Subdevices::CAMERA) {
            session.open_camera(&devices[located.camera])?;
        }
        if subdevices.contains(Subdevices::MOTOR) {
            let motor_pos = located.motor.ok_or(CubicError::MotorNotFound(index))?;
            session.open_motor(&devices[motor_pos])?;
        }

        log::info!(
            "Opened sensor #{}: revision={:?} camera={} motor={}",
            index,
            session.revision,
            session.camera.is_some(),
            session.motor.is_some()
        );
        Ok(session)
    }

    fn open_camera(&mut self, device: &rusb::Device<rusb::Context>) -> Result<()> {
        let mut handle = device.open().map_err(|source| CubicError::Open {
            subdevice: "camera",
            source,
        })?;

        match handle.kernel_driver_active(CAMERA_INTERFACE) {
            Ok(true) => {
                handle
                    .detach_kernel_driver(CAMERA_INTERFACE)
                    .map_err(CubicError::DetachKernelDriver)?;
                log::debug!("Detached kernel driver from camera #{}", self.index);
                self.kernel_driver_detached = true;
            }
            Ok(false) | Err(rusb::Error::NotSupported) => {}
            Err(e) => log::debug!("Kernel driver query failed: {} (continuing)", e),
        }

        let camera = self.camera.insert(handle);
        camera
            .claim_interface(CAMERA_INTERFACE)
            .map_err(|source| CubicError::Claim {
                subdevice: "camera",
                source,
            })
    }

    fn open_motor(&mut self, device: &rusb::Device<rusb::Context>) -> Result<()> {
        let mut handle = device.open().map_err(|source| CubicError::Open {
            subdevice: "motor",
            source,
        })?;
        handle
            .claim_interface(MOTOR_INTERFACE)
            .map_err(|source| CubicError::Claim {
                subdevice: "motor",
                source,
            })?;
        self.motor = Some(handle);
        Ok(())
    }

    /// Release interfaces, give the camera back to its kernel driver and
    /// close both handles. Safe to call more than once.
    pub fn close_subdevices(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            let _ = camera.release_interface(CAMERA_INTERFACE);
            if self.kernel_driver_detached {
                if let Err(e) = camera.attach_kernel_driver(CAMERA_INTERFACE) {
                    log::debug!("Re-attaching camera kernel driver failed: {}", e);
                }
                self.kernel_driver_detached = false;
            }
            log::debug!("Closed camera #{}", self.index);
        }
        if let Some(mut motor) = self.motor.take() {
            let _ = motor.release_interface(MOTOR_INTERFACE);
            log::debug!("Closed motor #{}", self.index);
        }
    }

    /// Issue a control transfer on the camera. Direction follows bit 7 of
    /// `request_type`; returns the number of bytes transferred.
    pub fn control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> Result<usize> {
        let camera = self.camera.as_ref().ok_or(CubicError::SessionClosed)?;
        if self.is_dead() {
            return Err(CubicError::DeviceGone);
        }
        let result = if request_type & 0x80 != 0 {
            camera.read_control(request_type, request, value, index, data, CONTROL_TIMEOUT)
        } else {
            camera.write_control(request_type, request, value, index, data, CONTROL_TIMEOUT)
        };
        result.map_err(|e| {
            if e == rusb::Error::NoDevice {
                self.mark_dead();
            }
            CubicError::Usb(e)
        })
    }

    pub(crate) fn take_tag(&mut self) -> u16 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        tag
    }

    pub(crate) fn camera_raw(&self) -> Option<*mut rusb::ffi::libusb_device_handle> {
        self.camera.as_ref().map(|h| h.as_raw())
    }

    pub(crate) fn dead_flag(&self) -> Arc<AtomicBool> {
        self.device_dead.clone()
    }

    fn mark_dead(&self) {
        if !self.device_dead.swap(true, Ordering::AcqRel) {
            log::error!("Sensor #{} disappeared", self.index);
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn revision(&self) -> HardwareRevision {
        self.revision
    }

    pub fn has_motor(&self) -> bool {
        self.motor.is_some()
    }

    /// True once the underlying USB device has gone away.
    pub fn is_dead(&self) -> bool {
        self.device_dead.load(Ordering::Acquire)
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close_subdevices();
    }
}
