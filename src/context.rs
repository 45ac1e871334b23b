use crate::protocol::{PID_NUI_CAMERA, VID_MICROSOFT};
use crate::types::DeviceAttributes;
use crate::Result;
use rusb::UsbContext as _;
use std::time::Duration;

/// Process-wide handle to the USB subsystem.
///
/// Either created here (owned) or adopted from the caller. An adopted
/// context is never torn down by this layer; the caller's clone keeps it
/// alive.
pub struct UsbContext {
    ctx: rusb::Context,
    owned: bool,
}

fn is_camera(desc: &rusb::DeviceDescriptor) -> bool {
    desc.vendor_id() == VID_MICROSOFT && desc.product_id() == PID_NUI_CAMERA
}

impl UsbContext {
    /// Open a new context, or adopt `existing` when provided.
    pub fn init(existing: Option<rusb::Context>) -> Result<UsbContext> {
        match existing {
            Some(ctx) => {
                log::debug!("Adopting caller-owned USB context");
                Ok(UsbContext { ctx, owned: false })
            }
            None => {
                let ctx = rusb::Context::new()?;
                log::debug!("Created USB context");
                Ok(UsbContext { ctx, owned: true })
            }
        }
    }

    /// Whether this layer created (and will release) the context.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub(crate) fn raw(&self) -> &rusb::Context {
        &self.ctx
    }

    /// Count attached cameras.
    pub fn count_matching_devices(&self) -> Result<usize> {
        let devices = self.ctx.devices()?;
        let count = devices
            .iter()
            .filter(|d| d.device_descriptor().map(|desc| is_camera(&desc)).unwrap_or(false))
            .count();
        Ok(count)
    }

    /// List attached cameras by serial number.
    ///
    /// Opens each camera briefly to read its serial string. Cameras without
    /// a serial descriptor, or that cannot be opened (e.g. claimed by another
    /// process), are skipped.
    pub fn list_devices(&self) -> Result<Vec<DeviceAttributes>> {
        let mut found = Vec::new();

        for device in self.ctx.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            if !is_camera(&desc) || desc.serial_number_string_index().is_none() {
                continue;
            }

            let handle = match device.open() {
                Ok(h) => h,
                Err(e) => {
                    log::debug!(
                        "Skipping camera at bus {} addr {}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            match handle.read_serial_number_string_ascii(&desc) {
                Ok(serial) => found.push(DeviceAttributes {
                    camera_serial: serial,
                    bus_number: device.bus_number(),
                    address: device.address(),
                }),
                Err(e) => log::debug!("Could not read camera serial: {}", e),
            }
        }

        Ok(found)
    }

    /// Run one round of USB event handling; completion callbacks fire here.
    pub fn process_events(&self, timeout: Option<Duration>) -> Result<()> {
        self.ctx.handle_events(timeout)?;
        Ok(())
    }

    /// Release the context. Only an owned context is actually torn down.
    pub fn shutdown(self) {
        if self.owned {
            log::debug!("Releasing USB context");
        } else {
            log::debug!("Leaving caller-owned USB context alive");
        }
    }
}

/// Count attached cameras using a temporary context.
pub fn count_devices() -> Result<usize> {
    UsbContext::init(None)?.count_matching_devices()
}

/// List attached cameras using a temporary context.
pub fn list_devices() -> Result<Vec<DeviceAttributes>> {
    UsbContext::init(None)?.list_devices()
}
