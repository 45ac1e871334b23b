use crate::types::{Intrinsics, StreamGeometry, Subdevices};
use crate::{CubicError, Result};

/// Parameters fixed when the sensors are opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CubicParams {
    /// Grid size in cells along x, y and z.
    pub dims: [usize; 3],
    /// Edge length of one cell, in millimetres.
    pub resolution: f64,
    /// Fusion cycles per second.
    pub refresh_rate: f64,
    /// Fallback calibration for sensors whose zero-plane info cannot be read.
    pub intrinsics: Intrinsics,
    pub subdevices: Subdevices,
    pub stream: StreamGeometry,
}

impl Default for CubicParams {
    fn default() -> Self {
        Self {
            dims: [200, 100, 200],
            resolution: 50.0,
            refresh_rate: 30.0,
            intrinsics: Intrinsics::default(),
            subdevices: Subdevices::CAMERA,
            stream: StreamGeometry::default(),
        }
    }
}

impl CubicParams {
    /// Defaults overridden by `CUBIC_*` environment variables.
    ///
    /// Unparsable values fall back to the default silently.
    pub fn from_env() -> CubicParams {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CubicParams {
        let defaults = CubicParams::default();
        let mut subdevices = Subdevices::CAMERA;
        if read_bool(&lookup, "CUBIC_ENABLE_MOTOR", false) {
            subdevices |= Subdevices::MOTOR;
        }

        CubicParams {
            dims: read_dims(&lookup, "CUBIC_DIMS", defaults.dims),
            resolution: read_f64(&lookup, "CUBIC_RESOLUTION_MM", defaults.resolution),
            refresh_rate: read_f64(&lookup, "CUBIC_REFRESH_HZ", defaults.refresh_rate),
            intrinsics: Intrinsics {
                reference_pixel_size: read_f64(
                    &lookup,
                    "CUBIC_REF_PIXEL_SIZE",
                    defaults.intrinsics.reference_pixel_size,
                ),
                reference_distance: read_f64(
                    &lookup,
                    "CUBIC_REF_DISTANCE",
                    defaults.intrinsics.reference_distance,
                ),
            },
            subdevices,
            stream: defaults.stream,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dims.iter().any(|&d| d == 0) {
            return Err(CubicError::InvalidParams(format!(
                "grid dimensions must be non-zero, got {:?}",
                self.dims
            )));
        }
        if self.dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d)).is_none() {
            return Err(CubicError::InvalidParams("grid too large".into()));
        }
        if !(self.resolution > 0.0 && self.resolution.is_finite()) {
            return Err(CubicError::InvalidParams(format!(
                "resolution must be positive, got {}",
                self.resolution
            )));
        }
        if !(self.refresh_rate > 0.0 && self.refresh_rate.is_finite()) {
            return Err(CubicError::InvalidParams(format!(
                "refresh rate must be positive, got {}",
                self.refresh_rate
            )));
        }
        if !(self.intrinsics.reference_distance > 0.0) {
            return Err(CubicError::InvalidParams(
                "reference distance must be positive".into(),
            ));
        }
        if !self.subdevices.contains(Subdevices::CAMERA) {
            return Err(CubicError::InvalidParams(
                "the camera sub-device is required for depth".into(),
            ));
        }
        let s = &self.stream;
        if s.transfers == 0 || s.packets_per_transfer == 0 || s.packet_len == 0 {
            return Err(CubicError::InvalidParams(format!(
                "empty stream geometry {:?}",
                s
            )));
        }
        Ok(())
    }
}

fn read_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    lookup(name)
        .and_then(|v| {
            let v = v.trim().to_ascii_lowercase();
            match v.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        })
        .unwrap_or(default)
}

fn read_f64(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: f64) -> f64 {
    lookup(name)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

fn read_dims(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: [usize; 3],
) -> [usize; 3] {
    lookup(name)
        .and_then(|v| {
            let v = v.trim().to_ascii_lowercase();
            let parts: Vec<usize> = v
                .split('x')
                .map(|p| p.trim().parse::<usize>())
                .collect::<std::result::Result<_, _>>()
                .ok()?;
            <[usize; 3]>::try_from(parts).ok()
        })
        .unwrap_or(default)
}
