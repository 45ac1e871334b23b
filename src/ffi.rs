//! C FFI layer for cubic.
//!
//! Provides an opaque handle-based API for C/C++ consumers.
//! The generated C header is written to `include/cubic.h` by cbindgen.

use crate::config::CubicParams;
use crate::cubic::Cubic;
use crate::error::LastError;
use crate::grid::VoxelGrid;
use crate::CubicError;
use std::ffi::{c_char, c_int, c_void};

/// Last error message for C consumers.
static LAST_ERROR: LastError = LastError::new();

/// Opaque handle to a running set of sensors.
pub struct CubicHandle(Cubic);

/// Called once per fusion cycle with the grid cells and its dimensions.
///
/// `cells` holds `dims[0] * dims[1] * dims[2]` counters, indexed
/// `z * dims[0] * dims[1] + y * dims[0] + x`. Both pointers are only valid
/// during the call; copy the data to keep it.
pub type CubicReadyFn =
    Option<unsafe extern "C" fn(cells: *const u32, dims: *const usize, user_data: *mut c_void)>;

/// Open-time parameters in C-compatible layout.
#[repr(C)]
pub struct CubicParamsC {
    /// Grid size in cells along x, y and z.
    pub dims: [usize; 3],
    /// Cell edge length in millimetres.
    pub resolution: f64,
    /// Fusion cycles per second.
    pub refresh_rate: f64,
    /// Invoked on the fusion thread after every cycle. May be NULL.
    pub on_ready: CubicReadyFn,
    /// Passed back to `on_ready` untouched.
    pub user_data: *mut c_void,
}

struct UserData(*mut c_void);

// SAFETY: the pointer is only handed back to the caller's callback; the
// caller is responsible for it being usable from the fusion thread.
unsafe impl Send for UserData {}

impl UserData {
    fn get(&self) -> *mut c_void {
        self.0
    }
}

/// Number of attached sensors, or -1 on error.
#[no_mangle]
pub extern "C" fn cubic_num_devices() -> c_int {
    match crate::context::count_devices() {
        Ok(n) => n as c_int,
        Err(e) => {
            LAST_ERROR.set(&e);
            -1
        }
    }
}

/// Open `count` sensors whose enumeration indices are in `ids`.
/// Returns NULL on error (check cubic_last_error()).
///
/// Environment overrides (`CUBIC_*`) apply to calibration and motor
/// selection; geometry and timing come from `params`.
///
/// # Safety
/// `ids` must point to `count` elements and `params` to a valid
/// `CubicParamsC`, or be null.
#[no_mangle]
pub unsafe extern "C" fn cubic_open(
    count: usize,
    ids: *const usize,
    params: *const CubicParamsC,
) -> *mut CubicHandle {
    if ids.is_null() || params.is_null() || count == 0 {
        LAST_ERROR.set(&CubicError::InvalidParams(
            "ids and params must be non-null and count non-zero".into(),
        ));
        return std::ptr::null_mut();
    }

    let ids = std::slice::from_raw_parts(ids, count);
    let params_c = &*params;
    let params = CubicParams {
        dims: params_c.dims,
        resolution: params_c.resolution,
        refresh_rate: params_c.refresh_rate,
        ..CubicParams::from_env()
    };

    let on_ready = params_c.on_ready;
    let user_data = UserData(params_c.user_data);
    let callback = move |grid: &VoxelGrid| {
        if let Some(cb) = on_ready {
            let dims = grid.dims();
            // SAFETY: the caller supplied a callback matching CubicReadyFn.
            unsafe { cb(grid.as_slice().as_ptr(), dims.as_ptr(), user_data.get()) };
        }
    };

    match Cubic::open(ids, params, callback) {
        Ok(cubic) => Box::into_raw(Box::new(CubicHandle(cubic))),
        Err(e) => {
            LAST_ERROR.set(&e);
            std::ptr::null_mut()
        }
    }
}

/// Set the pose of the sensor in slot `device`: yaw and pitch in radians,
/// translation in millimetres. Returns 0 on success, -1 on error.
///
/// # Safety
/// `cubic` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn cubic_transform_adjust(
    cubic: *const CubicHandle,
    device: usize,
    yaw: f64,
    pitch: f64,
    x: f64,
    y: f64,
    z: f64,
) -> c_int {
    if cubic.is_null() {
        return -1;
    }
    let cubic = &*cubic;
    match cubic.0.adjust_transform(device, yaw, pitch, x, y, z) {
        Ok(()) => 0,
        Err(e) => {
            LAST_ERROR.set(&e);
            -1
        }
    }
}

/// Whether the sensor in slot `device` has been lost. Unknown slots and a
/// null handle report true.
///
/// # Safety
/// `cubic` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn cubic_device_is_dead(cubic: *const CubicHandle, device: usize) -> bool {
    if cubic.is_null() {
        return true;
    }
    let cubic = &*cubic;
    match cubic.0.device_health(device) {
        Ok(health) => health.dead,
        Err(e) => {
            LAST_ERROR.set(&e);
            true
        }
    }
}

/// Stop all streaming and release every sensor.
///
/// # Safety
/// `cubic` must be a pointer returned by `cubic_open`, or null. Must not be
/// called from inside the ready callback.
#[no_mangle]
pub unsafe extern "C" fn cubic_close(cubic: *mut CubicHandle) {
    if !cubic.is_null() {
        let handle = Box::from_raw(cubic);
        handle.0.close();
    }
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is valid until the next cubic API call.
#[no_mangle]
pub extern "C" fn cubic_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}
