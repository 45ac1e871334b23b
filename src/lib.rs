//! # cubic - fuse Kinect-class depth sensors into a voxel occupancy grid
//!
//! Drives one or more depth sensors over USB with libusb (via rusb) and
//! projects their depth frames into one shared 3-D grid at a fixed rate.
//! Provides:
//! - Sensor enumeration (count, serial numbers)
//! - Continuous isochronous depth streaming with device-loss detection
//! - Per-sensor extrinsic poses, adjustable at runtime
//! - C FFI for integration with C/C++ visualizers
//!
//! ## Quick Start
//! ```no_run
//! use cubic::{Cubic, CubicParams};
//!
//! let params = CubicParams::from_env();
//! let cubic = Cubic::open(&[0, 1], params, |grid| {
//!     println!("{} occupied cells", grid.occupied());
//! })
//! .unwrap();
//!
//! // Second sensor stands 1.5 m to the right, turned to face the first.
//! cubic
//!     .adjust_transform(1, std::f64::consts::PI, 0.0, 1500.0, 0.0, 0.0)
//!     .unwrap();
//!
//! std::thread::sleep(std::time::Duration::from_secs(5));
//! cubic.close();
//! ```

pub mod error;
pub mod types;
pub mod protocol;
pub mod context;
pub mod session;
pub mod camera;
pub mod iso;
pub mod pump;
pub mod frame;
pub mod transform;
pub mod store;
pub mod grid;
pub mod fusion;
pub mod config;
pub mod cubic;
pub mod ffi;

pub use config::CubicParams;
pub use context::{count_devices, list_devices, UsbContext};
pub use cubic::Cubic;
pub use error::CubicError;
pub use grid::VoxelGrid;
pub use session::DeviceSession;
pub use store::DeviceHealth;
pub use transform::ExtrinsicTransform;
pub use types::*;

/// Result type alias for cubic operations.
pub type Result<T> = std::result::Result<T, CubicError>;
