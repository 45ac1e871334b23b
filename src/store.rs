use crate::protocol::{DEPTH_HEIGHT, DEPTH_WIDTH};
use crate::transform::ExtrinsicTransform;
use crate::types::Intrinsics;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Everything the fusion loop needs from one sensor, guarded together.
pub struct DepthFrame {
    /// Latest depth image in millimetres, row-major, 0 = no reading.
    pub depth: Vec<u16>,
    pub intrinsics: Intrinsics,
    pub transform: ExtrinsicTransform,
}

struct StoreState {
    frame: DepthFrame,
    last_frame_at: Option<Instant>,
    device_timestamp: Option<u32>,
    frames: u64,
    dropped_frames: u64,
}

/// Liveness snapshot of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHealth {
    /// The USB device went away; the sensor will not recover on its own.
    pub dead: bool,
    /// Time since the last frame was published, `None` if none ever was.
    pub last_frame_age: Option<Duration>,
    /// Sensor clock of the last published frame.
    pub device_timestamp: Option<u32>,
    pub frames: u64,
    /// Partial or short frames the assembler threw away.
    pub dropped_frames: u64,
    /// Isochronous transfers still owned by libusb or being handled.
    pub transfers_in_flight: usize,
}

/// Latest-frame store of one sensor.
///
/// The stream writer overwrites the frame in place and the fusion loop
/// reads it under the same lock. Nothing is computed while the lock is held
/// on the writer side.
pub struct DepthStore {
    state: Mutex<StoreState>,
}

impl DepthStore {
    pub fn new(intrinsics: Intrinsics, transform: ExtrinsicTransform) -> DepthStore {
        DepthStore {
            state: Mutex::new(StoreState {
                frame: DepthFrame {
                    depth: vec![0; DEPTH_WIDTH * DEPTH_HEIGHT],
                    intrinsics,
                    transform,
                },
                last_frame_at: None,
                device_timestamp: None,
                frames: 0,
                dropped_frames: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy a finished frame in, with the calibration it was taken under.
    /// Frames of the wrong size are ignored.
    pub fn publish(&self, depth: &[u16], intrinsics: Intrinsics, timestamp: u32) {
        let mut state = self.lock();
        if depth.len() != state.frame.depth.len() {
            log::warn!(
                "Dropping depth frame of {} samples (expected {})",
                depth.len(),
                state.frame.depth.len()
            );
            return;
        }
        state.frame.depth.copy_from_slice(depth);
        state.frame.intrinsics = intrinsics;
        state.last_frame_at = Some(Instant::now());
        state.device_timestamp = Some(timestamp);
        state.frames += 1;
    }

    /// Record the assembler's running count of discarded frames.
    pub fn set_dropped(&self, total: u64) {
        self.lock().dropped_frames = total;
    }

    /// Run `f` with the frame locked.
    pub fn read<R>(&self, f: impl FnOnce(&DepthFrame) -> R) -> R {
        f(&self.lock().frame)
    }

    pub fn set_transform(&self, transform: ExtrinsicTransform) {
        self.lock().frame.transform = transform;
    }

    pub fn transform(&self) -> ExtrinsicTransform {
        self.lock().frame.transform
    }

    /// Frame counters of this store; stream state is filled in by the owner.
    pub fn health(&self, dead: bool, transfers_in_flight: usize) -> DeviceHealth {
        let state = self.lock();
        DeviceHealth {
            dead,
            last_frame_age: state.last_frame_at.map(|t| t.elapsed()),
            device_timestamp: state.device_timestamp,
            frames: state.frames,
            dropped_frames: state.dropped_frames,
            transfers_in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_overwrites_in_place() {
        let store = DepthStore::new(Intrinsics::default(), ExtrinsicTransform::default());
        assert_eq!(store.health(false, 0).frames, 0);
        assert!(store.health(false, 0).last_frame_age.is_none());

        let mut frame = vec![0u16; DEPTH_WIDTH * DEPTH_HEIGHT];
        frame[7] = 1234;
        store.publish(&frame, Intrinsics::default(), 100);
        assert_eq!(store.read(|f| f.depth[7]), 1234);

        frame[7] = 0;
        store.publish(&frame, Intrinsics::default(), 200);
        assert_eq!(store.read(|f| f.depth[7]), 0);

        let health = store.health(true, 16);
        assert!(health.dead);
        assert_eq!(health.frames, 2);
        assert_eq!(health.device_timestamp, Some(200));
        assert_eq!(health.transfers_in_flight, 16);
        assert!(health.last_frame_age.is_some());
    }

    #[test]
    fn test_intrinsics_follow_each_frame() {
        let store = DepthStore::new(Intrinsics::default(), ExtrinsicTransform::default());
        let measured = Intrinsics {
            reference_pixel_size: 0.2,
            reference_distance: 118.0,
        };
        store.publish(&vec![0u16; DEPTH_WIDTH * DEPTH_HEIGHT], measured, 0);
        assert_eq!(store.read(|f| f.intrinsics), measured);

        // A rejected frame leaves the previous calibration in place.
        store.publish(&[1, 2, 3], Intrinsics::default(), 1);
        assert_eq!(store.read(|f| f.intrinsics), measured);
    }

    #[test]
    fn test_dropped_frames_are_reported() {
        let store = DepthStore::new(Intrinsics::default(), ExtrinsicTransform::default());
        store.set_dropped(3);
        let health = store.health(false, 0);
        assert_eq!(health.dropped_frames, 3);
        assert!(health.device_timestamp.is_none());
    }

    #[test]
    fn test_wrong_size_frame_is_ignored() {
        let store = DepthStore::new(Intrinsics::default(), ExtrinsicTransform::default());
        store.publish(&[1, 2, 3], Intrinsics::default(), 0);
        assert_eq!(store.health(false, 0).frames, 0);
    }

    #[test]
    fn test_transform_update() {
        let store = DepthStore::new(Intrinsics::default(), ExtrinsicTransform::default_for(0));
        let t = ExtrinsicTransform::from_pose(1.0, 0.5, 1.0, 2.0, 3.0);
        store.set_transform(t);
        assert_eq!(store.transform(), t);
        assert_eq!(store.read(|f| f.transform.yaw()), 1.0);
    }
}
