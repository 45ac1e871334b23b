use crate::config::CubicParams;
use crate::context::UsbContext;
use crate::frame::DepthAssembler;
use crate::fusion::{FusionCore, FusionEngine};
use crate::grid::VoxelGrid;
use crate::iso::IsoStream;
use crate::protocol::DEPTH_ENDPOINT;
use crate::pump::EventPump;
use crate::session::DeviceSession;
use crate::store::{DepthStore, DeviceHealth};
use crate::transform::ExtrinsicTransform;
use crate::types::HardwareRevision;
use crate::{CubicError, Result};
use std::sync::Arc;

// Fields drop in declaration order: the stream's transfers point at the
// session's camera handle, so the stream goes first.
struct Sensor {
    id: usize,
    stream: Option<IsoStream>,
    session: DeviceSession,
    store: Arc<DepthStore>,
}

/// A set of depth sensors streaming into one shared occupancy grid.
///
/// Opening starts everything: a depth stream per sensor, the USB event
/// thread and the fusion thread. Each fusion cycle hands the grid to the
/// ready callback. Closing (or dropping) tears down in reverse: fusion,
/// streams, event thread, sessions, context.
pub struct Cubic {
    sensors: Vec<Sensor>,
    fusion: Option<FusionEngine>,
    pump: Option<EventPump>,
    ctx: Option<UsbContext>,
    params: CubicParams,
}

impl Cubic {
    /// Open the sensors with the given enumeration indices.
    ///
    /// Slot `i` of the result is `sensor_ids[i]`; its default pose faces
    /// `i * 60` degrees around the vertical axis.
    pub fn open<F>(sensor_ids: &[usize], params: CubicParams, on_ready: F) -> Result<Cubic>
    where
        F: FnMut(&VoxelGrid) + Send + 'static,
    {
        Self::open_with_context(None, sensor_ids, params, on_ready)
    }

    /// Like [`Cubic::open`], optionally on a caller-owned USB context, which
    /// is left alive on close.
    pub fn open_with_context<F>(
        existing: Option<rusb::Context>,
        sensor_ids: &[usize],
        params: CubicParams,
        on_ready: F,
    ) -> Result<Cubic>
    where
        F: FnMut(&VoxelGrid) + Send + 'static,
    {
        params.validate()?;
        if sensor_ids.is_empty() {
            return Err(CubicError::InvalidParams("no sensors requested".into()));
        }

        let ctx = UsbContext::init(existing)?;
        let raw_ctx = ctx.raw().clone();
        let mut cubic = Cubic {
            sensors: Vec::with_capacity(sensor_ids.len()),
            fusion: None,
            pump: None,
            ctx: Some(ctx),
            params,
        };

        // On any error below, dropping `cubic` releases what was started.
        for (slot, &id) in sensor_ids.iter().enumerate() {
            let ctx = cubic.ctx.as_ref().ok_or(CubicError::SessionClosed)?;
            let sensor = open_sensor(ctx, slot, id, &params)?;
            cubic.sensors.push(sensor);
        }

        cubic.pump = Some(EventPump::spawn(raw_ctx)?);

        let stores = cubic.sensors.iter().map(|s| s.store.clone()).collect();
        let core = FusionCore::new(params.dims, params.resolution, stores);
        cubic.fusion = Some(FusionEngine::spawn(
            core,
            params.refresh_rate,
            Box::new(on_ready),
        )?);

        log::info!(
            "Cubic running: {} sensors, grid {:?} at {} mm, {} Hz",
            cubic.sensors.len(),
            params.dims,
            params.resolution,
            params.refresh_rate
        );
        Ok(cubic)
    }

    fn sensor(&self, device: usize) -> Result<&Sensor> {
        self.sensors
            .get(device)
            .ok_or(CubicError::InvalidDevice(device))
    }

    /// Replace the pose of the sensor in slot `device`. Angles in radians,
    /// translation in millimetres. Takes effect from the next projection of
    /// that sensor.
    pub fn adjust_transform(
        &self,
        device: usize,
        yaw: f64,
        pitch: f64,
        x: f64,
        y: f64,
        z: f64,
    ) -> Result<()> {
        let sensor = self.sensor(device)?;
        sensor
            .store
            .set_transform(ExtrinsicTransform::from_pose(yaw, pitch, x, y, z));
        log::debug!(
            "Sensor slot {} pose: yaw={:.3} pitch={:.3} t=({}, {}, {})",
            device,
            yaw,
            pitch,
            x,
            y,
            z
        );
        Ok(())
    }

    pub fn transform(&self, device: usize) -> Result<ExtrinsicTransform> {
        Ok(self.sensor(device)?.store.transform())
    }

    /// Liveness of the sensor in slot `device`.
    pub fn device_health(&self, device: usize) -> Result<DeviceHealth> {
        let sensor = self.sensor(device)?;
        let dead = sensor.session.is_dead()
            || sensor.stream.as_ref().map(IsoStream::is_dead).unwrap_or(true);
        let in_flight = sensor.stream.as_ref().map(IsoStream::in_flight).unwrap_or(0);
        Ok(sensor.store.health(dead, in_flight))
    }

    pub fn device_count(&self) -> usize {
        self.sensors.len()
    }

    /// Enumeration index the sensor in slot `device` was opened with.
    pub fn device_id(&self, device: usize) -> Result<usize> {
        Ok(self.sensor(device)?.id)
    }

    pub fn revision(&self, device: usize) -> Result<HardwareRevision> {
        Ok(self.sensor(device)?.session.revision())
    }

    /// Whether the motor sub-device of slot `device` was opened.
    pub fn has_motor(&self, device: usize) -> Result<bool> {
        Ok(self.sensor(device)?.session.has_motor())
    }

    pub fn params(&self) -> &CubicParams {
        &self.params
    }

    /// Stop everything and release every device.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(mut fusion) = self.fusion.take() {
            fusion.stop();
        }

        for sensor in &mut self.sensors {
            if let Some(mut stream) = sensor.stream.take() {
                stream.stop();
            }
            if !sensor.session.is_dead() {
                if let Err(e) = sensor.session.stop_depth() {
                    log::debug!("Could not stop depth on sensor #{}: {}", sensor.id, e);
                }
            }
        }

        if let Some(mut pump) = self.pump.take() {
            pump.stop();
        }

        for sensor in &mut self.sensors {
            sensor.session.close_subdevices();
        }
        self.sensors.clear();

        if let Some(ctx) = self.ctx.take() {
            ctx.shutdown();
            log::info!("Cubic closed");
        }
    }
}

impl Drop for Cubic {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn open_sensor(ctx: &UsbContext, slot: usize, id: usize, params: &CubicParams) -> Result<Sensor> {
    let mut session = DeviceSession::open(ctx, id, params.subdevices)?;
    let intrinsics = match session.fetch_intrinsics() {
        Ok(intrinsics) => intrinsics,
        Err(e) => {
            log::warn!(
                "Sensor #{} calibration unavailable ({}), using configured values",
                id,
                e
            );
            params.intrinsics
        }
    };
    session.start_depth()?;

    let store = Arc::new(DepthStore::new(
        intrinsics,
        ExtrinsicTransform::default_for(slot),
    ));
    let sink_store = store.clone();
    let mut assembler = DepthAssembler::new();
    let mut reported_drops = 0;

    let stream = IsoStream::start(ctx, &session, DEPTH_ENDPOINT, params.stream, move |pkt| {
        if assembler.push(pkt).is_some() {
            sink_store.publish(assembler.frame(), intrinsics, assembler.timestamp());
        }
        if assembler.dropped() != reported_drops {
            reported_drops = assembler.dropped();
            sink_store.set_dropped(reported_drops);
        }
    });
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = session.stop_depth();
            return Err(e);
        }
    };

    Ok(Sensor {
        id,
        stream: Some(stream),
        session,
        store,
    })
}
