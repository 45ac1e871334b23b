use crate::grid::VoxelGrid;
use crate::store::DepthStore;
use crate::{CubicError, Result};
use crossbeam_channel::{RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Consumer of each finished grid. Runs on the fusion thread; the grid is
/// only valid for the duration of the call.
pub type ReadyCallback = Box<dyn FnMut(&VoxelGrid) + Send>;

/// One fusion pass over every registered sensor.
pub struct FusionCore {
    grid: VoxelGrid,
    stores: Vec<Arc<DepthStore>>,
    resolution: f64,
}

impl FusionCore {
    pub fn new(dims: [usize; 3], resolution: f64, stores: Vec<Arc<DepthStore>>) -> FusionCore {
        FusionCore {
            grid: VoxelGrid::new(dims),
            stores,
            resolution,
        }
    }

    /// Zero the grid, project each sensor in index order, then hand the grid
    /// to `on_ready`. Returns the number of samples counted.
    ///
    /// Each sensor is locked only while it is projected, so the grid may mix
    /// frames of different ages.
    pub fn run_cycle(&mut self, on_ready: &mut dyn FnMut(&VoxelGrid)) -> usize {
        self.grid.clear();
        let mut counted = 0;
        for store in &self.stores {
            counted += store.read(|frame| self.grid.accumulate(frame, self.resolution));
        }
        on_ready(&self.grid);
        counted
    }

    pub fn grid(&self) -> &VoxelGrid {
        &self.grid
    }
}

/// Time left to sleep in a cycle of length `period`. Overruns are not
/// caught up.
pub fn pacing_delay(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

/// Periodic fusion on a dedicated thread.
pub struct FusionEngine {
    stop_tx: Option<Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl FusionEngine {
    pub fn spawn(
        core: FusionCore,
        refresh_rate: f64,
        on_ready: ReadyCallback,
    ) -> Result<FusionEngine> {
        if !(refresh_rate > 0.0 && refresh_rate.is_finite()) {
            return Err(CubicError::InvalidParams(format!(
                "refresh rate must be positive, got {}",
                refresh_rate
            )));
        }
        let period = Duration::from_secs_f64(1.0 / refresh_rate);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("cubic-fusion".into())
            .spawn(move || fusion_loop(core, period, on_ready, stop_rx))
            .map_err(|source| CubicError::Spawn {
                name: "cubic-fusion",
                source,
            })?;

        Ok(FusionEngine {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Stop after the current cycle and join the thread. Idempotent.
    pub fn stop(&mut self) {
        // Dropping the sender wakes the loop out of its pacing sleep.
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Fusion thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for FusionEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn fusion_loop(
    mut core: FusionCore,
    period: Duration,
    mut on_ready: ReadyCallback,
    stop_rx: crossbeam_channel::Receiver<()>,
) {
    log::info!(
        "Fusion started: {} sensors, {:?} grid, period {:?}",
        core.stores.len(),
        core.grid.dims(),
        period
    );
    let mut cycles: u64 = 0;

    loop {
        match stop_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(()) | Err(TryRecvError::Disconnected) => break,
        }

        let started = Instant::now();
        let counted = core.run_cycle(&mut *on_ready);
        cycles += 1;

        let elapsed = started.elapsed();
        if elapsed > period {
            log::debug!("Fusion cycle {} overran: {:?} > {:?}", cycles, elapsed, period);
        }
        log::trace!("Fusion cycle {}: {} samples in {:?}", cycles, counted, elapsed);

        match stop_rx.recv_timeout(pacing_delay(period, elapsed)) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("Fusion stopped after {} cycles", cycles);
}
