use crate::{CubicError, Result};
use rusb::UsbContext as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long one round of event handling may block before the stop flag is
/// checked again.
const EVENT_POLL: Duration = Duration::from_millis(100);

/// Background thread that keeps USB event handling running, so transfer
/// completions fire without the caller's involvement.
pub struct EventPump {
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl EventPump {
    pub fn spawn(ctx: rusb::Context) -> Result<EventPump> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();

        let thread = std::thread::Builder::new()
            .name("cubic-usb-events".into())
            .spawn(move || event_loop(ctx, stop_clone))
            .map_err(|source| CubicError::Spawn {
                name: "cubic-usb-events",
                source,
            })?;

        Ok(EventPump {
            stop_flag,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some() && !self.stop_flag.load(Ordering::Relaxed)
    }

    /// Signal the thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("USB event thread panicked");
            }
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn event_loop(ctx: rusb::Context, stop_flag: Arc<AtomicBool>) {
    log::info!("USB event pump started");

    while !stop_flag.load(Ordering::Relaxed) {
        match ctx.handle_events(Some(EVENT_POLL)) {
            Ok(()) | Err(rusb::Error::Interrupted) => {}
            Err(e) => {
                log::warn!("USB event handling error: {}", e);
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    log::info!("USB event pump stopped");
}
