//! Fuse every attached sensor into one grid and print occupancy statistics.
//!
//! Usage: cargo run --example stream [seconds]
//! Grid geometry and calibration can be overridden with CUBIC_* variables.

use std::time::{Duration, Instant};

struct CycleStats {
    occupied: usize,
    total: u64,
}

fn main() {
    env_logger::init();

    let seconds: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);

    let count = match cubic::count_devices() {
        Ok(0) => {
            eprintln!("No sensors found");
            std::process::exit(1);
        }
        Ok(n) => n,
        Err(e) => {
            eprintln!("Failed to enumerate: {}", e);
            std::process::exit(1);
        }
    };

    let params = cubic::CubicParams::from_env();
    println!("Grid:       {:?} cells at {} mm", params.dims, params.resolution);
    println!("Refresh:    {} Hz", params.refresh_rate);
    println!("Sensors:    {}", count);
    println!();

    let (sender, receiver) = crossbeam_channel::bounded(64);
    let ids: Vec<usize> = (0..count).collect();
    let cubic = match cubic::Cubic::open(&ids, params, move |grid| {
        let stats = CycleStats {
            occupied: grid.occupied(),
            total: grid.total(),
        };
        // Drop cycles the printer cannot keep up with.
        let _ = sender.try_send(stats);
    }) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to open sensors: {}", e);
            std::process::exit(1);
        }
    };

    for i in 0..cubic.device_count() {
        let revision = cubic.revision(i).map(|r| format!("{:?}", r)).unwrap_or_default();
        let motor = cubic.has_motor(i).unwrap_or(false);
        println!("Sensor {}:   {} (motor: {})", i, revision, motor);
    }

    println!("Fusing for {}s...", seconds);

    let start = Instant::now();
    let deadline = start + Duration::from_secs(seconds);
    let mut cycles: u64 = 0;
    let mut last_report = Instant::now();

    while Instant::now() < deadline {
        match receiver.recv_timeout(Duration::from_secs(2)) {
            Ok(stats) => {
                cycles += 1;
                if cycles % 30 == 1 {
                    println!(
                        "cycle={:<6} occupied={:<8} samples={}",
                        cycles, stats.occupied, stats.total
                    );
                }
            }
            Err(_) => {
                eprintln!("Timeout waiting for fusion cycle");
                break;
            }
        }

        let now = Instant::now();
        if now.duration_since(last_report) >= Duration::from_secs(3) {
            for i in 0..cubic.device_count() {
                if let Ok(h) = cubic.device_health(i) {
                    println!(
                        "--- sensor {}: frames={} dropped={} in_flight={} last={:?} dead={} ---",
                        i, h.frames, h.dropped_frames, h.transfers_in_flight, h.last_frame_age, h.dead
                    );
                }
            }
            last_report = now;
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    println!(
        "\nTotal: {} cycles in {:.1}s ({:.1} Hz)",
        cycles,
        elapsed,
        cycles as f64 / elapsed
    );
    cubic.close();
}
