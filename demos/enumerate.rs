//! List all connected depth sensors.

fn main() {
    env_logger::init();

    let count = match cubic::count_devices() {
        Ok(n) => n,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match cubic::list_devices() {
        Ok(devices) => {
            println!("Found {} sensor(s), {} readable:", count, devices.len());
            for (i, dev) in devices.iter().enumerate() {
                println!(
                    "  [{}] Serial={}  Bus={} Addr={}",
                    i, dev.camera_serial, dev.bus_number, dev.address
                );
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
