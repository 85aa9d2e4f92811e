//! List the monitors the runtime can see.
//!
//! ```sh
//! cargo run --example list_monitors
//! ```

use gpurec_gl::{GlRuntime, RuntimeOptions};

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let runtime = match GlRuntime::load(&RuntimeOptions {
        display_name: None,
        is_monitor_capture: true,
    }) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("GL runtime failed to load: {e}");
            std::process::exit(22);
        }
    };

    println!("display server: {:?}", runtime.display_server());
    println!("gpu: {:?}", runtime.gpu_info());
    for monitor in runtime.monitors() {
        println!(
            "{}: {}x{} at ({}, {}) rotation {:?} connector {}",
            monitor.name,
            monitor.size.0,
            monitor.size.1,
            monitor.position.0,
            monitor.position.1,
            monitor.rotation,
            monitor.connector_id,
        );
    }
}
