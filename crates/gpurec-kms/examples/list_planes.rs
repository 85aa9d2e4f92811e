//! Spawn the broker and dump the current scanout planes.
//!
//! Needs `gpurec-kms-broker` on $PATH (or next to the example binary) and
//! will go through pkexec when not run as root.
//!
//! ```sh
//! cargo run --example list_planes
//! ```

use gpurec_kms::BrokerClient;

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let Some(card) = gpurec_kms::default_card_path() else {
        eprintln!("no DRM card found");
        std::process::exit(23);
    };

    let mut broker = match BrokerClient::spawn(&card) {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("broker spawn failed: {e}");
            std::process::exit(3);
        }
    };

    match broker.get_kms() {
        Ok(response) => {
            for (i, item) in response.items.iter().enumerate() {
                println!(
                    "plane {}: {}x{} fourcc {:#010x} modifier {:#x} connector {} cursor={} hdr={} planes={}",
                    i,
                    item.width,
                    item.height,
                    item.pixel_format,
                    item.modifier,
                    item.connector_id,
                    item.is_cursor,
                    item.hdr_metadata.is_some(),
                    item.bufs.len(),
                );
            }
        }
        Err(e) => {
            eprintln!("GET_KMS failed: {e}");
            std::process::exit(3);
        }
    }
}
