//! The privileged KMS broker helper.
//!
//! Spawned by the recorder (directly, via pkexec, or via
//! `flatpak-spawn --host`); never run by hand. Usage:
//!
//! ```text
//! gpurec-kms-broker <socket-path> <card-path>
//! ```

use std::process::ExitCode;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(socket_path), Some(card_path)) = (args.next(), args.next()) else {
        eprintln!("usage: gpurec-kms-broker <socket-path> <card-path>");
        return ExitCode::from(2);
    };

    match gpurec_kms::server::run(&socket_path, &card_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("gpurec-kms-broker: {e}");
            ExitCode::FAILURE
        }
    }
}
