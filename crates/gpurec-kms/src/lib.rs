//! # gpurec-kms
//!
//! Privileged KMS plane broker for the gpurec capture pipeline.
//!
//! Reading scanout framebuffers through KMS requires CAP_SYS_ADMIN on
//! modern kernels. Rather than run the whole recorder as root, gpurec
//! spawns a small privileged helper and talks to it over a Unix stream
//! socket with a fixed, versioned wire protocol. DMA-BUF file descriptors
//! cross the boundary as `SCM_RIGHTS` ancillary data.
//!
//! This crate contains all three pieces:
//!
//! - [`protocol`] - the wire format shared by both sides
//! - [`client`] - spawn + handshake + serial `GET_KMS` requests
//! - [`server`] - the helper's DRM plane enumeration, also built as the
//!   `gpurec-kms-broker` binary
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use gpurec_kms::BrokerClient;
//!
//! let mut broker = BrokerClient::spawn("/dev/dri/card0")?;
//! let response = broker.get_kms()?;
//! for item in &response.items {
//!     println!(
//!         "plane {}x{} fourcc {:#x} connector {} cursor={}",
//!         item.width, item.height, item.pixel_format,
//!         item.connector_id, item.is_cursor,
//!     );
//! }
//! ```
//!
//! # Security
//!
//! The handshake socket lives under `$HOME` with a random suffix and is
//! unlinked as soon as the connection moves to the anonymous socketpair.
//! The helper answers only the two request types and never writes to the
//! DRM device.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::BrokerClient;
pub use error::{KmsError, Result};
pub use protocol::{
    DmaBuf, HdrOutputMetadata, Request, RequestType, Response, ResponseItem, ResponseResult,
    MAX_DMA_BUFS, MAX_ITEMS, PROTOCOL_VERSION,
};

/// DRM_FORMAT_MOD_INVALID: no explicit format modifier.
pub const FORMAT_MOD_INVALID: u64 = 0x00FF_FFFF_FFFF_FFFF;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pick the first usable DRM card node.
///
/// The client passes the path to the helper so both sides agree on the
/// device even when several GPUs are present.
pub fn default_card_path() -> Option<String> {
    for i in 0..10 {
        let path = format!("/dev/dri/card{i}");
        if std::path::Path::new(&path).exists() {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_card_path_shape() {
        if let Some(path) = default_card_path() {
            assert!(path.starts_with("/dev/dri/card"));
        }
    }
}
