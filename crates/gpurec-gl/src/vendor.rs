//! GPU vendor detection from the GL renderer string.
//!
//! The result gates later decisions: encoder family selection, codec
//! alignment quirks and the NvFBC/GLX switch. Detection happens once, right
//! after the first context becomes current.

use tracing::info;

use crate::error::{GlError, Result};

/// GPU vendor families the encoder selector distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuVendor {
    #[default]
    Amd,
    Intel,
    Nvidia,
}

/// Detected GPU information.
#[derive(Debug, Clone, Default)]
pub struct GpuInfo {
    pub vendor: GpuVendor,

    /// Marketing generation parsed from the renderer string, 0 if unknown.
    /// Only meaningful for NVIDIA ("GeForce RTX 2070" -> 2070).
    pub generation: u32,

    /// The AMD custom APU in the Steam Deck; several encoder quirks key
    /// off this.
    pub is_steam_deck: bool,
}

const SOFTWARE_RENDERERS: &[&str] = &["llvmpipe", "SWR", "softpipe"];

/// Classify the GPU from the `GL_VENDOR` and `GL_RENDERER` strings.
///
/// Software rasterizers are rejected outright: capturing through them means
/// the driver stack is broken and every frame would take a CPU round-trip.
pub fn detect(vendor: Option<&str>, renderer: Option<&str>) -> Result<GpuInfo> {
    if let Some(renderer) = renderer {
        for sw in SOFTWARE_RENDERERS {
            if renderer.contains(sw) {
                return Err(GlError::SoftwareRenderer((*sw).to_string()));
            }
        }
    }

    let haystack = format!(
        "{} {}",
        vendor.unwrap_or_default(),
        renderer.unwrap_or_default()
    )
    .to_lowercase();

    let vendor_kind = if haystack.contains("nvidia") {
        GpuVendor::Nvidia
    } else if haystack.contains("intel") {
        GpuVendor::Intel
    } else {
        // Mesa reports AMD hardware in several ways (AMD, ATI, radeonsi);
        // AMD is also the safe default for unknown Mesa drivers since the
        // VAAPI path is the generic one.
        GpuVendor::Amd
    };

    let generation = if vendor_kind == GpuVendor::Nvidia {
        renderer.map_or(0, parse_nvidia_generation)
    } else {
        0
    };

    let is_steam_deck = renderer.is_some_and(|r| r.contains("vangogh"));

    let info = GpuInfo {
        vendor: vendor_kind,
        generation,
        is_steam_deck,
    };
    info!(
        "GPU: {:?}{}{}",
        info.vendor,
        if info.generation > 0 {
            format!(" generation {}", info.generation)
        } else {
            String::new()
        },
        if info.is_steam_deck { " (Steam Deck)" } else { "" }
    );
    Ok(info)
}

/// Parse the model number out of an NVIDIA renderer string.
///
/// Renderer strings look like "NVIDIA GeForce RTX 2070 SUPER/PCIe/SSE2";
/// the first all-digit token is the model.
fn parse_nvidia_generation(renderer: &str) -> u32 {
    renderer
        .split(|c: char| !c.is_ascii_digit())
        .find(|tok| !tok.is_empty())
        .and_then(|tok| tok.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_nvidia_with_generation() {
        let info = detect(
            Some("NVIDIA Corporation"),
            Some("NVIDIA GeForce RTX 2070 SUPER/PCIe/SSE2"),
        )
        .expect("detect");
        assert_eq!(info.vendor, GpuVendor::Nvidia);
        assert_eq!(info.generation, 2070);
        assert!(!info.is_steam_deck);
    }

    #[test]
    fn test_detect_intel() {
        let info = detect(Some("Intel"), Some("Mesa Intel(R) UHD Graphics 630 (CFL GT2)"))
            .expect("detect");
        assert_eq!(info.vendor, GpuVendor::Intel);
        assert_eq!(info.generation, 0);
    }

    #[test]
    fn test_detect_amd_default() {
        let info = detect(Some("AMD"), Some("AMD Radeon RX 6800 XT (radeonsi)")).expect("detect");
        assert_eq!(info.vendor, GpuVendor::Amd);
    }

    #[test]
    fn test_detect_steam_deck() {
        let info = detect(Some("AMD"), Some("AMD Custom GPU 0405 (vangogh)")).expect("detect");
        assert_eq!(info.vendor, GpuVendor::Amd);
        assert!(info.is_steam_deck);
    }

    #[test]
    fn test_software_renderer_rejected() {
        let err = detect(Some("Mesa"), Some("llvmpipe (LLVM 15.0.7, 256 bits)"));
        assert!(matches!(err, Err(GlError::SoftwareRenderer(_))));
    }

    #[test]
    fn test_unknown_strings_default_to_amd() {
        let info = detect(None, None).expect("detect");
        assert_eq!(info.vendor, GpuVendor::Amd);
    }
}
