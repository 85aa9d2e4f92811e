//! Monitor enumeration.
//!
//! On X11 monitors come from XRandR, including the per-CRTC rotation and
//! the `CONNECTOR_ID` output property that ties an XRandR output to the DRM
//! connector the KMS broker reports. On Wayland the compositor does not
//! expose that mapping, so connectors are enumerated straight from the DRM
//! card; rotation is unknown there and the KMS capture path infers it from
//! the plane's source rectangle instead.

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};

use drm::control::{connector, Device as ControlDevice};
use drm::Device;
use tracing::{debug, warn};
use x11_dl::xlib::{Display, Xlib};
use x11_dl::xrandr::Xrandr;

use crate::error::{GlError, Result};

/// Monitor rotation in 90-degree steps, counter-clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    /// Rotation angle in radians for the conversion shader.
    pub fn radians(self) -> f32 {
        match self {
            Rotation::R0 => 0.0,
            Rotation::R90 => std::f32::consts::FRAC_PI_2,
            Rotation::R180 => std::f32::consts::PI,
            Rotation::R270 => 3.0 * std::f32::consts::FRAC_PI_2,
        }
    }

    /// Whether this rotation swaps width and height.
    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Rotation::R90 | Rotation::R270)
    }
}

/// One enumerated monitor.
#[derive(Debug, Clone)]
pub struct Monitor {
    /// Connector name ("DP-1", "HDMI-A-1", "eDP-1", ...).
    pub name: String,

    /// Logical position in the combined desktop space.
    pub position: (i32, i32),

    /// Logical size after rotation.
    pub size: (u32, u32),

    pub rotation: Rotation,

    /// DRM connector object id; stable across re-queries and usable to
    /// match the KMS broker's plane reports. 0 when unknown.
    pub connector_id: u32,
}

/// Enumerate monitors through XRandR.
pub fn enumerate_x11(xlib: &Xlib, display: *mut Display) -> Result<Vec<Monitor>> {
    let xrandr = Xrandr::open()
        .map_err(|e| GlError::MonitorEnumeration(format!("XRandR unavailable: {e}")))?;

    let mut monitors = Vec::new();
    // SAFETY: display is a live X11 connection; all XRandR resources
    // obtained here are freed before returning.
    unsafe {
        let screen = (xlib.XDefaultScreen)(display);
        let root = (xlib.XRootWindow)(display, screen);
        let resources = (xrandr.XRRGetScreenResourcesCurrent)(display, root);
        if resources.is_null() {
            return Err(GlError::MonitorEnumeration(
                "XRRGetScreenResourcesCurrent failed".into(),
            ));
        }

        let connector_id_atom = {
            let name = c"CONNECTOR_ID";
            (xlib.XInternAtom)(display, name.as_ptr(), 1)
        };

        for i in 0..(*resources).noutput {
            let output = *(*resources).outputs.add(i as usize);
            let output_info = (xrandr.XRRGetOutputInfo)(display, resources, output);
            if output_info.is_null() {
                continue;
            }

            // connection == RR_Connected (0) and an active CRTC.
            if (*output_info).connection != 0 || (*output_info).crtc == 0 {
                (xrandr.XRRFreeOutputInfo)(output_info);
                continue;
            }

            let crtc_info = (xrandr.XRRGetCrtcInfo)(display, resources, (*output_info).crtc);
            if crtc_info.is_null() {
                (xrandr.XRRFreeOutputInfo)(output_info);
                continue;
            }

            let name = {
                let bytes = std::slice::from_raw_parts(
                    (*output_info).name as *const u8,
                    (*output_info).nameLen.max(0) as usize,
                );
                String::from_utf8_lossy(bytes).into_owned()
            };

            let connector_id = if connector_id_atom != 0 {
                query_connector_id(xlib, &xrandr, display, output, connector_id_atom)
            } else {
                0
            };

            monitors.push(Monitor {
                name,
                position: ((*crtc_info).x, (*crtc_info).y),
                size: ((*crtc_info).width, (*crtc_info).height),
                rotation: rotation_from_randr((*crtc_info).rotation),
                connector_id,
            });

            (xrandr.XRRFreeCrtcInfo)(crtc_info);
            (xrandr.XRRFreeOutputInfo)(output_info);
        }
        (xrandr.XRRFreeScreenResources)(resources);
    }

    debug!("XRandR reported {} active monitor(s)", monitors.len());
    Ok(monitors)
}

/// Map XRandR rotation bits to [`Rotation`].
///
/// `RR_Rotate_0/90/180/270` are bits 1/2/4/8; reflection bits are ignored.
fn rotation_from_randr(rotation: u16) -> Rotation {
    if rotation & 0x2 != 0 {
        Rotation::R90
    } else if rotation & 0x4 != 0 {
        Rotation::R180
    } else if rotation & 0x8 != 0 {
        Rotation::R270
    } else {
        Rotation::R0
    }
}

unsafe fn query_connector_id(
    xlib: &Xlib,
    xrandr: &Xrandr,
    display: *mut Display,
    output: x11_dl::xrandr::RROutput,
    atom: x11_dl::xlib::Atom,
) -> u32 {
    let mut actual_type = 0;
    let mut actual_format = 0;
    let mut nitems = 0;
    let mut bytes_after = 0;
    let mut prop: *mut u8 = std::ptr::null_mut();
    // SAFETY (fn contract): display/output are live XRandR handles.
    let status = unsafe {
        (xrandr.XRRGetOutputProperty)(
            display,
            output,
            atom,
            0,
            4,
            0,
            0,
            0, // AnyPropertyType
            &mut actual_type,
            &mut actual_format,
            &mut nitems,
            &mut bytes_after,
            &mut prop,
        )
    };
    if status != 0 || prop.is_null() || nitems < 1 || actual_format != 32 {
        return 0;
    }
    // SAFETY: a 32-bit format property stores items as C longs.
    let id = unsafe { *(prop as *const libc::c_long) } as u32;
    // SAFETY: property data is freed with XFree.
    unsafe {
        (xlib.XFree)(prop.cast());
    }
    id
}

/// A DRM card node opened read-only for connector queries.
///
/// Plane access needs DRM master and lives in the privileged broker; plain
/// connector enumeration works for any user with render access.
struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

/// Enumerate monitors from DRM connectors (Wayland path).
pub fn enumerate_drm() -> Result<Vec<Monitor>> {
    let card = first_drm_card()?;
    let resources = card
        .resource_handles()
        .map_err(|e| GlError::MonitorEnumeration(format!("DRM resources: {e}")))?;

    // Connector names count per interface type, the same way the kernel
    // numbers them: the second DisplayPort is DP-2, regardless of gaps.
    let mut type_counts: Vec<(connector::Interface, u32)> = Vec::new();

    let mut monitors = Vec::new();
    for handle in resources.connectors() {
        let info = match card.get_connector(*handle, false) {
            Ok(info) => info,
            Err(e) => {
                warn!("Skipping DRM connector: {}", e);
                continue;
            }
        };

        let interface = info.interface();
        let index = {
            match type_counts.iter_mut().find(|(i, _)| *i == interface) {
                Some((_, count)) => {
                    *count += 1;
                    *count
                }
                None => {
                    type_counts.push((interface, 1));
                    1
                }
            }
        };

        if info.state() != connector::State::Connected {
            continue;
        }

        let size = current_mode_size(&card, &info).unwrap_or((0, 0));
        monitors.push(Monitor {
            name: format!("{}-{}", interface_name(interface), index),
            // DRM has no global desktop layout; positions come from the
            // compositor which we cannot ask from here.
            position: (0, 0),
            size,
            rotation: Rotation::R0,
            connector_id: u32::from(*handle),
        });
    }

    debug!("DRM reported {} connected monitor(s)", monitors.len());
    Ok(monitors)
}

fn first_drm_card() -> Result<Card> {
    for i in 0..10 {
        let path = format!("/dev/dri/card{i}");
        if let Ok(file) = File::options().read(true).write(true).open(&path) {
            return Ok(Card(file));
        }
        // Connector queries work read-only too.
        if let Ok(file) = File::open(&path) {
            return Ok(Card(file));
        }
    }
    Err(GlError::MonitorEnumeration("no /dev/dri/card* node".into()))
}

fn current_mode_size(card: &Card, info: &connector::Info) -> Option<(u32, u32)> {
    let encoder = info.current_encoder()?;
    let encoder_info = card.get_encoder(encoder).ok()?;
    let crtc = encoder_info.crtc()?;
    let crtc_info = card.get_crtc(crtc).ok()?;
    let mode = crtc_info.mode()?;
    let (w, h) = mode.size();
    Some((u32::from(w), u32::from(h)))
}

fn interface_name(interface: connector::Interface) -> &'static str {
    use connector::Interface;
    match interface {
        Interface::HDMIA => "HDMI-A",
        Interface::HDMIB => "HDMI-B",
        Interface::DisplayPort => "DP",
        Interface::EmbeddedDisplayPort => "eDP",
        Interface::DVII => "DVI-I",
        Interface::DVID => "DVI-D",
        Interface::DVIA => "DVI-A",
        Interface::LVDS => "LVDS",
        Interface::VGA => "VGA",
        Interface::DSI => "DSI",
        Interface::DPI => "DPI",
        Interface::Virtual => "Virtual",
        Interface::Composite => "Composite",
        Interface::SVideo => "SVIDEO",
        Interface::Component => "Component",
        Interface::NinePinDIN => "DIN",
        Interface::TV => "TV",
        Interface::Writeback => "Writeback",
        Interface::SPI => "SPI",
        Interface::USB => "USB",
        Interface::Unknown => "Unknown",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_from_randr_bits() {
        assert_eq!(rotation_from_randr(0x1), Rotation::R0);
        assert_eq!(rotation_from_randr(0x2), Rotation::R90);
        assert_eq!(rotation_from_randr(0x4), Rotation::R180);
        assert_eq!(rotation_from_randr(0x8), Rotation::R270);
        // Reflection bits alone mean unrotated.
        assert_eq!(rotation_from_randr(0x10), Rotation::R0);
    }

    #[test]
    fn test_rotation_radians_and_swap() {
        assert_eq!(Rotation::R0.radians(), 0.0);
        assert!(Rotation::R90.swaps_dimensions());
        assert!(Rotation::R270.swaps_dimensions());
        assert!(!Rotation::R180.swaps_dimensions());
        assert!((Rotation::R180.radians() - std::f32::consts::PI).abs() < f32::EPSILON);
    }

    #[test]
    fn test_interface_names() {
        assert_eq!(interface_name(connector::Interface::DisplayPort), "DP");
        assert_eq!(interface_name(connector::Interface::HDMIA), "HDMI-A");
        assert_eq!(interface_name(connector::Interface::EmbeddedDisplayPort), "eDP");
    }
}
