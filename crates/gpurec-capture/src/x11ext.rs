//! Runtime-loaded X11 extension entry points.
//!
//! XComposite, XDamage and XFixes are loaded with `dlopen` semantics like
//! the rest of the vendor stack. Only the handful of calls the backends
//! use are declared.

use std::os::raw::{c_char, c_int, c_long, c_short, c_ulong, c_ushort};

use libloading::Library;
use tracing::debug;
use x11_dl::xlib::{Display, XRectangle};

use crate::error::{CaptureError, Result};

pub type XId = c_ulong;
pub type Window = XId;
pub type Pixmap = XId;
pub type Damage = XId;

pub const COMPOSITE_REDIRECT_AUTOMATIC: c_int = 0;

/// XDamageReportNonEmpty: one event per damage region transition.
pub const DAMAGE_REPORT_NON_EMPTY: c_int = 3;

/// Offset of DamageNotify from the extension's event base.
pub const DAMAGE_NOTIFY: c_int = 0;

/// `XDamageNotifyEvent` from Xdamage.h.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XDamageNotifyEvent {
    pub type_: c_int,
    pub serial: c_ulong,
    pub send_event: c_int,
    pub display: *mut Display,
    pub drawable: XId,
    pub damage: Damage,
    pub level: c_int,
    pub more: c_int,
    pub timestamp: c_ulong,
    pub area: XRectangle,
    pub geometry: XRectangle,
}

/// `XFixesCursorImage` from Xfixes.h.
#[repr(C)]
pub struct XFixesCursorImage {
    pub x: c_short,
    pub y: c_short,
    pub width: c_ushort,
    pub height: c_ushort,
    pub xhot: c_ushort,
    pub yhot: c_ushort,
    pub cursor_serial: c_ulong,
    /// ARGB pixels, one per `c_ulong` (32 significant bits).
    pub pixels: *mut c_ulong,
    pub atom: c_ulong,
    pub name: *const c_char,
}

type FnQueryExtension = unsafe extern "C" fn(*mut Display, *mut c_int, *mut c_int) -> c_int;

struct CompositeFns {
    query_extension: FnQueryExtension,
    redirect_window: unsafe extern "C" fn(*mut Display, Window, c_int),
    unredirect_window: unsafe extern "C" fn(*mut Display, Window, c_int),
    name_window_pixmap: unsafe extern "C" fn(*mut Display, Window) -> Pixmap,
}

struct DamageFns {
    query_extension: FnQueryExtension,
    create: unsafe extern "C" fn(*mut Display, XId, c_int) -> Damage,
    destroy: unsafe extern "C" fn(*mut Display, Damage),
    subtract: unsafe extern "C" fn(*mut Display, Damage, XId, XId),
}

struct FixesFns {
    query_extension: FnQueryExtension,
    get_cursor_image: unsafe extern "C" fn(*mut Display) -> *mut XFixesCursorImage,
}

macro_rules! x11_sym {
    ($lib:expr, $libname:literal, $name:literal) => {{
        // SAFETY: symbol types match the extension headers.
        unsafe {
            $lib.get($name.as_bytes()).map(|s| *s).map_err(|_| {
                CaptureError::Config(format!(concat!($libname, " lacks ", $name)))
            })?
        }
    }};
}

fn open(name: &'static str, candidates: &[&str]) -> Result<Library> {
    for candidate in candidates {
        // SAFETY: loading a system X11 extension library.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            debug!("Loaded {} from {}", name, candidate);
            return Ok(lib);
        }
    }
    Err(CaptureError::Config(format!("{name} not found")))
}

/// XComposite, loaded once per backend that needs it.
pub struct XComposite {
    _lib: Library,
    fns: CompositeFns,
}

impl XComposite {
    pub fn load(display: *mut Display) -> Result<Self> {
        let lib = open("libXcomposite", &["libXcomposite.so.1", "libXcomposite.so"])?;
        let fns = CompositeFns {
            query_extension: x11_sym!(lib, "libXcomposite", "XCompositeQueryExtension"),
            redirect_window: x11_sym!(lib, "libXcomposite", "XCompositeRedirectWindow"),
            unredirect_window: x11_sym!(lib, "libXcomposite", "XCompositeUnredirectWindow"),
            name_window_pixmap: x11_sym!(lib, "libXcomposite", "XCompositeNameWindowPixmap"),
        };
        let (mut event_base, mut error_base) = (0, 0);
        // SAFETY: display is live; out-params are local.
        if unsafe { (fns.query_extension)(display, &mut event_base, &mut error_base) } == 0 {
            return Err(CaptureError::Capability(
                "X server lacks the Composite extension".into(),
            ));
        }
        Ok(Self { _lib: lib, fns })
    }

    pub fn redirect_window(&self, display: *mut Display, window: Window) {
        // SAFETY: valid display/window; automatic redirection is idempotent.
        unsafe { (self.fns.redirect_window)(display, window, COMPOSITE_REDIRECT_AUTOMATIC) };
    }

    pub fn unredirect_window(&self, display: *mut Display, window: Window) {
        // SAFETY: as above.
        unsafe { (self.fns.unredirect_window)(display, window, COMPOSITE_REDIRECT_AUTOMATIC) };
    }

    pub fn name_window_pixmap(&self, display: *mut Display, window: Window) -> Pixmap {
        // SAFETY: valid display/window; 0 return means failure.
        unsafe { (self.fns.name_window_pixmap)(display, window) }
    }
}

/// XDamage, with its event base resolved.
pub struct XDamage {
    _lib: Library,
    fns: DamageFns,
    event_base: c_int,
}

impl XDamage {
    pub fn load(display: *mut Display) -> Result<Self> {
        let lib = open("libXdamage", &["libXdamage.so.1", "libXdamage.so"])?;
        let fns = DamageFns {
            query_extension: x11_sym!(lib, "libXdamage", "XDamageQueryExtension"),
            create: x11_sym!(lib, "libXdamage", "XDamageCreate"),
            destroy: x11_sym!(lib, "libXdamage", "XDamageDestroy"),
            subtract: x11_sym!(lib, "libXdamage", "XDamageSubtract"),
        };
        let (mut event_base, mut error_base) = (0, 0);
        // SAFETY: display is live; out-params are local.
        if unsafe { (fns.query_extension)(display, &mut event_base, &mut error_base) } == 0 {
            return Err(CaptureError::Capability(
                "X server lacks the Damage extension".into(),
            ));
        }
        Ok(Self {
            _lib: lib,
            fns,
            event_base,
        })
    }

    /// The event code DamageNotify arrives as on this server.
    pub fn notify_event(&self) -> c_int {
        self.event_base + DAMAGE_NOTIFY
    }

    pub fn create(&self, display: *mut Display, drawable: XId) -> Damage {
        // SAFETY: valid display/drawable.
        unsafe { (self.fns.create)(display, drawable, DAMAGE_REPORT_NON_EMPTY) }
    }

    pub fn destroy(&self, display: *mut Display, damage: Damage) {
        if damage == 0 {
            return;
        }
        // SAFETY: damage came from create on this display.
        unsafe { (self.fns.destroy)(display, damage) };
    }

    /// Acknowledge all accumulated damage.
    pub fn subtract_all(&self, display: *mut Display, damage: Damage) {
        // SAFETY: None/None subtracts everything.
        unsafe { (self.fns.subtract)(display, damage, 0, 0) };
    }
}

/// XFixes cursor access.
pub struct XFixes {
    _lib: Library,
    fns: FixesFns,
}

/// A fetched cursor image, converted out of the server's `c_ulong` pixel
/// packing into plain RGBA bytes.
pub struct CursorImage {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub hot_x: i32,
    pub hot_y: i32,
    pub serial: u64,
    /// RGBA, premultiplied alpha as the server delivers it.
    pub pixels: Vec<u8>,
}

impl XFixes {
    pub fn load(display: *mut Display) -> Result<Self> {
        let lib = open("libXfixes", &["libXfixes.so.3", "libXfixes.so"])?;
        let fns = FixesFns {
            query_extension: x11_sym!(lib, "libXfixes", "XFixesQueryExtension"),
            get_cursor_image: x11_sym!(lib, "libXfixes", "XFixesGetCursorImage"),
        };
        let (mut event_base, mut error_base) = (0, 0);
        // SAFETY: display is live; out-params are local.
        if unsafe { (fns.query_extension)(display, &mut event_base, &mut error_base) } == 0 {
            return Err(CaptureError::Capability(
                "X server lacks the XFixes extension".into(),
            ));
        }
        Ok(Self { _lib: lib, fns })
    }

    /// Fetch the current cursor image. Returns `None` when the server has
    /// no cursor to report (rare, but happens during VT switches).
    pub fn cursor_image(&self, display: *mut Display, xlib: &x11_dl::xlib::Xlib) -> Option<CursorImage> {
        // SAFETY: display is live; the returned struct is freed with XFree.
        unsafe {
            let raw = (self.fns.get_cursor_image)(display);
            if raw.is_null() {
                return None;
            }
            let image = &*raw;
            let count = image.width as usize * image.height as usize;
            let mut pixels = Vec::with_capacity(count * 4);
            for i in 0..count {
                // Each pixel is ARGB in the low 32 bits of a c_ulong.
                let argb = *image.pixels.add(i) as u32;
                pixels.push(((argb >> 16) & 0xFF) as u8);
                pixels.push(((argb >> 8) & 0xFF) as u8);
                pixels.push((argb & 0xFF) as u8);
                pixels.push(((argb >> 24) & 0xFF) as u8);
            }
            let converted = CursorImage {
                x: (image.x - image.xhot as c_short) as i32,
                y: (image.y - image.yhot as c_short) as i32,
                width: image.width as u32,
                height: image.height as u32,
                hot_x: image.xhot as i32,
                hot_y: image.yhot as i32,
                serial: image.cursor_serial as u64,
                pixels,
            };
            (xlib.XFree)((raw as *mut c_long).cast());
            Some(converted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_damage_event_struct_has_fixed_prefix() {
        // The first five fields must match XAnyEvent so the generic event
        // dispatch can look at type_ before casting.
        assert_eq!(std::mem::offset_of!(XDamageNotifyEvent, type_), 0);
        assert!(std::mem::offset_of!(XDamageNotifyEvent, drawable) > 0);
    }
}
