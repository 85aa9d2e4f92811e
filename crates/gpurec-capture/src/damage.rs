//! Damage tracking: "has the chosen region changed since last clear".
//!
//! Consolidates XDamage events, XRandR geometry changes and cursor motion
//! into one boolean the pacer reads before deciding to capture. A damage
//! rectangle only raises the flag when it intersects the target (monitor
//! region or window); cursor movement only when the cursor intersects the
//! target.
//!
//! When no damage subsystem is available (Wayland without a backend that
//! reports damage hints) the tracker is simply absent and the pacer treats
//! every tick as damaged, degrading gracefully to full-rate capture.

use std::rc::Rc;

use gpurec_gl::monitor::enumerate_x11;
use gpurec_gl::GlRuntime;
use tracing::{debug, warn};
use x11_dl::xlib::XEvent;
use x11_dl::xrandr::Xrandr;

use crate::error::Result;
use crate::x11ext::{Damage, XDamage, XDamageNotifyEvent};

/// Axis-aligned rectangle in root coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether two rectangles overlap (zero-area rects never do).
    pub fn intersects(&self, other: &Rect) -> bool {
        if self.width == 0 || self.height == 0 || other.width == 0 || other.height == 0 {
            return false;
        }
        self.x < other.x + other.width as i32
            && self.x + self.width as i32 > other.x
            && self.y < other.y + other.height as i32
            && self.y + self.height as i32 > other.y
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x
            && x < self.x + self.width as i32
            && y >= self.y
            && y < self.y + self.height as i32
    }
}

/// What damage is filtered against.
#[derive(Debug, Clone)]
enum Target {
    /// Everything counts.
    Any,
    /// A monitor region on the root window, re-resolved by name on
    /// XRandR changes.
    Monitor { name: String, rect: Rect },
    /// A specific window.
    Window(u64),
}

/// X11 damage tracker. See the module docs.
pub struct DamageTracker {
    runtime: Rc<GlRuntime>,
    xdamage: XDamage,
    damage_handle: Damage,
    damaged_drawable: u64,
    xrandr_event_base: i32,
    target: Target,
    track_cursor: bool,
    last_cursor_pos: (i32, i32),
    cursor_size_hint: (u32, u32),
    damaged: bool,
}

impl DamageTracker {
    /// Create the tracker on the runtime's X11 connection.
    pub fn new(runtime: Rc<GlRuntime>, track_cursor: bool) -> Result<Self> {
        let display = runtime.x11_display();
        let xdamage = XDamage::load(display)?;

        // XRandR events keep the monitor target geometry valid across
        // rotations and mode changes.
        let xrandr_event_base = {
            let xrandr = Xrandr::open().ok();
            let xlib = runtime.x11();
            match (xrandr, xlib) {
                (Some(xrandr), Some(xlib)) => {
                    let (mut event_base, mut error_base) = (0, 0);
                    // SAFETY: live display; out-params local.
                    unsafe {
                        if (xrandr.XRRQueryExtension)(display, &mut event_base, &mut error_base)
                            != 0
                        {
                            let root = (xlib.XDefaultRootWindow)(display);
                            // RRScreenChangeNotifyMask | RRCrtcChangeNotifyMask
                            // | RROutputChangeNotifyMask
                            (xrandr.XRRSelectInput)(display, root, 1 | 2 | 4);
                            event_base
                        } else {
                            -1
                        }
                    }
                }
                _ => -1,
            }
        };

        Ok(Self {
            runtime,
            xdamage,
            damage_handle: 0,
            damaged_drawable: 0,
            xrandr_event_base,
            target: Target::Any,
            track_cursor,
            last_cursor_pos: (0, 0),
            cursor_size_hint: (24, 24),
            damaged: false,
        })
    }

    /// Track a monitor region by connector name.
    pub fn set_target_monitor(&mut self, name: &str) {
        let rect = self.resolve_monitor_rect(name).unwrap_or_default();
        debug!("Damage target: monitor {} {:?}", name, rect);
        self.target = Target::Monitor {
            name: name.to_string(),
            rect,
        };
        let root = self.root_window();
        self.attach_damage(root);
    }

    /// Track a specific window. Re-targeting to the same id is a no-op so
    /// callers can set it every round.
    pub fn set_target_window(&mut self, window: u64) {
        if matches!(&self.target, Target::Window(current) if *current == window) {
            return;
        }
        debug!("Damage target: window {:#x}", window);
        self.target = Target::Window(window);
        self.attach_damage(window);
    }

    /// Dispatch one X event into the tracker.
    pub fn on_event(&mut self, event: &XEvent) {
        // SAFETY: reading the type tag of an XEvent union is always valid.
        let event_type = unsafe { event.type_ };

        if event_type == self.xdamage.notify_event() {
            // SAFETY: the type tag says this is a DamageNotify event.
            let damage_event = unsafe { &*(event as *const XEvent).cast::<XDamageNotifyEvent>() };
            self.on_damage_notify(damage_event);
            return;
        }

        // RRNotify = event base + 1; RRScreenChangeNotify = event base.
        if self.xrandr_event_base >= 0
            && (event_type == self.xrandr_event_base || event_type == self.xrandr_event_base + 1)
        {
            self.refresh_target_geometry();
        }
    }

    /// Poll-driven work: cursor motion detection.
    pub fn tick(&mut self) {
        if !self.track_cursor {
            return;
        }
        let Some(xlib) = self.runtime.x11() else {
            return;
        };
        let display = self.runtime.x11_display();
        // SAFETY: standard pointer query on a live display.
        let pos = unsafe {
            let root = (xlib.XDefaultRootWindow)(display);
            let (mut root_ret, mut child_ret) = (0, 0);
            let (mut root_x, mut root_y, mut win_x, mut win_y) = (0, 0, 0, 0);
            let mut mask = 0;
            if (xlib.XQueryPointer)(
                display,
                root,
                &mut root_ret,
                &mut child_ret,
                &mut root_x,
                &mut root_y,
                &mut win_x,
                &mut win_y,
                &mut mask,
            ) == 0
            {
                return;
            }
            (root_x, root_y)
        };

        if pos != self.last_cursor_pos {
            self.last_cursor_pos = pos;
            let cursor_rect = Rect::new(
                pos.0,
                pos.1,
                self.cursor_size_hint.0,
                self.cursor_size_hint.1,
            );
            match &self.target {
                Target::Monitor { rect, .. } => {
                    if cursor_rect.intersects(rect) {
                        self.damaged = true;
                    }
                }
                // For window targets the cursor position is in root space
                // and the window rect is unknown here; motion counts.
                Target::Window(_) | Target::Any => self.damaged = true,
            }
        }
    }

    /// Whether the target has changed since the last [`DamageTracker::clear`].
    pub fn is_damaged(&self) -> bool {
        self.damaged
    }

    pub fn clear(&mut self) {
        self.damaged = false;
    }

    fn on_damage_notify(&mut self, event: &XDamageNotifyEvent) {
        if event.damage != self.damage_handle {
            return;
        }
        // Acknowledge everything; we only keep a boolean.
        self.xdamage
            .subtract_all(self.runtime.x11_display(), self.damage_handle);

        let damage_rect = Rect::new(
            event.geometry.x as i32 + event.area.x as i32,
            event.geometry.y as i32 + event.area.y as i32,
            event.area.width as u32,
            event.area.height as u32,
        );
        let relevant = match &self.target {
            Target::Monitor { rect, .. } => damage_rect.intersects(rect),
            Target::Window(_) | Target::Any => true,
        };
        if relevant {
            self.damaged = true;
        }
    }

    fn refresh_target_geometry(&mut self) {
        if let Target::Monitor { name, .. } = &self.target {
            let name = name.clone();
            if let Some(rect) = self.resolve_monitor_rect(&name) {
                debug!("Damage target {} geometry now {:?}", name, rect);
                self.target = Target::Monitor { name, rect };
            }
        }
        // Geometry changed under us; force a capture.
        self.damaged = true;
    }

    fn resolve_monitor_rect(&self, name: &str) -> Option<Rect> {
        let xlib = self.runtime.x11()?;
        match enumerate_x11(xlib, self.runtime.x11_display()) {
            Ok(monitors) => monitors
                .into_iter()
                .find(|m| m.name == name)
                .map(|m| Rect::new(m.position.0, m.position.1, m.size.0, m.size.1)),
            Err(e) => {
                warn!("Monitor re-query failed: {}", e);
                None
            }
        }
    }

    fn root_window(&self) -> u64 {
        match self.runtime.x11() {
            // SAFETY: live display.
            Some(xlib) => unsafe { (xlib.XDefaultRootWindow)(self.runtime.x11_display()) },
            None => 0,
        }
    }

    fn attach_damage(&mut self, drawable: u64) {
        let display = self.runtime.x11_display();
        if self.damage_handle != 0 && self.damaged_drawable != drawable {
            self.xdamage.destroy(display, self.damage_handle);
            self.damage_handle = 0;
        }
        if self.damage_handle == 0 && drawable != 0 {
            self.damage_handle = self.xdamage.create(display, drawable);
            self.damaged_drawable = drawable;
            // Everything is stale right after attaching.
            self.damaged = true;
        }
    }
}

impl Drop for DamageTracker {
    fn drop(&mut self) {
        self.xdamage
            .destroy(self.runtime.x11_display(), self.damage_handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_intersection() {
        let monitor = Rect::new(1920, 0, 1920, 1080);

        assert!(Rect::new(2000, 100, 50, 50).intersects(&monitor));
        assert!(!Rect::new(0, 0, 1920, 1080).intersects(&monitor));
        // Touching edges do not intersect.
        assert!(!Rect::new(0, 0, 1920, 1080).intersects(&Rect::new(1920, 0, 10, 10)));
        // Zero-area never intersects.
        assert!(!Rect::new(2000, 100, 0, 10).intersects(&monitor));
    }

    #[test]
    fn test_rect_contains_point() {
        let rect = Rect::new(10, 10, 100, 100);
        assert!(rect.contains_point(10, 10));
        assert!(rect.contains_point(109, 109));
        assert!(!rect.contains_point(110, 110));
        assert!(!rect.contains_point(9, 50));
    }
}
