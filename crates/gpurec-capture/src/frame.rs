//! Captured-frame description and DMA-BUF plane ownership.
//!
//! Every plane FD is a move-only [`DmaBufPlane`]: opened exactly once by
//! whoever produced it (broker, PipeWire, VAAPI export) and closed exactly
//! once when the plane drops. Hand-offs between components are explicit
//! moves, so a double close cannot compile and a leak shows up as an FD
//! that outlives its frame.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use gpurec_color::SourceColor;
use gpurec_gl::Rotation;
use gpurec_kms::HdrOutputMetadata;

/// One DMA-BUF plane of a captured frame.
#[derive(Debug)]
pub struct DmaBufPlane {
    /// Owned descriptor; closed on drop.
    pub fd: OwnedFd,

    /// Byte offset of this plane inside the buffer object.
    pub offset: u32,

    /// Row pitch in bytes.
    pub pitch: u32,
}

impl DmaBufPlane {
    pub fn new(fd: OwnedFd, offset: u32, pitch: u32) -> Self {
        Self { fd, offset, pitch }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn borrowed_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Cursor rectangle supplied out-of-band by a capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Description of one captured frame.
///
/// Owns its plane FDs. The capture backend builds a descriptor per frame
/// and transfers it to the EGL import step, which consumes the planes and
/// closes them once the image exists.
#[derive(Debug)]
pub struct FrameDescriptor {
    pub width: u32,
    pub height: u32,

    /// DRM FourCC of the pixel format.
    pub fourcc: u32,

    /// DRM format modifier; [`gpurec_kms::FORMAT_MOD_INVALID`] when the
    /// producer did not specify one.
    pub modifier: u64,

    pub rotation: Rotation,
    pub source_color: SourceColor,

    /// Up to four planes, in layout order.
    pub planes: Vec<DmaBufPlane>,

    /// Cursor sub-rectangle when the source reports the cursor inline.
    pub cursor: Option<CursorRect>,

    /// HDR10 metadata when the source carries it.
    pub hdr: Option<HdrOutputMetadata>,
}

impl FrameDescriptor {
    /// Transfer plane ownership out of the descriptor.
    ///
    /// After this the descriptor describes geometry only; dropping it does
    /// not touch the FDs.
    pub fn take_planes(&mut self) -> Vec<DmaBufPlane> {
        std::mem::take(&mut self.planes)
    }

    /// Whether the producer attached an explicit format modifier.
    pub fn has_modifier(&self) -> bool {
        self.modifier != gpurec_kms::FORMAT_MOD_INVALID
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    fn pipe_fd() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        // SAFETY: pipe2 fills the array on success.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        // SAFETY: both fds were just created and are owned here.
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn fd_is_open(fd: RawFd) -> bool {
        // SAFETY: fcntl F_GETFD on an arbitrary fd is harmless.
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    fn descriptor_with(planes: Vec<DmaBufPlane>) -> FrameDescriptor {
        FrameDescriptor {
            width: 1920,
            height: 1080,
            fourcc: 0x3432_5258,
            modifier: gpurec_kms::FORMAT_MOD_INVALID,
            rotation: Rotation::R0,
            source_color: SourceColor::Rgb,
            planes,
            cursor: None,
            hdr: None,
        }
    }

    #[test]
    fn test_plane_fd_closed_exactly_once_on_drop() {
        let (read_end, _write_end) = pipe_fd();
        let raw = read_end.as_raw_fd();
        let descriptor = descriptor_with(vec![DmaBufPlane::new(read_end, 0, 7680)]);

        assert!(fd_is_open(raw));
        drop(descriptor);
        assert!(!fd_is_open(raw));
    }

    #[test]
    fn test_take_planes_transfers_ownership() {
        let (read_end, _write_end) = pipe_fd();
        let raw = read_end.as_raw_fd();
        let mut descriptor = descriptor_with(vec![DmaBufPlane::new(read_end, 0, 7680)]);

        let planes = descriptor.take_planes();
        assert_eq!(planes.len(), 1);
        assert!(descriptor.planes.is_empty());

        // Dropping the emptied descriptor must not close the fd.
        drop(descriptor);
        assert!(fd_is_open(raw));

        drop(planes);
        assert!(!fd_is_open(raw));
    }

    #[test]
    fn test_has_modifier() {
        let descriptor = descriptor_with(Vec::new());
        assert!(!descriptor.has_modifier());

        let mut with_modifier = descriptor_with(Vec::new());
        with_modifier.modifier = 0x0100_0000_0000_0002;
        assert!(with_modifier.has_modifier());
    }
}
