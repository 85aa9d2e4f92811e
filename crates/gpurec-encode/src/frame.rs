//! Frame and packet types crossing the encoder boundary.

use std::sync::Arc;

use gpurec_color::DestinationColor;

/// The encoder's input frame, created by an adapter's `start`.
///
/// The storage variant tells the external encoder how to reach the pixels:
///
/// - `Vaapi`: reference the surface directly, zero copy.
/// - `Cuda`: the encoder owns driver-allocated input buffers; it fills in
///   the device pointers/pitches once at configure time and the adapter's
///   `copy_textures_to_frame` copies into them each frame.
/// - `Cpu`: the adapter owns pitch-aligned buffers it reads GL textures
///   back into; the encoder consumes them in place.
#[derive(Debug)]
pub struct EncodeFrame {
    pub width: i32,
    pub height: i32,
    pub destination: DestinationColor,
    pub storage: FrameStorage,
}

/// Backing storage of an [`EncodeFrame`].
#[derive(Debug)]
pub enum FrameStorage {
    /// CPU-side planes (software encoder).
    Cpu { planes: [CpuPlane; 2] },

    /// CUDA device pointers into the encoder's input surface
    /// (NVENC-native NV12/P010 layout). Zero until the encoder configures
    /// the frame.
    Cuda {
        device_ptrs: [u64; 2],
        pitches: [usize; 2],
    },

    /// A VAAPI surface owned by the adapter; the encoder references it.
    Vaapi { surface_id: u32 },
}

/// One CPU plane with its row pitch.
#[derive(Debug, Default)]
pub struct CpuPlane {
    pub data: Vec<u8>,
    pub pitch: usize,
}

/// An encoded packet leaving the encoder.
///
/// Reference-counted so the replay ring and the direct sink can share one
/// payload without copies; ownership of the handle passes from the encoder
/// to the sink.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub stream_index: usize,
    pub pts: i64,
    pub dts: i64,
    pub keyframe: bool,
    pub data: Arc<[u8]>,
}

impl EncodedPacket {
    pub fn new(stream_index: usize, pts: i64, keyframe: bool, data: Vec<u8>) -> Self {
        Self {
            stream_index,
            pts,
            dts: pts,
            keyframe,
            data: data.into(),
        }
    }

    /// Deep copy the payload (replay ring entries outlive encoder buffer
    /// reuse).
    pub fn deep_copy(&self) -> Self {
        Self {
            stream_index: self.stream_index,
            pts: self.pts,
            dts: self.dts,
            keyframe: self.keyframe,
            data: self.data.to_vec().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_deep_copy_is_independent() {
        let packet = EncodedPacket::new(0, 42, true, vec![1, 2, 3]);
        let copy = packet.deep_copy();
        assert_eq!(copy.pts, 42);
        assert!(copy.keyframe);
        assert_eq!(&*copy.data, &[1, 2, 3]);
        assert!(!Arc::ptr_eq(&packet.data, &copy.data));
    }

    #[test]
    fn test_packet_dts_defaults_to_pts() {
        let packet = EncodedPacket::new(1, 99, false, Vec::new());
        assert_eq!(packet.dts, 99);
        assert_eq!(packet.stream_index, 1);
    }
}
