//! The fixed, versioned broker wire protocol.
//!
//! Both sides of the socketpair exchange fixed-size little-endian messages;
//! DMA-BUF file descriptors ride alongside as `SCM_RIGHTS` ancillary data,
//! in item order. The version field is checked on every message: a mismatch
//! means a stale helper binary, and the message is dropped by whoever
//! notices.
//!
//! Layout is packed explicitly field by field rather than cast from a
//! `#[repr(C)]` struct, so the wire format cannot drift with compiler
//! padding decisions.

use std::os::fd::OwnedFd;

use crate::error::{KmsError, Result};

/// Protocol version exchanged in every message.
pub const PROTOCOL_VERSION: u32 = 4;

/// Maximum plane items per response.
pub const MAX_ITEMS: usize = 8;

/// Maximum DMA-BUF planes per item.
pub const MAX_DMA_BUFS: usize = 4;

/// Fixed error message field size.
pub const ERR_MSG_SIZE: usize = 128;

/// Request wire size: version + type + new-fd marker.
pub const REQUEST_SIZE: usize = 12;

/// Per-item wire size. See [`ResponseItem::encode_into`].
pub const ITEM_SIZE: usize = 112;

/// Response wire size: header + err msg + item count + items.
pub const RESPONSE_SIZE: usize = 4 + 4 + ERR_MSG_SIZE + 4 + MAX_ITEMS * ITEM_SIZE;

/// Request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// Replace the current connection with the FD in the ancillary data.
    /// Sent once right after the handshake so that all further traffic runs
    /// over the socketpair that dies with the parent.
    ReplaceConnection = 0,

    /// Ask for the current scanout planes.
    GetKms = 1,
}

impl RequestType {
    fn from_wire(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::ReplaceConnection),
            1 => Ok(Self::GetKms),
            other => Err(KmsError::MalformedMessage(format!(
                "unknown request type {other}"
            ))),
        }
    }
}

/// Result codes in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseResult {
    Ok = 0,
    InvalidRequest = 1,
    FailedToGetPlane = 2,
    FailedToGetPlanes = 3,
    FailedToSend = 4,
}

impl ResponseResult {
    fn from_wire(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::InvalidRequest),
            2 => Ok(Self::FailedToGetPlane),
            3 => Ok(Self::FailedToGetPlanes),
            4 => Ok(Self::FailedToSend),
            other => Err(KmsError::MalformedMessage(format!(
                "unknown result code {other}"
            ))),
        }
    }
}

/// A request message.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub version: u32,
    pub kind: RequestType,

    /// 1 when an FD accompanies this request (`ReplaceConnection`), else 0.
    pub carries_fd: bool,
}

impl Request {
    pub fn new(kind: RequestType) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            carries_fd: kind == RequestType::ReplaceConnection,
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let mut buf = [0u8; REQUEST_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..8].copy_from_slice(&(self.kind as i32).to_le_bytes());
        buf[8..12].copy_from_slice(&i32::from(self.carries_fd).to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < REQUEST_SIZE {
            return Err(KmsError::MalformedMessage(format!(
                "short request: {} bytes",
                buf.len()
            )));
        }
        let version = u32::from_le_bytes(read4(buf, 0));
        let kind = RequestType::from_wire(i32::from_le_bytes(read4(buf, 4)))?;
        let carries_fd = i32::from_le_bytes(read4(buf, 8)) != 0;
        Ok(Self {
            version,
            kind,
            carries_fd,
        })
    }
}

/// HDR10 static metadata carried with a plane, matching the kernel's
/// `hdr_output_metadata` infoframe payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HdrOutputMetadata {
    pub metadata_type: u32,
    pub eotf: u8,
    pub static_metadata_descriptor_id: u8,

    /// CIE 1931 chromaticity of the three display primaries, in 0.00002
    /// units.
    pub display_primaries: [(u16, u16); 3],
    pub white_point: (u16, u16),

    /// Mastering luminance in 1 cd/m2 (max) and 0.0001 cd/m2 (min) units.
    pub max_display_mastering_luminance: u16,
    pub min_display_mastering_luminance: u16,

    pub max_content_light_level: u16,
    pub max_frame_average_light_level: u16,
}

const HDR_SIZE: usize = 32;

impl HdrOutputMetadata {
    fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.metadata_type.to_le_bytes());
        buf[4] = self.eotf;
        buf[5] = self.static_metadata_descriptor_id;
        let mut off = 6;
        for (x, y) in self.display_primaries {
            buf[off..off + 2].copy_from_slice(&x.to_le_bytes());
            buf[off + 2..off + 4].copy_from_slice(&y.to_le_bytes());
            off += 4;
        }
        buf[off..off + 2].copy_from_slice(&self.white_point.0.to_le_bytes());
        buf[off + 2..off + 4].copy_from_slice(&self.white_point.1.to_le_bytes());
        off += 4;
        for v in [
            self.max_display_mastering_luminance,
            self.min_display_mastering_luminance,
            self.max_content_light_level,
            self.max_frame_average_light_level,
        ] {
            buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
            off += 2;
        }
        // remaining bytes up to HDR_SIZE stay zero
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut primaries = [(0u16, 0u16); 3];
        let mut off = 6;
        for p in &mut primaries {
            *p = (
                u16::from_le_bytes(read2(buf, off)),
                u16::from_le_bytes(read2(buf, off + 2)),
            );
            off += 4;
        }
        let white_point = (
            u16::from_le_bytes(read2(buf, off)),
            u16::from_le_bytes(read2(buf, off + 2)),
        );
        off += 4;
        let max_dml = u16::from_le_bytes(read2(buf, off));
        let min_dml = u16::from_le_bytes(read2(buf, off + 2));
        let max_cll = u16::from_le_bytes(read2(buf, off + 4));
        let max_fall = u16::from_le_bytes(read2(buf, off + 6));
        Self {
            metadata_type: u32::from_le_bytes(read4(buf, 0)),
            eotf: buf[4],
            static_metadata_descriptor_id: buf[5],
            display_primaries: primaries,
            white_point,
            max_display_mastering_luminance: max_dml,
            min_display_mastering_luminance: min_dml,
            max_content_light_level: max_cll,
            max_frame_average_light_level: max_fall,
        }
    }
}

/// One DMA-BUF plane in a response item.
///
/// The FD travels as ancillary data; it is `None` in a freshly decoded
/// message until the transport attaches the received FDs in order.
#[derive(Debug)]
pub struct DmaBuf {
    pub fd: Option<OwnedFd>,
    pub pitch: u32,
    pub offset: u32,
}

/// One plane reported by the broker.
#[derive(Debug, Default)]
pub struct ResponseItem {
    pub bufs: Vec<DmaBuf>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub modifier: u64,

    /// DRM connector id driving this plane, 0 if unknown.
    pub connector_id: u32,
    pub is_cursor: bool,

    /// Cursor planes: plane position. Others: source rectangle offset.
    pub x: i32,
    pub y: i32,

    /// Source rectangle size; 0 for cursor planes.
    pub src_w: i32,
    pub src_h: i32,

    pub hdr_metadata: Option<HdrOutputMetadata>,
}

impl ResponseItem {
    fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(self.bufs.len() <= MAX_DMA_BUFS);
        buf[0..4].copy_from_slice(&(self.bufs.len() as i32).to_le_bytes());
        let mut off = 4;
        for i in 0..MAX_DMA_BUFS {
            let (pitch, offset) = self
                .bufs
                .get(i)
                .map_or((0, 0), |b| (b.pitch, b.offset));
            buf[off..off + 4].copy_from_slice(&pitch.to_le_bytes());
            buf[off + 4..off + 8].copy_from_slice(&offset.to_le_bytes());
            off += 8;
        }
        buf[off..off + 4].copy_from_slice(&self.width.to_le_bytes());
        buf[off + 4..off + 8].copy_from_slice(&self.height.to_le_bytes());
        buf[off + 8..off + 12].copy_from_slice(&self.pixel_format.to_le_bytes());
        off += 12;
        buf[off..off + 8].copy_from_slice(&self.modifier.to_le_bytes());
        off += 8;
        buf[off..off + 4].copy_from_slice(&self.connector_id.to_le_bytes());
        off += 4;
        buf[off] = u8::from(self.is_cursor);
        buf[off + 1] = u8::from(self.hdr_metadata.is_some());
        off += 4; // two flag bytes + two pad bytes
        for v in [self.x, self.y, self.src_w, self.src_h] {
            buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
            off += 4;
        }
        self.hdr_metadata
            .unwrap_or_default()
            .encode_into(&mut buf[off..off + HDR_SIZE]);
        debug_assert_eq!(off + HDR_SIZE, ITEM_SIZE);
    }

    fn decode_from(buf: &[u8]) -> Result<Self> {
        let num_bufs = i32::from_le_bytes(read4(buf, 0));
        if !(0..=MAX_DMA_BUFS as i32).contains(&num_bufs) {
            return Err(KmsError::MalformedMessage(format!(
                "item claims {num_bufs} dma-bufs"
            )));
        }
        let mut off = 4;
        let mut bufs = Vec::with_capacity(num_bufs as usize);
        for i in 0..MAX_DMA_BUFS {
            let pitch = u32::from_le_bytes(read4(buf, off));
            let offset = u32::from_le_bytes(read4(buf, off + 4));
            off += 8;
            if (i as i32) < num_bufs {
                bufs.push(DmaBuf {
                    fd: None,
                    pitch,
                    offset,
                });
            }
        }
        let width = u32::from_le_bytes(read4(buf, off));
        let height = u32::from_le_bytes(read4(buf, off + 4));
        let pixel_format = u32::from_le_bytes(read4(buf, off + 8));
        off += 12;
        let modifier = u64::from_le_bytes(read8(buf, off));
        off += 8;
        let connector_id = u32::from_le_bytes(read4(buf, off));
        off += 4;
        let is_cursor = buf[off] != 0;
        let has_hdr = buf[off + 1] != 0;
        off += 4;
        let mut coords = [0i32; 4];
        for c in &mut coords {
            *c = i32::from_le_bytes(read4(buf, off));
            off += 4;
        }
        let hdr = has_hdr.then(|| HdrOutputMetadata::decode_from(&buf[off..off + HDR_SIZE]));
        Ok(Self {
            bufs,
            width,
            height,
            pixel_format,
            modifier,
            connector_id,
            is_cursor,
            x: coords[0],
            y: coords[1],
            src_w: coords[2],
            src_h: coords[3],
            hdr_metadata: hdr,
        })
    }
}

/// A full broker response.
#[derive(Debug, Default)]
pub struct Response {
    pub version: u32,
    pub result: Option<ResponseResult>,
    pub err_msg: String,
    pub items: Vec<ResponseItem>,
}

impl Response {
    pub fn ok(items: Vec<ResponseItem>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            result: Some(ResponseResult::Ok),
            err_msg: String::new(),
            items,
        }
    }

    pub fn error(result: ResponseResult, message: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            result: Some(result),
            err_msg: message.into(),
            items: Vec::new(),
        }
    }

    /// Total number of FDs that travel with this response, in wire order.
    pub fn fd_count(&self) -> usize {
        self.items.iter().map(|item| item.bufs.len()).sum()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; RESPONSE_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        let result = self.result.unwrap_or(ResponseResult::Ok) as i32;
        buf[4..8].copy_from_slice(&result.to_le_bytes());
        let msg = self.err_msg.as_bytes();
        let msg_len = msg.len().min(ERR_MSG_SIZE - 1);
        buf[8..8 + msg_len].copy_from_slice(&msg[..msg_len]);
        let items_off = 8 + ERR_MSG_SIZE;
        buf[items_off..items_off + 4]
            .copy_from_slice(&(self.items.len().min(MAX_ITEMS) as i32).to_le_bytes());
        for (i, item) in self.items.iter().take(MAX_ITEMS).enumerate() {
            let off = items_off + 4 + i * ITEM_SIZE;
            item.encode_into(&mut buf[off..off + ITEM_SIZE]);
        }
        buf
    }

    /// Decode a response, then attach `fds` to the items in wire order.
    ///
    /// Surplus FDs are dropped (closed); a shortfall leaves trailing planes
    /// without FDs, which the caller treats as a broker failure.
    pub fn decode(buf: &[u8], fds: Vec<OwnedFd>) -> Result<Self> {
        if buf.len() < RESPONSE_SIZE {
            return Err(KmsError::MalformedMessage(format!(
                "short response: {} bytes",
                buf.len()
            )));
        }
        let version = u32::from_le_bytes(read4(buf, 0));
        let result = ResponseResult::from_wire(i32::from_le_bytes(read4(buf, 4)))?;
        let err_msg = {
            let raw = &buf[8..8 + ERR_MSG_SIZE];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(ERR_MSG_SIZE);
            String::from_utf8_lossy(&raw[..end]).into_owned()
        };
        let items_off = 8 + ERR_MSG_SIZE;
        let num_items = i32::from_le_bytes(read4(buf, items_off));
        if !(0..=MAX_ITEMS as i32).contains(&num_items) {
            return Err(KmsError::MalformedMessage(format!(
                "response claims {num_items} items"
            )));
        }
        let mut items = Vec::with_capacity(num_items as usize);
        for i in 0..num_items as usize {
            let off = items_off + 4 + i * ITEM_SIZE;
            items.push(ResponseItem::decode_from(&buf[off..off + ITEM_SIZE])?);
        }

        let mut fd_iter = fds.into_iter();
        for item in &mut items {
            for buf_desc in &mut item.bufs {
                buf_desc.fd = fd_iter.next();
            }
        }
        // Anything left in fd_iter is dropped and closed here.

        Ok(Self {
            version,
            result: Some(result),
            err_msg,
            items,
        })
    }
}

fn read2(buf: &[u8], off: usize) -> [u8; 2] {
    [buf[off], buf[off + 1]]
}

fn read4(buf: &[u8], off: usize) -> [u8; 4] {
    [buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]
}

fn read8(buf: &[u8], off: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[off..off + 8]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item(with_hdr: bool) -> ResponseItem {
        ResponseItem {
            bufs: vec![
                DmaBuf {
                    fd: None,
                    pitch: 7680,
                    offset: 0,
                },
                DmaBuf {
                    fd: None,
                    pitch: 3840,
                    offset: 8294400,
                },
            ],
            width: 1920,
            height: 1080,
            pixel_format: 0x3432_5258, // XR24
            modifier: 0x0100_0000_0000_0001,
            connector_id: 95,
            is_cursor: false,
            x: 0,
            y: 0,
            src_w: 1920,
            src_h: 1080,
            hdr_metadata: with_hdr.then(|| HdrOutputMetadata {
                metadata_type: 0,
                eotf: 2,
                static_metadata_descriptor_id: 0,
                display_primaries: [(35400, 14600), (8500, 39850), (6550, 2300)],
                white_point: (15635, 16450),
                max_display_mastering_luminance: 1000,
                min_display_mastering_luminance: 50,
                max_content_light_level: 1000,
                max_frame_average_light_level: 400,
            }),
        }
    }

    #[test]
    fn test_request_roundtrip() {
        let req = Request::new(RequestType::GetKms);
        let decoded = Request::decode(&req.encode()).expect("decode");
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.kind, RequestType::GetKms);
        assert!(!decoded.carries_fd);

        let req = Request::new(RequestType::ReplaceConnection);
        let decoded = Request::decode(&req.encode()).expect("decode");
        assert!(decoded.carries_fd);
    }

    #[test]
    fn test_response_roundtrip() {
        let response = Response::ok(vec![sample_item(true), sample_item(false)]);
        let encoded = response.encode();
        assert_eq!(encoded.len(), RESPONSE_SIZE);

        let decoded = Response::decode(&encoded, Vec::new()).expect("decode");
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.result, Some(ResponseResult::Ok));
        assert_eq!(decoded.items.len(), 2);

        let item = &decoded.items[0];
        assert_eq!(item.bufs.len(), 2);
        assert_eq!(item.bufs[0].pitch, 7680);
        assert_eq!(item.bufs[1].offset, 8294400);
        assert_eq!(item.width, 1920);
        assert_eq!(item.modifier, 0x0100_0000_0000_0001);
        assert_eq!(item.connector_id, 95);
        let hdr = item.hdr_metadata.expect("hdr");
        assert_eq!(hdr.eotf, 2);
        assert_eq!(hdr.max_content_light_level, 1000);
        assert!(decoded.items[1].hdr_metadata.is_none());
    }

    #[test]
    fn test_error_response_roundtrip() {
        let response = Response::error(ResponseResult::FailedToGetPlane, "no planes");
        let decoded = Response::decode(&response.encode(), Vec::new()).expect("decode");
        assert_eq!(decoded.result, Some(ResponseResult::FailedToGetPlane));
        assert_eq!(decoded.err_msg, "no planes");
        assert!(decoded.items.is_empty());
    }

    #[test]
    fn test_err_msg_truncated_to_field_size() {
        let long = "x".repeat(ERR_MSG_SIZE * 2);
        let response = Response::error(ResponseResult::InvalidRequest, long);
        let decoded = Response::decode(&response.encode(), Vec::new()).expect("decode");
        assert_eq!(decoded.err_msg.len(), ERR_MSG_SIZE - 1);
    }

    #[test]
    fn test_fd_count_matches_plane_count() {
        let response = Response::ok(vec![sample_item(false), sample_item(false)]);
        assert_eq!(response.fd_count(), 4);
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(Request::decode(&[0u8; 4]).is_err());
        assert!(Response::decode(&[0u8; 16], Vec::new()).is_err());

        // Absurd item count.
        let mut encoded = Response::ok(Vec::new()).encode();
        let items_off = 8 + ERR_MSG_SIZE;
        encoded[items_off..items_off + 4].copy_from_slice(&100i32.to_le_bytes());
        assert!(Response::decode(&encoded, Vec::new()).is_err());
    }

    #[test]
    fn test_cursor_item_roundtrip() {
        let mut item = sample_item(false);
        item.is_cursor = true;
        item.x = 500;
        item.y = 300;
        item.src_w = 0;
        item.src_h = 0;
        let decoded = Response::decode(&Response::ok(vec![item]).encode(), Vec::new())
            .expect("decode");
        assert!(decoded.items[0].is_cursor);
        assert_eq!(decoded.items[0].x, 500);
        assert_eq!(decoded.items[0].src_w, 0);
    }
}
