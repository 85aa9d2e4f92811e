//! Server side of the KMS broker: the privileged helper.
//!
//! Runs as root (or with CAP_SYS_ADMIN), connects back to the path its
//! parent passed on the command line, and answers `GET_KMS` requests with
//! the card's current scanout planes. Each reported plane carries its
//! framebuffer's DMA-BUF FDs as `SCM_RIGHTS`; the helper closes its copies
//! right after sending.
//!
//! The helper deliberately holds no state between requests: every `GET_KMS`
//! re-reads the plane list so mode sets, rotations and hotplugs are picked
//! up for free.

use std::fs::File;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use drm::control::{connector, plane, Device as ControlDevice};
use drm::ClientCapability;
use drm::Device;
use tracing::{debug, info, warn};

use crate::error::{KmsError, Result};
use crate::protocol::{
    DmaBuf, HdrOutputMetadata, Request, RequestType, Response, ResponseItem, ResponseResult,
    MAX_DMA_BUFS, MAX_ITEMS, PROTOCOL_VERSION, REQUEST_SIZE,
};

struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

/// Connector info gathered once at startup, keyed by CRTC.
#[derive(Debug, Clone, Copy)]
struct CrtcConnector {
    crtc_id: u32,
    connector_id: u32,
    hdr_blob_id: Option<u64>,
}

/// Run the helper until the parent goes away.
pub fn run(socket_path: &str, card_path: &str) -> Result<()> {
    let card = Card(
        File::options()
            .read(true)
            .write(true)
            .open(card_path)
            .map_err(|e| KmsError::Drm(format!("open {card_path}: {e}")))?,
    );

    card.set_client_capability(ClientCapability::UniversalPlanes, true)
        .map_err(|e| KmsError::Drm(format!("universal planes cap: {e}")))?;
    if let Err(e) = card.set_client_capability(ClientCapability::Atomic, true) {
        // Without atomic the per-plane CRTC mapping may be incomplete and
        // the wrong monitor can be captured in multi-monitor setups.
        warn!("Atomic client cap rejected: {}", e);
    }

    let connector_map = map_crtcs_to_connectors(&card);
    info!(
        "KMS broker on {} ({} mapped connector(s))",
        card_path,
        connector_map.len()
    );

    let stream = UnixStream::connect(socket_path)?;
    let mut connection: OwnedFd = stream.into();

    loop {
        let (request, fd) = match recv_request(&connection) {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                info!("Parent closed the connection, exiting");
                return Ok(());
            }
            Err(e) => {
                warn!("Malformed request: {}", e);
                send_response(
                    &connection,
                    &Response::error(ResponseResult::InvalidRequest, e.to_string()),
                )?;
                continue;
            }
        };

        if request.version != PROTOCOL_VERSION {
            // Never act on a version-mismatched request; answer with our
            // version so the client can log the actual skew.
            warn!(
                "Request with protocol version {} (ours is {}), dropping",
                request.version, PROTOCOL_VERSION
            );
            send_response(
                &connection,
                &Response::error(ResponseResult::InvalidRequest, "protocol version mismatch"),
            )?;
            continue;
        }

        match request.kind {
            RequestType::ReplaceConnection => match fd {
                Some(new_connection) => {
                    debug!("Connection replaced");
                    connection = new_connection;
                }
                None => {
                    send_response(
                        &connection,
                        &Response::error(
                            ResponseResult::InvalidRequest,
                            "REPLACE_CONNECTION without an fd",
                        ),
                    )?;
                }
            },
            RequestType::GetKms => {
                let response = collect_planes(&card, &connector_map);
                send_response(&connection, &response)?;
                // Our copies of the DMA-BUF FDs close when `response` drops.
            }
        }
    }
}

fn map_crtcs_to_connectors(card: &Card) -> Vec<CrtcConnector> {
    let mut map = Vec::new();
    let Ok(resources) = card.resource_handles() else {
        return map;
    };
    for handle in resources.connectors() {
        let Ok(info) = card.get_connector(*handle, false) else {
            continue;
        };
        if info.state() != connector::State::Connected {
            continue;
        }
        let Some(crtc_id) = connector_crtc_id(card, &info) else {
            continue;
        };
        let hdr_blob_id = find_property_value(card, *handle, "HDR_OUTPUT_METADATA")
            .filter(|&id| id != 0);
        map.push(CrtcConnector {
            crtc_id,
            connector_id: u32::from(*handle),
            hdr_blob_id,
        });
    }
    map
}

fn connector_crtc_id(card: &Card, info: &connector::Info) -> Option<u32> {
    let encoder = info.current_encoder()?;
    let encoder_info = card.get_encoder(encoder).ok()?;
    encoder_info.crtc().map(u32::from)
}

/// Read a named property value from any KMS resource.
fn find_property_value<H>(card: &Card, handle: H, name: &str) -> Option<u64>
where
    H: drm::control::ResourceHandle,
{
    let props = card.get_properties(handle).ok()?;
    let (handles, values) = props.as_props_and_values();
    for (prop, value) in handles.iter().zip(values.iter()) {
        let Ok(info) = card.get_property(*prop) else {
            continue;
        };
        if info.name().to_string_lossy() == name {
            return Some(*value);
        }
    }
    None
}

/// Plane classification from the "type" property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaneKind {
    Overlay,
    Primary,
    Cursor,
}

fn plane_kind(card: &Card, handle: plane::Handle) -> Option<PlaneKind> {
    match find_property_value(card, handle, "type")? {
        0 => Some(PlaneKind::Overlay),
        1 => Some(PlaneKind::Primary),
        2 => Some(PlaneKind::Cursor),
        _ => None,
    }
}

struct PlaneCoords {
    crtc_x: i32,
    crtc_y: i32,
    src_x: i32,
    src_y: i32,
    src_w: i32,
    src_h: i32,
}

fn plane_coords(card: &Card, handle: plane::Handle) -> PlaneCoords {
    // SRC_* are 16.16 fixed point in KMS.
    let fixed = |name| {
        find_property_value(card, handle, name).map_or(0, |v| (v >> 16) as i32)
    };
    let raw = |name| find_property_value(card, handle, name).map_or(0, |v| v as i32);
    PlaneCoords {
        crtc_x: raw("CRTC_X"),
        crtc_y: raw("CRTC_Y"),
        src_x: fixed("SRC_X"),
        src_y: fixed("SRC_Y"),
        src_w: fixed("SRC_W"),
        src_h: fixed("SRC_H"),
    }
}

fn collect_planes(card: &Card, connector_map: &[CrtcConnector]) -> Response {
    let planes = match card.plane_handles() {
        Ok(planes) => planes,
        Err(e) => {
            return Response::error(
                ResponseResult::FailedToGetPlanes,
                format!("plane enumeration failed: {e}"),
            )
        }
    };

    let mut items = Vec::new();
    for handle in planes {
        if items.len() >= MAX_ITEMS {
            break;
        }
        let Ok(info) = card.get_plane(handle) else {
            continue;
        };
        let Some(fb) = info.framebuffer() else {
            continue; // plane not scanning out
        };

        let kind = plane_kind(card, handle);
        if !matches!(kind, Some(PlaneKind::Primary) | Some(PlaneKind::Cursor)) {
            continue;
        }
        let is_cursor = kind == Some(PlaneKind::Cursor);

        // The framebuffer can vanish between the plane query and here (the
        // cursor moving to another monitor does this); not an error.
        let Ok(fb_info) = card.get_planar_framebuffer(fb) else {
            continue;
        };

        let mut bufs = Vec::new();
        let pitches = fb_info.pitches();
        let offsets = fb_info.offsets();
        for (i, buffer) in fb_info.buffers().iter().enumerate().take(MAX_DMA_BUFS) {
            let Some(buffer) = buffer else { break };
            match card.buffer_to_prime_fd(*buffer, libc::O_RDONLY as u32) {
                Ok(fd) => bufs.push(DmaBuf {
                    fd: Some(fd),
                    pitch: pitches[i],
                    offset: offsets[i],
                }),
                Err(e) => {
                    warn!("prime export failed for plane {:?}: {}", handle, e);
                    break;
                }
            }
        }
        if bufs.is_empty() {
            continue;
        }

        let crtc_id = info.crtc().map(u32::from).unwrap_or(0);
        let crtc_pair = connector_map.iter().find(|c| c.crtc_id == crtc_id);
        let hdr_metadata = crtc_pair
            .and_then(|pair| pair.hdr_blob_id)
            .and_then(|blob_id| read_hdr_blob(card, blob_id));

        let coords = plane_coords(card, handle);
        let (size_w, size_h) = fb_info.size();
        let modifier = fb_info
            .modifier()
            .map_or(crate::FORMAT_MOD_INVALID, u64::from);
        items.push(ResponseItem {
            bufs,
            width: size_w,
            height: size_h,
            pixel_format: fb_info.pixel_format() as u32,
            modifier,
            connector_id: crtc_pair.map_or(0, |pair| pair.connector_id),
            is_cursor,
            x: if is_cursor { coords.crtc_x } else { coords.src_x },
            y: if is_cursor { coords.crtc_y } else { coords.src_y },
            src_w: if is_cursor { 0 } else { coords.src_w },
            src_h: if is_cursor { 0 } else { coords.src_h },
            hdr_metadata,
        });
    }

    if items.is_empty() {
        Response::error(ResponseResult::FailedToGetPlane, "no scanout planes found")
    } else {
        Response::ok(items)
    }
}

/// Parse the kernel's `hdr_output_metadata` blob.
fn read_hdr_blob(card: &Card, blob_id: u64) -> Option<HdrOutputMetadata> {
    let data = card.get_property_blob(blob_id).ok()?;
    parse_hdr_blob(&data)
}

fn parse_hdr_blob(data: &[u8]) -> Option<HdrOutputMetadata> {
    // u32 metadata_type + hdr_metadata_infoframe (26 bytes).
    if data.len() < 30 {
        return None;
    }
    let u16_at = |off: usize| u16::from_le_bytes([data[off], data[off + 1]]);
    let mut primaries = [(0u16, 0u16); 3];
    for (i, p) in primaries.iter_mut().enumerate() {
        let off = 6 + i * 4;
        *p = (u16_at(off), u16_at(off + 2));
    }
    Some(HdrOutputMetadata {
        metadata_type: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        eotf: data[4],
        static_metadata_descriptor_id: data[5],
        display_primaries: primaries,
        white_point: (u16_at(18), u16_at(20)),
        max_display_mastering_luminance: u16_at(22),
        min_display_mastering_luminance: u16_at(24),
        max_content_light_level: u16_at(26),
        max_frame_average_light_level: u16_at(28),
    })
}

/// Receive one request. `Ok(None)` means the peer hung up.
fn recv_request(connection: &OwnedFd) -> Result<Option<(Request, Option<OwnedFd>)>> {
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};

    let mut buf = [0u8; REQUEST_SIZE];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let (bytes, fd) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = recvmsg::<UnixAddr>(
            connection.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )?;
        let mut fd = None;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                for raw in raw_fds {
                    // SAFETY: freshly received fd, we are the sole owner.
                    fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }
        (msg.bytes, fd)
    };

    if bytes == 0 {
        return Ok(None);
    }
    let request = Request::decode(&buf)?;
    Ok(Some((request, fd)))
}

fn send_response(connection: &OwnedFd, response: &Response) -> Result<()> {
    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};

    let encoded = response.encode();
    let fds: Vec<RawFd> = response
        .items
        .iter()
        .flat_map(|item| item.bufs.iter())
        .filter_map(|b| b.fd.as_ref().map(|fd| fd.as_raw_fd()))
        .collect();
    let iov = [IoSlice::new(&encoded)];
    let cmsgs = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(&fds)]
    };
    sendmsg::<UnixAddr>(
        connection.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hdr_blob() {
        let mut blob = vec![0u8; 30];
        blob[0..4].copy_from_slice(&0u32.to_le_bytes()); // metadata_type
        blob[4] = 2; // eotf: PQ
        blob[6..8].copy_from_slice(&35400u16.to_le_bytes()); // primary 0 x
        blob[22..24].copy_from_slice(&1000u16.to_le_bytes()); // max mastering
        blob[26..28].copy_from_slice(&800u16.to_le_bytes()); // max cll

        let hdr = parse_hdr_blob(&blob).expect("parse");
        assert_eq!(hdr.eotf, 2);
        assert_eq!(hdr.display_primaries[0].0, 35400);
        assert_eq!(hdr.max_display_mastering_luminance, 1000);
        assert_eq!(hdr.max_content_light_level, 800);
    }

    #[test]
    fn test_parse_hdr_blob_too_short() {
        assert!(parse_hdr_blob(&[0u8; 10]).is_none());
    }
}
