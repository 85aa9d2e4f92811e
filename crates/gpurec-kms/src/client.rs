//! Client side of the KMS broker.
//!
//! Reading other processes' framebuffers through KMS needs CAP_SYS_ADMIN on
//! modern kernels, so the recorder spawns a small privileged helper instead
//! of running as root itself. The handshake goes through a file-backed
//! socket (the only path a pkexec'd or flatpak-spawned child can find), and
//! is immediately replaced by an anonymous socketpair so that the helper
//! dies with its parent:
//!
//! 1. create a listening socket at `$HOME/.gpurec-kms-socket-<random>`
//! 2. spawn the helper (directly as root, via `pkexec`, or via
//!    `flatpak-spawn --host` inside a Flatpak)
//! 3. the helper connects back; accept with a 5 second deadline
//! 4. send `REPLACE_CONNECTION` carrying one end of a fresh socketpair as
//!    `SCM_RIGHTS`, unlink the file socket
//! 5. all further `GET_KMS` traffic runs over the socketpair
//!
//! Requests are strictly serial. Receives are non-blocking with a
//! `try_wait` on the child each loop so a dead helper cannot wedge the
//! pacer.

use std::io::Read;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType, UnixAddr,
};
use tracing::{debug, info, warn};

use crate::error::{KmsError, Result};
use crate::protocol::{
    Request, RequestType, Response, ResponseResult, MAX_DMA_BUFS, MAX_ITEMS, PROTOCOL_VERSION,
    RESPONSE_SIZE,
};

/// Handshake and per-request receive deadline.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// How the helper gets its privileges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpawnMethod {
    /// We are already root (or otherwise privileged).
    Direct,
    /// Polkit prompt; the usual path for desktop sessions.
    Pkexec,
    /// Inside a Flatpak the helper must run on the host.
    FlatpakSpawn,
}

fn spawn_method() -> SpawnMethod {
    if std::env::var_os("FLATPAK_ID").is_some() {
        SpawnMethod::FlatpakSpawn
    // SAFETY: geteuid has no preconditions.
    } else if unsafe { libc::geteuid() } == 0 {
        SpawnMethod::Direct
    } else {
        SpawnMethod::Pkexec
    }
}

/// Handle to a running broker helper.
///
/// Dropping the client SIGKILLs the helper; the helper also exits on its
/// own when the socketpair closes with the parent.
pub struct BrokerClient {
    child: Child,
    socket: OwnedFd,
}

impl BrokerClient {
    /// Spawn the helper for `card_path` and complete the handshake.
    pub fn spawn(card_path: &str) -> Result<Self> {
        let socket_path = socket_path()?;
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        debug!("KMS broker handshake socket at {}", socket_path.display());

        let broker = find_broker_binary()?;
        let mut child = spawn_broker(&broker, &socket_path, card_path)?;

        let stream = match accept_with_deadline(&listener, &mut child) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = std::fs::remove_file(&socket_path);
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        // Move the helper onto an anonymous socketpair so it dies with us.
        let (local, remote) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        let request = Request::new(RequestType::ReplaceConnection).encode();
        let remote_fd = remote.as_raw_fd();
        let iov = [IoSlice::new(&request)];
        let fds = [remote_fd];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;
        drop(remote);
        drop(stream);
        drop(listener);
        let _ = std::fs::remove_file(&socket_path);

        info!("KMS broker connected (pid {})", child.id());
        Ok(Self {
            child,
            socket: local,
        })
    }

    /// Ask the broker for the current scanout planes.
    ///
    /// On success the returned items own their DMA-BUF FDs; they are closed
    /// when the response is dropped unless transferred out first.
    pub fn get_kms(&mut self) -> Result<Response> {
        let request = Request::new(RequestType::GetKms).encode();
        let iov = [IoSlice::new(&request)];
        sendmsg::<UnixAddr>(self.socket.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)?;

        let (buf, fds) = self.recv_response()?;
        let response = Response::decode(&buf, fds)?;

        if response.version != PROTOCOL_VERSION {
            // Dropping the response closes any FDs that were attached.
            warn!(
                "Dropping KMS response with protocol version {} (ours is {})",
                response.version, PROTOCOL_VERSION
            );
            return Err(KmsError::ProtocolMismatch {
                ours: PROTOCOL_VERSION,
                theirs: response.version,
            });
        }

        match response.result {
            Some(ResponseResult::Ok) => Ok(response),
            Some(result) => Err(KmsError::Broker {
                result,
                message: response.err_msg.clone(),
            }),
            None => Err(KmsError::MalformedMessage("response without result".into())),
        }
    }

    fn recv_response(&mut self) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
        let mut buf = vec![0u8; RESPONSE_SIZE];
        let deadline = Instant::now() + RECV_TIMEOUT;

        loop {
            let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_ITEMS * MAX_DMA_BUFS]);
            let received = {
                let mut iov = [IoSliceMut::new(&mut buf)];
                match recvmsg::<UnixAddr>(
                    self.socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buffer),
                    MsgFlags::MSG_DONTWAIT,
                ) {
                    Ok(msg) => {
                        let mut fds = Vec::new();
                        for cmsg in msg.cmsgs() {
                            if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                                for fd in raw_fds {
                                    // SAFETY: the kernel just gave us this
                                    // fd; we are its sole owner.
                                    fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                                }
                            }
                        }
                        Some((msg.bytes, fds))
                    }
                    Err(nix::errno::Errno::EAGAIN) => None,
                    Err(e) => return Err(e.into()),
                }
            };

            if let Some((bytes, fds)) = received {
                if bytes < RESPONSE_SIZE {
                    return Err(KmsError::MalformedMessage(format!(
                        "short read: {bytes} bytes"
                    )));
                }
                return Ok((buf, fds));
            }

            // recvmsg can block forever on a dead helper; poll its status
            // instead of trusting the socket.
            if self.child.try_wait()?.is_some() {
                return Err(KmsError::BrokerDied);
            }
            if Instant::now() >= deadline {
                return Err(KmsError::HandshakeTimeout(RECV_TIMEOUT.as_secs()));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        // Child::kill sends SIGKILL; the helper holds no state worth a
        // graceful shutdown.
        let _ = self.child.kill();
        let _ = self.child.wait();
        debug!("KMS broker stopped");
    }
}

/// `$HOME/.gpurec-kms-socket-<10 random alphanumerics>`.
///
/// `$HOME` because inside a Flatpak it is the only path both the sandbox
/// and the host helper can reach for read and write.
fn socket_path() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
    let mut random = [0u8; 10];
    std::fs::File::open("/dev/urandom")?.read_exact(&mut random)?;
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let suffix: String = random
        .iter()
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect();
    Ok(PathBuf::from(home).join(format!(".gpurec-kms-socket-{suffix}")))
}

fn find_broker_binary() -> Result<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("gpurec-kms-broker");
            if sibling.exists() {
                return Ok(sibling);
            }
        }
    }
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join("gpurec-kms-broker");
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    Err(KmsError::BrokerNotFound)
}

fn spawn_broker(broker: &std::path::Path, socket_path: &std::path::Path, card_path: &str) -> Result<Child> {
    let method = spawn_method();
    debug!("Spawning KMS broker via {:?}", method);
    let mut command = match method {
        SpawnMethod::Direct => Command::new(broker),
        SpawnMethod::Pkexec => {
            let mut c = Command::new("pkexec");
            c.arg(broker);
            c
        }
        SpawnMethod::FlatpakSpawn => {
            let mut c = Command::new("flatpak-spawn");
            c.arg("--host").arg(broker);
            c
        }
    };
    command
        .arg(socket_path)
        .arg(card_path)
        .stdin(Stdio::null())
        .spawn()
        .map_err(KmsError::SpawnFailed)
}

fn accept_with_deadline(
    listener: &UnixListener,
    child: &mut Child,
) -> Result<std::os::unix::net::UnixStream> {
    let deadline = Instant::now() + RECV_TIMEOUT;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        if child.try_wait()?.is_some() {
            return Err(KmsError::BrokerDied);
        }
        if Instant::now() >= deadline {
            return Err(KmsError::HandshakeTimeout(RECV_TIMEOUT.as_secs()));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_shape() {
        let path = socket_path().expect("socket path");
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .expect("file name");
        assert!(name.starts_with(".gpurec-kms-socket-"));
        let suffix = name.trim_start_matches(".gpurec-kms-socket-");
        assert_eq!(suffix.len(), 10);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_socket_paths_are_unique() {
        let a = socket_path().expect("a");
        let b = socket_path().expect("b");
        assert_ne!(a, b);
    }
}
