//! Link-layer transport: AF_PACKET capture with a kernel BPF filter, and a
//! frame sender bound to the same interface
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AC-3: Access Enforcement - Packet sockets require CAP_NET_RAW
//! - SC-5: DoS Protection - The kernel filter drops everything except
//!   Neighbor Solicitations before it reaches user space
//! - SC-7: Boundary Protection - Both sockets are bound to one interface

use crate::error::{NdpError, Result};
use crate::packet::{self, NEIGHBOR_SOLICIT_FILTER};
use crate::types::NeighSolicitation;
use nix::sys::socket::{
    AddressFamily, LinkAddr, MsgFlags, SockFlag, SockProtocol, SockType, SockaddrLike, bind,
    recvfrom, sendto, socket,
};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// `ETH_P_IPV6` in network byte order
const ETH_P_IPV6_BE: u16 = (libc::ETH_P_IPV6 as u16).to_be();

/// `PACKET_OUTGOING` from linux/if_packet.h
const PACKET_OUTGOING: u8 = 4;

const SNAPLEN: usize = 2048;

/// Anything that can put a complete Ethernet frame on the wire
pub trait FrameSink {
    fn send_frame(&self, frame: &[u8]) -> Result<()>;
}

impl<T: FrameSink + ?Sized> FrameSink for Arc<T> {
    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        (**self).send_frame(frame)
    }
}

/// Unbound AF_PACKET socket. Protocol 0 receives nothing until `bind`.
fn packet_socket(flags: SockFlag) -> Result<OwnedFd> {
    socket(
        AddressFamily::Packet,
        SockType::Raw,
        SockFlag::SOCK_CLOEXEC | flags,
        Option::<SockProtocol>::None,
    )
    .map_err(|e| NdpError::Transport(format!("socket(AF_PACKET): {}", e)))
}

/// Link-layer address on `ifindex`, optionally naming a destination MAC
fn link_addr(ifindex: u32, protocol: u16, dest: Option<&[u8]>) -> Result<LinkAddr> {
    let mut sa: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sa.sll_family = libc::AF_PACKET as libc::c_ushort;
    sa.sll_protocol = protocol;
    sa.sll_ifindex = libc::c_int::try_from(ifindex)
        .map_err(|_| NdpError::Transport(format!("interface index {ifindex} out of range")))?;
    if let Some(mac) = dest {
        sa.sll_halen = mac.len() as libc::c_uchar;
        sa.sll_addr[..mac.len()].copy_from_slice(mac);
    }

    // SAFETY: `sa` is a fully initialized sockaddr_ll of the stated length
    unsafe {
        LinkAddr::from_raw(
            &sa as *const libc::sockaddr_ll as *const libc::sockaddr,
            Some(std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t),
        )
    }
    .ok_or_else(|| NdpError::Transport("invalid link-layer address".into()))
}

/// Packet socket receiving IPv6 Neighbor Solicitations on one interface
pub struct CaptureSocket {
    inner: AsyncFd<OwnedFd>,
}

impl CaptureSocket {
    /// Open the socket, attach the NS filter, then bind to `ifindex`.
    ///
    /// The filter goes on before the bind so no unfiltered frame is ever
    /// queued. Must be called inside a tokio runtime.
    #[instrument]
    pub fn open(ifindex: u32) -> Result<Self> {
        let fd = packet_socket(SockFlag::SOCK_NONBLOCK)?;
        attach_filter(&fd)?;

        let addr = link_addr(ifindex, ETH_P_IPV6_BE, None)?;
        bind(fd.as_raw_fd(), &addr)
            .map_err(|e| NdpError::Transport(format!("bind(AF_PACKET): {}", e)))?;

        let inner = AsyncFd::new(fd)
            .map_err(|e| NdpError::Transport(format!("Failed to create AsyncFd: {e}")))?;
        debug!("Opened capture socket");
        Ok(Self { inner })
    }

    /// Receive the next frame that was not sent by this host
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self
                .inner
                .readable()
                .await
                .map_err(|e| NdpError::Transport(format!("AsyncFd readable error: {e}")))?;

            match guard.try_io(|fd| recv_frame(fd.get_ref(), &mut *buf)) {
                Ok(Ok(Some(len))) => return Ok(len),
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => return Err(NdpError::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// One `recvfrom`; `None` for frames the host transmitted itself
fn recv_frame(fd: &OwnedFd, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
    let (len, from) = recvfrom::<LinkAddr>(fd.as_raw_fd(), buf).map_err(std::io::Error::from)?;
    if is_outgoing(from.as_ref()) {
        return Ok(None);
    }
    Ok(Some(len))
}

fn is_outgoing(from: Option<&LinkAddr>) -> bool {
    from.is_some_and(|addr| addr.pkttype() == PACKET_OUTGOING)
}

fn attach_filter(fd: &OwnedFd) -> Result<()> {
    let mut program: Vec<libc::sock_filter> = NEIGHBOR_SOLICIT_FILTER
        .iter()
        .map(|&(code, jt, jf, k)| libc::sock_filter { code, jt, jf, k })
        .collect();
    let fprog = libc::sock_fprog {
        len: program.len() as libc::c_ushort,
        filter: program.as_mut_ptr(),
    };

    // nix has no wrapper for SO_ATTACH_FILTER
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &fprog as *const libc::sock_fprog as *const libc::c_void,
            std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(NdpError::Transport(format!(
            "SO_ATTACH_FILTER: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Send-only packet socket; the frame's own destination MAC is used as the
/// link-layer address
pub struct FrameSender {
    fd: OwnedFd,
    ifindex: u32,
}

impl FrameSender {
    #[instrument]
    pub fn open(ifindex: u32) -> Result<Self> {
        let fd = packet_socket(SockFlag::empty())?;
        let addr = link_addr(ifindex, 0, None)?;
        bind(fd.as_raw_fd(), &addr)
            .map_err(|e| NdpError::Transport(format!("bind(AF_PACKET): {}", e)))?;
        Ok(Self { fd, ifindex })
    }
}

impl FrameSink for FrameSender {
    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        if frame.len() < packet::ETH_HDR_LEN {
            return Err(NdpError::Transport(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }

        let dest = link_addr(self.ifindex, ETH_P_IPV6_BE, Some(&frame[..6]))?;
        sendto(self.fd.as_raw_fd(), frame, &dest, MsgFlags::empty())
            .map_err(|e| NdpError::Transport(format!("sendto: {}", e)))?;
        Ok(())
    }
}

/// Spawn the capture producer.
///
/// Frames that do not decode as Neighbor Solicitations are dropped. The
/// task ends when `cancel` fires, the receiver goes away, or the socket
/// stops being pollable.
pub fn spawn_capture(
    socket: CaptureSocket,
    tx: mpsc::Sender<NeighSolicitation>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Capture started");
        let mut buf = vec![0u8; SNAPLEN];
        loop {
            let len = tokio::select! {
                _ = cancel.cancelled() => break,
                res = socket.recv(&mut buf) => match res {
                    Ok(len) => len,
                    Err(NdpError::Io(e)) => {
                        warn!(error = %e, "Failed to read frame");
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "Capture socket failed");
                        break;
                    }
                },
            };

            let Some(ns) = packet::decode(&buf[..len]) else {
                trace!(len, "Dropped frame");
                continue;
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                res = tx.send(ns) => {
                    if res.is_err() {
                        debug!("Solicitation receiver closed");
                        break;
                    }
                }
            }
        }
        info!("Capture stopped");
    })
}
