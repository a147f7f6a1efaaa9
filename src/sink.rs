//! Raw Socket Sink
//!
//! Outbound raw IPv4 socket with IP_HDRINCL: frames written here carry
//! their own IP header and the kernel routes them by it, so the forged
//! source address goes out untouched.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::dispatch::FrameWriter;
use crate::error::RelayError;

/// Raw IPv4 socket that transmits caller-built datagrams.
///
/// The descriptor is released when the socket is dropped.
pub struct RawSocket {
    socket: Socket,
    /// Zero-filled sendto address; routing comes from the IP header
    sendto: SockAddr,
}

impl RawSocket {
    /// Open the raw socket and enable IP_HDRINCL.
    ///
    /// Needs CAP_NET_RAW; failure here is fatal at startup.
    pub fn open() -> Result<Self, RelayError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(libc::IPPROTO_RAW)))
            .map_err(RelayError::SocketInit)?;

        let one: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_HDRINCL,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(RelayError::SocketInit(io::Error::last_os_error()));
        }

        Ok(Self {
            socket,
            sendto: SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
        })
    }
}

impl FrameWriter for RawSocket {
    fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        self.socket.send_to(frame, &self.sendto)
    }
}
