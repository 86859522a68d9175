//! Raw, non-blocking UDP sockets wired up for ancillary-data capture
//! (`IP_PKTINFO`/`IPV6_PKTINFO`, `SO_TIMESTAMP`) and wrapped in
//! [`tokio::io::unix::AsyncFd`] for the manager's `select`-style wait loop.
//!
//! Socket I/O is abstracted behind [`DatagramIo`] so the manager can run
//! against an in-memory fake in unit tests instead of real sockets, the way
//! the original let tests install their own `sendmsg`/`recvmsg`
//! implementations.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::error::{Error, Result};
use crate::pktinfo::Pktinfo;

/// Low-level send/receive operations a tube manager needs from a socket.
/// Implemented by [`RawSocket`] for the real thing and by [`FakeSocket`] in
/// tests.
pub trait DatagramIo: Send + Sync {
    fn try_send_to(
        &self,
        addr: SocketAddr,
        buf: &[u8],
        pktinfo: Option<&Pktinfo>,
    ) -> std::io::Result<usize>;

    fn try_recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, Pktinfo)>;
}

/// Address family a socket was bound for; the manager keeps one of each so
/// it can examine v6 before v4 every loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// A bound, non-blocking UDP socket using raw syscalls for `sendmsg`/
/// `recvmsg` with ancillary-data control messages.
pub struct RawSocket {
    fd: OwnedFd,
    family: Family,
}

impl RawSocket {
    /// Bind a new socket of the given family to `port` (0 for ephemeral),
    /// enabling pktinfo and receive-timestamp ancillary data.
    pub fn bind(family: Family, port: u16) -> Result<Self> {
        let (domain, pktinfo_level, pktinfo_opt) = match family {
            Family::V4 => (libc::AF_INET, libc::IPPROTO_IP, libc::IP_PKTINFO),
            Family::V6 => (libc::AF_INET6, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO),
        };

        // SAFETY: standard socket(2)/setsockopt(2)/bind(2) calls; all
        // arguments are valid for the family selected above, and the
        // returned fd is immediately wrapped in an OwnedFd.
        let raw_fd = unsafe { libc::socket(domain, libc::SOCK_DGRAM, 0) };
        if raw_fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        set_nonblocking(&fd)?;
        if family == Family::V6 {
            set_bool_opt(&fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY)?;
        }
        set_bool_opt(&fd, pktinfo_level, pktinfo_opt)?;
        set_bool_opt(&fd, libc::SOL_SOCKET, libc::SO_TIMESTAMP)?;

        match family {
            Family::V4 => bind_v4(&fd, port)?,
            Family::V6 => bind_v6(&fd, port)?,
        }

        Ok(Self { fd, family })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn local_port(&self) -> Result<u16> {
        match self.family {
            Family::V4 => {
                let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
                let rc = unsafe {
                    libc::getsockname(
                        self.fd.as_raw_fd(),
                        std::ptr::addr_of_mut!(addr) as *mut libc::sockaddr,
                        &mut len,
                    )
                };
                if rc < 0 {
                    return Err(Error::Io(std::io::Error::last_os_error()));
                }
                Ok(u16::from_be(addr.sin_port))
            }
            Family::V6 => {
                let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                let mut len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
                let rc = unsafe {
                    libc::getsockname(
                        self.fd.as_raw_fd(),
                        std::ptr::addr_of_mut!(addr) as *mut libc::sockaddr,
                        &mut len,
                    )
                };
                if rc < 0 {
                    return Err(Error::Io(std::io::Error::last_os_error()));
                }
                Ok(u16::from_be(addr.sin6_port))
            }
        }
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl DatagramIo for RawSocket {
    fn try_send_to(
        &self,
        addr: SocketAddr,
        buf: &[u8],
        pktinfo: Option<&Pktinfo>,
    ) -> std::io::Result<usize> {
        sendmsg_raw(self.fd.as_raw_fd(), addr, buf, pktinfo)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, Pktinfo)> {
        recvmsg_raw(self.fd.as_raw_fd(), buf)
    }
}

/// Async wrapper pairing a [`DatagramIo`] socket with an [`AsyncFd`] for use
/// in `tokio::select!`, matching the `try_io` retry-on-would-block loop the
/// teacher's netlink socket uses.
pub struct AsyncDatagram<T: DatagramIo + AsRawFd> {
    fd: AsyncFd<T>,
}

impl<T: DatagramIo + AsRawFd> AsyncDatagram<T> {
    pub fn new(inner: T) -> Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(inner)?,
        })
    }

    pub fn get_ref(&self) -> &T {
        self.fd.get_ref()
    }

    pub async fn send_to(
        &self,
        addr: SocketAddr,
        buf: &[u8],
        pktinfo: Option<&Pktinfo>,
    ) -> Result<usize> {
        loop {
            let mut guard = self.fd.ready(Interest::WRITABLE).await?;
            match guard.try_io(|inner| inner.get_ref().try_send_to(addr, buf, pktinfo)) {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr, Pktinfo)> {
        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;
            match guard.try_io(|inner| inner.get_ref().try_recv_from(buf)) {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn set_bool_opt(fd: &OwnedFd, level: i32, name: i32) -> Result<()> {
    let value: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            std::ptr::addr_of!(value) as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn bind_v4(fd: &OwnedFd, port: u16) -> Result<()> {
    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr { s_addr: 0 },
        sin_zero: [0; 8],
    };
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            std::ptr::addr_of!(addr) as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn bind_v6(fd: &OwnedFd, port: u16) -> Result<()> {
    let addr = libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: port.to_be(),
        sin6_flowinfo: 0,
        sin6_addr: libc::in6_addr { s6_addr: [0; 16] },
        sin6_scope_id: 0,
    };
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            std::ptr::addr_of!(addr) as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Control message buffer sized generously for an `in6_pktinfo` plus a
/// `timeval`, whichever combination of ancillary data the kernel sends.
const CMSG_BUF_LEN: usize = 256;

fn sendmsg_raw(
    fd: RawFd,
    addr: SocketAddr,
    buf: &[u8],
    pktinfo: Option<&Pktinfo>,
) -> std::io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
    let mut cmsg_len = 0usize;
    if let Some(info) = pktinfo {
        if let Some(v4) = info.to_in_pktinfo() {
            cmsg_len = write_cmsg(&mut cmsg_buf, libc::IPPROTO_IP, libc::IP_PKTINFO, &v4);
        } else if let Some(v6) = info.to_in6_pktinfo() {
            cmsg_len = write_cmsg(&mut cmsg_buf, libc::IPPROTO_IPV6, libc::IPV6_PKTINFO, &v6);
        }
    }

    let (mut sockaddr_storage, addr_len) = sockaddr_from(addr);

    let mut msg = libc::msghdr {
        msg_name: std::ptr::addr_of_mut!(sockaddr_storage) as *mut libc::c_void,
        msg_namelen: addr_len,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: if cmsg_len > 0 {
            cmsg_buf.as_mut_ptr() as *mut libc::c_void
        } else {
            std::ptr::null_mut()
        },
        msg_controllen: cmsg_len as _,
        msg_flags: 0,
    };

    // SAFETY: `msg` points at stack-local buffers sized and initialized
    // above for exactly the lifetime of this call.
    let sent = unsafe { libc::sendmsg(fd, &mut msg, 0) };
    if sent < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(sent as usize)
}

fn recvmsg_raw(fd: RawFd, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, Pktinfo)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

    let mut msg = libc::msghdr {
        msg_name: std::ptr::addr_of_mut!(storage) as *mut libc::c_void,
        msg_namelen: std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_buf.len() as _,
        msg_flags: 0,
    };

    // SAFETY: `buf`, `cmsg_buf` and `storage` all outlive this call and are
    // sized per the fields set above.
    let received = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if received < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let peer = sockaddr_to_std(&storage)?;
    let pktinfo = parse_cmsgs(&msg);

    Ok((received as usize, peer, pktinfo))
}

fn write_cmsg<T>(buf: &mut [u8], level: i32, opt_type: i32, payload: &T) -> usize {
    let cmsg_len = unsafe { libc::CMSG_SPACE(std::mem::size_of::<T>() as u32) } as usize;
    assert!(cmsg_len <= buf.len(), "cmsg buffer too small");

    let mhdr_ptr = buf.as_mut_ptr() as *mut libc::cmsghdr;
    unsafe {
        let cmsg = &mut *mhdr_ptr;
        cmsg.cmsg_level = level;
        cmsg.cmsg_type = opt_type;
        cmsg.cmsg_len = libc::CMSG_LEN(std::mem::size_of::<T>() as u32) as _;
        let data = libc::CMSG_DATA(mhdr_ptr) as *mut T;
        data.write_unaligned(std::ptr::read(payload));
    }
    cmsg_len
}

fn parse_cmsgs(msg: &libc::msghdr) -> Pktinfo {
    let mut info = Pktinfo::Empty;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };
        match (header.cmsg_level, header.cmsg_type) {
            (libc::IPPROTO_IP, libc::IP_PKTINFO) => {
                let data = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo) };
                info = Pktinfo::from_in_pktinfo(data);
            }
            (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) => {
                let data = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo) };
                info = Pktinfo::from_in6_pktinfo(data);
            }
            _ => {}
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    info
}

fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(
                    std::ptr::addr_of_mut!(storage) as *mut libc::sockaddr_in,
                    sockaddr,
                );
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sockaddr = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(
                    std::ptr::addr_of_mut!(storage) as *mut libc::sockaddr_in6,
                    sockaddr,
                );
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> std::io::Result<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::new(
                std::net::IpAddr::V4(std::net::Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes())),
                u16::from_be(addr.sin_port),
            ))
        }
        libc::AF_INET6 => {
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::new(
                std::net::IpAddr::V6(std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr)),
                u16::from_be(addr.sin6_port),
            ))
        }
        family => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported sockaddr family {family}"),
        )),
    }
}

/// An in-memory fake implementing [`DatagramIo`] for unit tests that don't
/// need a real socket, matching the role of the original's swappable
/// `tube_manager_set_socket_functions` hook.
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeSocket {
        inbox: Mutex<VecDeque<(Vec<u8>, SocketAddr, Pktinfo)>>,
        pub sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl FakeSocket {
        pub fn push_inbound(&self, data: Vec<u8>, from: SocketAddr, info: Pktinfo) {
            self.inbox.lock().unwrap().push_back((data, from, info));
        }
    }

    impl DatagramIo for FakeSocket {
        fn try_send_to(
            &self,
            addr: SocketAddr,
            buf: &[u8],
            _pktinfo: Option<&Pktinfo>,
        ) -> std::io::Result<usize> {
            self.sent.lock().unwrap().push((addr, buf.to_vec()));
            Ok(buf.len())
        }

        fn try_recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, Pktinfo)> {
            let mut inbox = self.inbox.lock().unwrap();
            match inbox.pop_front() {
                Some((data, from, info)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok((n, from, info))
                }
                None => Err(std::io::Error::from(std::io::ErrorKind::WouldBlock)),
            }
        }
    }
}
