//! Raw socket plumbing: option setters, SCTP stream sockets and the
//! best-effort ARP lookup behind `Broker::mac()`.

use std::net::{IpAddr, SocketAddr};

use crate::errors::{Error, Result};

/// Keep-alive parameters applied on connect when the OS supports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KeepAlive {
    pub probes: u32,
    pub idle_s: u32,
    pub interval_s: u32,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            probes: 3,
            idle_s: 30,
            interval_s: 5,
        }
    }
}

#[cfg(unix)]
mod unix_imp {
    use super::*;
    use std::os::fd::RawFd;

    fn set_opt_i32(fd: RawFd, level: i32, option: i32, value: i32) -> Result<()> {
        // SAFETY: setsockopt with a valid i32 payload on a live fd.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                option,
                (&value as *const i32).cast(),
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(Error::transport(format!(
                "setsockopt({level},{option}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// SO_REUSEADDR, applied to every listener.
    pub fn set_reuse_addr(fd: RawFd, on: bool) -> Result<()> {
        set_opt_i32(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as i32)
    }

    /// SO_KEEPALIVE plus the probe/idle/interval knobs.
    pub fn set_keep_alive(fd: RawFd, config: KeepAlive) -> Result<()> {
        set_opt_i32(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
        #[cfg(target_os = "linux")]
        {
            set_opt_i32(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, config.probes as i32)?;
            set_opt_i32(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, config.idle_s as i32)?;
            set_opt_i32(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPINTVL,
                config.interval_s as i32,
            )?;
        }
        Ok(())
    }

    /// IPV6_V6ONLY toggle for dual-stack listeners.
    pub fn set_ipv6_only(fd: RawFd, on: bool) -> Result<()> {
        set_opt_i32(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, on as i32)
    }

    /// SO_RCVBUF / SO_SNDBUF.
    pub fn set_buffer_sizes(fd: RawFd, read: usize, write: usize) -> Result<()> {
        if read > 0 {
            set_opt_i32(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, read as i32)?;
        }
        if write > 0 {
            set_opt_i32(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, write as i32)?;
        }
        Ok(())
    }

    /// O_NONBLOCK toggle; reactor-managed fds always run non-blocking.
    pub fn set_blocking(fd: RawFd, blocking: bool) -> Result<()> {
        // SAFETY: fcntl flag surgery on a live fd.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 {
                return Err(Error::transport(format!(
                    "fcntl(F_GETFL) failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            let flags = if blocking {
                flags & !libc::O_NONBLOCK
            } else {
                flags | libc::O_NONBLOCK
            };
            if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
                return Err(Error::transport(format!(
                    "fcntl(F_SETFL) failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }
        Ok(())
    }

    fn raw_stream_socket(addr: &SocketAddr, protocol: i32) -> Result<RawFd> {
        let family = if addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        // SAFETY: socket(2); result checked below.
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, protocol) };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            return Err(Error::os_broken(format!(
                "stream socket (proto {protocol}) unavailable: {err}"
            )));
        }
        Ok(fd)
    }

    fn sockaddr_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
        // SAFETY: zeroed sockaddr_storage is a valid all-zero pattern.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                // SAFETY: sockaddr_in fits in sockaddr_storage.
                unsafe {
                    std::ptr::write((&mut storage as *mut libc::sockaddr_storage).cast(), sin)
                };
                std::mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: v6.scope_id(),
                };
                // SAFETY: sockaddr_in6 fits in sockaddr_storage.
                unsafe {
                    std::ptr::write((&mut storage as *mut libc::sockaddr_storage).cast(), sin6)
                };
                std::mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as libc::socklen_t)
    }

    /// Opens a non-blocking stream socket and starts the connect; the
    /// caller watches writability for completion. `protocol` 0 is TCP,
    /// `IPPROTO_SCTP` a one-to-one SCTP stream.
    pub fn stream_connect_fd(addr: &SocketAddr, protocol: i32) -> Result<RawFd> {
        let fd = raw_stream_socket(addr, protocol)?;
        set_blocking(fd, false)?;
        let (storage, len) = sockaddr_storage(addr);
        // SAFETY: valid sockaddr for the fd we created.
        let rc = unsafe {
            libc::connect(fd, (&storage as *const libc::sockaddr_storage).cast(), len)
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                // SAFETY: closing the fd we created.
                unsafe { libc::close(fd) };
                return Err(Error::transport(format!("connect failed: {err}")));
            }
        }
        Ok(fd)
    }

    /// Binds and listens on a non-blocking stream socket with SO_REUSEADDR.
    pub fn stream_listen_fd(
        addr: &SocketAddr,
        backlog: i32,
        protocol: i32,
        ipv6_only: Option<bool>,
    ) -> Result<RawFd> {
        let fd = raw_stream_socket(addr, protocol)?;
        set_reuse_addr(fd, true)?;
        if let Some(on) = ipv6_only {
            if addr.is_ipv6() {
                set_ipv6_only(fd, on)?;
            }
        }
        set_blocking(fd, false)?;
        let (storage, len) = sockaddr_storage(addr);
        // SAFETY: valid sockaddr for the fd we created.
        let rc = unsafe {
            libc::bind(fd, (&storage as *const libc::sockaddr_storage).cast(), len)
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: closing the fd we created.
            unsafe { libc::close(fd) };
            return Err(Error::transport(format!("bind failed: {err}")));
        }
        // SAFETY: listen on the bound fd.
        if unsafe { libc::listen(fd, backlog) } != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: closing the fd we created.
            unsafe { libc::close(fd) };
            return Err(Error::transport(format!("listen failed: {err}")));
        }
        Ok(fd)
    }

    /// Pending asynchronous-connect error, if the connect failed.
    pub fn take_connect_error(fd: RawFd) -> Result<Option<std::io::Error>> {
        let mut value: i32 = 0;
        let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
        // SAFETY: reading SO_ERROR into a properly sized out parameter.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&mut value as *mut i32).cast(),
                &mut len,
            )
        };
        if rc != 0 {
            return Err(Error::transport(format!(
                "getsockopt(SO_ERROR) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        if value == 0 {
            Ok(None)
        } else {
            Ok(Some(std::io::Error::from_raw_os_error(value)))
        }
    }
}

#[cfg(unix)]
pub use unix_imp::*;

/// Best-effort MAC address of a LAN peer from the system ARP table.
///
/// Only IPv4 neighbors present in `/proc/net/arp` resolve; everything else
/// (IPv6, off-link peers, non-Linux hosts) yields `None` and the broker
/// reports an empty MAC.
pub fn arp_lookup(ip: &IpAddr) -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        let IpAddr::V4(v4) = ip else { return None };
        let table = std::fs::read_to_string("/proc/net/arp").ok()?;
        let needle = v4.to_string();
        for line in table.lines().skip(1) {
            let mut columns = line.split_whitespace();
            let addr = columns.next()?;
            if addr != needle {
                continue;
            }
            let mac = columns.nth(2)?;
            if mac != "00:00:00:00:00:00" {
                return Some(mac.to_string());
            }
        }
        None
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = ip;
        None
    }
}
