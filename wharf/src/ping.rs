//! ICMP echo: packet codec and an unprivileged datagram-ICMP socket.
//!
//! Only the socket semantics live here; there is no interactive utility.
//! On Linux the socket uses `IPPROTO_ICMP` with `SOCK_DGRAM`, which needs no
//! elevated privileges when `net.ipv4.ping_group_range` allows it.

use std::time::Duration;

use crate::errors::{Error, Result};

const ECHO_REQUEST: u8 = 8;
const ECHO_REPLY: u8 = 0;

/// One echo request/reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoPacket {
    pub ident: u16,
    pub seq: u16,
    pub payload: Vec<u8>,
}

/// RFC 1071 ones-complement checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let Some(&last) = chunks.remainder().first() {
        sum += (last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

impl EchoPacket {
    /// Serializes an echo request with a valid checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.payload.len());
        out.push(ECHO_REQUEST);
        out.push(0);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.ident.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.payload);
        let sum = checksum(&out);
        out[2..4].copy_from_slice(&sum.to_be_bytes());
        out
    }

    /// Parses an echo request or reply, verifying the checksum.
    pub fn decode(packet: &[u8]) -> Result<(Self, bool)> {
        if packet.len() < 8 {
            return Err(Error::protocol("short icmp packet"));
        }
        let kind = packet[0];
        if kind != ECHO_REQUEST && kind != ECHO_REPLY {
            return Err(Error::protocol(format!("not an echo packet: type {kind}")));
        }
        if checksum(packet) != 0 {
            return Err(Error::protocol("icmp checksum mismatch"));
        }
        Ok((
            Self {
                ident: u16::from_be_bytes([packet[4], packet[5]]),
                seq: u16::from_be_bytes([packet[6], packet[7]]),
                payload: packet[8..].to_vec(),
            },
            kind == ECHO_REPLY,
        ))
    }
}

#[cfg(target_os = "linux")]
pub use linux::Pinger;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::net::Ipv4Addr;
    use std::os::fd::{AsRawFd, RawFd};
    use std::time::Instant;

    use tokio::io::unix::AsyncFd;
    use tokio::io::Interest;
    use tokio::time::timeout;
    use tracing::trace;

    struct IcmpSocket(RawFd);

    impl AsRawFd for IcmpSocket {
        fn as_raw_fd(&self) -> RawFd {
            self.0
        }
    }

    impl Drop for IcmpSocket {
        fn drop(&mut self) {
            // SAFETY: fd owned by this socket and closed exactly once.
            unsafe { libc::close(self.0) };
        }
    }

    /// Unprivileged ICMPv4 echo sender.
    pub struct Pinger {
        io: AsyncFd<IcmpSocket>,
        seq: u16,
    }

    impl Pinger {
        pub fn new() -> Result<Self> {
            // SAFETY: creating a datagram ICMP socket; result is checked.
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_ICMP) };
            if fd < 0 {
                let err = std::io::Error::last_os_error();
                return Err(Error::os_broken(format!(
                    "datagram icmp socket unavailable: {err}"
                )));
            }
            // SAFETY: setting O_NONBLOCK on the fd we just created.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
            let io = AsyncFd::with_interest(IcmpSocket(fd), Interest::READABLE)?;
            Ok(Self { io, seq: 0 })
        }

        /// Sends one echo request and waits for the matching reply.
        pub async fn ping(&mut self, addr: Ipv4Addr, wait: Duration) -> Result<Duration> {
            self.seq = self.seq.wrapping_add(1);
            let seq = self.seq;
            let packet = EchoPacket {
                // The kernel rewrites the ident for datagram ICMP sockets.
                ident: 0,
                seq,
                payload: b"wharf-echo".to_vec(),
            }
            .encode();

            let dest = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: 0,
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.octets()),
                },
                sin_zero: [0; 8],
            };
            let fd = self.io.get_ref().as_raw_fd();
            // SAFETY: valid buffer and sockaddr for the open fd.
            let sent = unsafe {
                libc::sendto(
                    fd,
                    packet.as_ptr().cast(),
                    packet.len(),
                    0,
                    (&dest as *const libc::sockaddr_in).cast(),
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            if sent < 0 {
                return Err(Error::transport(format!(
                    "icmp send failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            let started = Instant::now();

            timeout(wait, self.await_reply(seq))
                .await
                .map_err(|_| Error::timeout(format!("no echo reply from {addr}")))??;
            Ok(started.elapsed())
        }

        async fn await_reply(&self, seq: u16) -> Result<()> {
            let mut buf = [0u8; 1500];
            loop {
                let mut guard = self.io.readable().await?;
                let fd = self.io.get_ref().as_raw_fd();
                // SAFETY: reading into a stack buffer on the open fd.
                let read =
                    unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
                if read < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::WouldBlock {
                        guard.clear_ready();
                        continue;
                    }
                    return Err(Error::transport(format!("icmp recv failed: {err}")));
                }
                match EchoPacket::decode(&buf[..read as usize]) {
                    Ok((packet, true)) if packet.seq == seq => return Ok(()),
                    Ok(_) => trace!("unrelated icmp packet ignored"),
                    Err(_) => trace!("undecodable icmp packet ignored"),
                }
            }
        }
    }
}
