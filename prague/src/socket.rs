// Copyright (C) 2025, the prague authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! ECN-aware UDP datagram socket.
//!
//! Receives read the per-packet ECN codepoint from the IP TOS / IPv6
//! traffic-class control message; sends apply it through a cached `IP_TOS`
//! (`IPV6_TCLASS`) socket option that is only reset when the codepoint
//! changes. The cache is per-socket. Timeouts are expressed in
//! microseconds and served by `ppoll`.

use std::io;
use std::mem;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::net::UdpSocket;
use std::os::unix::io::AsRawFd;

use crate::Ecn;
use crate::TimeUs;

mod cmsg {
    //! Minimal control-message iteration for `recvmsg`.

    #[derive(Copy, Clone)]
    #[repr(align(8))] // Conservative bound for align_of<cmsghdr>
    pub struct Aligned<T>(pub T);

    pub struct Iter<'a> {
        hdr: &'a libc::msghdr,
        cmsg: Option<&'a libc::cmsghdr>,
    }

    impl<'a> Iter<'a> {
        /// # Safety
        ///
        /// `hdr.msg_control` must point to memory outliving `'a` which can
        /// be soundly read for the lifetime of the constructed `Iter` and
        /// contains a buffer of cmsgs, i.e. is aligned for `cmsghdr`, is
        /// fully initialized, and has correct internal links.
        pub unsafe fn new(hdr: &'a libc::msghdr) -> Self {
            Self {
                hdr,
                cmsg: libc::CMSG_FIRSTHDR(hdr).as_ref(),
            }
        }
    }

    impl<'a> Iterator for Iter<'a> {
        type Item = &'a libc::cmsghdr;

        fn next(&mut self) -> Option<&'a libc::cmsghdr> {
            let current = self.cmsg.take()?;
            self.cmsg =
                unsafe { libc::CMSG_NXTHDR(self.hdr, current).as_ref() };
            Some(current)
        }
    }
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            let sin = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in)
            };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        },

        libc::AF_INET6 => {
            let sin6 = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        },

        _ => None,
    }
}

/// A UDP socket with per-packet ECN on both directions.
pub struct UdpEcnSocket {
    io: UdpSocket,
    current_ecn: Ecn,
    peer: Option<SocketAddr>,
    connected: bool,
    v6: bool,
}

impl UdpEcnSocket {
    /// Binds to the given local address and waits for a peer; replies go
    /// to the source of the last received datagram.
    pub fn bind(local: SocketAddr) -> io::Result<UdpEcnSocket> {
        let io = UdpSocket::bind(local)?;
        UdpEcnSocket::setup(io, false)
    }

    /// Binds an ephemeral port and connects to the given peer.
    pub fn connect(peer: SocketAddr) -> io::Result<UdpEcnSocket> {
        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let io = UdpSocket::bind(local)?;
        io.connect(peer)?;

        let mut socket = UdpEcnSocket::setup(io, true)?;
        socket.peer = Some(peer);
        Ok(socket)
    }

    fn setup(io: UdpSocket, connected: bool) -> io::Result<UdpEcnSocket> {
        let v6 = io.local_addr()?.is_ipv6();

        // Ask the kernel for the TOS / traffic class of every datagram.
        let (level, option) = if v6 {
            (libc::IPPROTO_IPV6, libc::IPV6_RECVTCLASS)
        } else {
            (libc::IPPROTO_IP, libc::IP_RECVTOS)
        };

        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                io.as_raw_fd(),
                level,
                option,
                &on as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(UdpEcnSocket {
            io,
            current_ecn: Ecn::NotEct,
            peer: None,
            connected,
            v6,
        })
    }

    /// Returns the local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }

    /// Returns the connected or last-seen peer address.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn wait_readable(&self, timeout: TimeUs) -> io::Result<bool> {
        let mut fds = [libc::pollfd {
            fd: self.io.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];

        let ts = libc::timespec {
            tv_sec: (timeout / 1_000_000) as libc::time_t,
            tv_nsec: libc::c_long::from(timeout % 1_000_000) * 1_000,
        };

        let rc = unsafe {
            libc::ppoll(fds.as_mut_ptr(), 1, &ts, std::ptr::null())
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        Ok(rc > 0 && fds[0].revents & libc::POLLIN != 0)
    }

    /// Receives one datagram and its ECN codepoint.
    ///
    /// A `timeout` of 0 blocks until a datagram arrives; a positive
    /// timeout waits at most that many microseconds and returns
    /// `(0, NotEct)` when it expires.
    pub fn recv(
        &mut self, buf: &mut [u8], timeout: TimeUs,
    ) -> io::Result<(usize, Ecn)> {
        if timeout > 0 && !self.wait_readable(timeout)? {
            return Ok((0, Ecn::NotEct));
        }

        loop {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut control = cmsg::Aligned([0u8; 64]);

            let mut iov = libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            };

            let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
            hdr.msg_name =
                &mut storage as *mut libc::sockaddr_storage as *mut libc::c_void;
            hdr.msg_namelen =
                mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            hdr.msg_iov = &mut iov;
            hdr.msg_iovlen = 1;
            hdr.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
            hdr.msg_controllen = mem::size_of_val(&control.0) as _;

            let n = unsafe { libc::recvmsg(self.io.as_raw_fd(), &mut hdr, 0) };

            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,

                    // Spurious wakeup; report it like a timeout and let
                    // the caller's receive loop decide.
                    io::ErrorKind::WouldBlock => return Ok((0, Ecn::NotEct)),

                    _ => return Err(err),
                }
            }

            let mut ecn = Ecn::NotEct;
            for c in unsafe { cmsg::Iter::new(&hdr) } {
                if c.cmsg_level == libc::IPPROTO_IP &&
                    c.cmsg_type == libc::IP_TOS
                {
                    ecn = Ecn::from_bits(unsafe { *libc::CMSG_DATA(c) });
                } else if c.cmsg_level == libc::IPPROTO_IPV6 &&
                    c.cmsg_type == libc::IPV6_TCLASS
                {
                    let tclass = unsafe {
                        std::ptr::read_unaligned(
                            libc::CMSG_DATA(c) as *const libc::c_int
                        )
                    };
                    ecn = Ecn::from_bits(tclass as u8);
                }
            }

            if !self.connected {
                if let Some(from) = sockaddr_to_std(&storage) {
                    self.peer = Some(from);
                }
            }

            return Ok((n as usize, ecn));
        }
    }

    fn set_tos(&self, ecn: Ecn) -> io::Result<()> {
        let (level, option) = if self.v6 {
            (libc::IPPROTO_IPV6, libc::IPV6_TCLASS)
        } else {
            (libc::IPPROTO_IP, libc::IP_TOS)
        };

        let tos = ecn as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                self.io.as_raw_fd(),
                level,
                option,
                &tos as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Sends one datagram with the given ECN codepoint.
    ///
    /// Spurious `EAGAIN` and `EINTR` are retried.
    pub fn send(&mut self, buf: &[u8], ecn: Ecn) -> io::Result<usize> {
        if ecn != self.current_ecn {
            self.set_tos(ecn)?;
            self.current_ecn = ecn;
        }

        loop {
            let res = if self.connected {
                self.io.send(buf)
            } else {
                match self.peer {
                    Some(peer) => self.io.send_to(buf, peer),

                    None =>
                        return Err(io::Error::new(
                            io::ErrorKind::NotConnected,
                            "no peer address known yet",
                        )),
                }
            };

            match res {
                Err(ref e)
                    if e.kind() == io::ErrorKind::Interrupted ||
                        e.kind() == io::ErrorKind::WouldBlock =>
                    continue,

                other => return other,
            }
        }
    }
}
