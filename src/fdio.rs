// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Ancillary-data (`SCM_RIGHTS`) send/recv for a single attached fd (§4.4
//! SUPPLEMENT).
//!
//! Neither `mio` nor `std::os::unix::net` expose this, so the connection
//! module talks to the raw fd directly through `libc::sendmsg`/
//! `libc::recvmsg`, building the `msghdr`/`cmsghdr` by hand the way
//! `nagisa-sendfd` does. Unlike that crate's generic N-fd support, a frame
//! here carries at most one fd, so the control buffer is a fixed-size,
//! correctly aligned stack array rather than a per-call heap allocation.

use std::io::{self, IoSlice};
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// Comfortably larger than the ~20-32 bytes `CMSG_SPACE(size_of::<RawFd>())`
/// needs on Linux or BSD.
#[repr(align(8))]
struct CmsgBuf([u8; 64]);

/// Writes `iov` to `fd`, attaching `attached` as an `SCM_RIGHTS` ancillary fd
/// when present. Ownership of `attached` is not taken here — the caller
/// closes its own copy once the kernel has accepted the message (§4.3:
/// "ownership transfers into the kernel and the local fd is closed").
pub fn send_vectored_with_fd(fd: RawFd, iov: &[IoSlice<'_>], attached: Option<RawFd>) -> io::Result<usize> {
    let mut cmsg_buf = CmsgBuf([0u8; 64]);

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = iov.len() as _;

    if let Some(raw_fd) = attached {
        let cmsg_len = unsafe { libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) } as usize;
        let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
        assert!(cmsg_space <= cmsg_buf.0.len(), "cmsg control buffer too small");

        msg.msg_control = cmsg_buf.0.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space as _;

        unsafe {
            let hdr = libc::CMSG_FIRSTHDR(&msg);
            (*hdr).cmsg_level = libc::SOL_SOCKET;
            (*hdr).cmsg_type = libc::SCM_RIGHTS;
            (*hdr).cmsg_len = cmsg_len as _;
            ptr::write_unaligned(libc::CMSG_DATA(hdr) as *mut RawFd, raw_fd);
        }
    }

    let sent = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
    if sent < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(sent as usize)
    }
}

/// Reads into `buf`, returning the byte count and at most one received
/// `SCM_RIGHTS` fd. `Ok((0, _))` with `buf` non-empty means EOF.
pub fn recv_with_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut cmsg_buf = CmsgBuf([0u8; 64]);

    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.0.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.0.len() as _;

    let received = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut received_fd = None;
    unsafe {
        let mut hdr = libc::CMSG_FIRSTHDR(&msg);
        while !hdr.is_null() {
            if (*hdr).cmsg_level == libc::SOL_SOCKET && (*hdr).cmsg_type == libc::SCM_RIGHTS {
                let raw = ptr::read_unaligned(libc::CMSG_DATA(hdr) as *const RawFd);
                received_fd = Some(OwnedFd::from_raw_fd(raw));
                break;
            }
            hdr = libc::CMSG_NXTHDR(&msg, hdr);
        }
    }

    Ok((received as usize, received_fd))
}
