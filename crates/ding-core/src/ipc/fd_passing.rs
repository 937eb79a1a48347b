//! Descriptor passing over a Unix stream socket via `SCM_RIGHTS`
//!
//!
//! Used once per successful `build` request: the root process sends the
//! stdout read-end, stderr read-end, and a status pipe read-end to the
//! worker in a single ancillary-data message.

#![cfg(unix)]

use std::io;
use std::mem::{size_of, MaybeUninit};
use std::os::fd::RawFd;

/// Maximum descriptors passed in one message; the driver always sends
/// exactly three (stdout, stderr, status).
pub const MAX_FDS: usize = 3;

/// Sends `fds` as ancillary data alongside a single marker byte.
pub fn send_fds(socket_fd: RawFd, fds: &[RawFd]) -> io::Result<()> {
    assert!(!fds.is_empty() && fds.len() <= MAX_FDS);

    let cmsg_space = unsafe { libc::CMSG_SPACE((fds.len() * size_of::<RawFd>()) as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut marker = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: marker.as_mut_ptr() as *mut libc::c_void,
        iov_len: marker.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::new(io::ErrorKind::Other, "no cmsg buffer"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * size_of::<RawFd>()) as u32) as _;
        std::ptr::copy_nonoverlapping(
            fds.as_ptr(),
            libc::CMSG_DATA(cmsg) as *mut RawFd,
            fds.len(),
        );
    }

    let sent = unsafe { libc::sendmsg(socket_fd, &msg, 0) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receives up to `max` descriptors sent by [`send_fds`].
pub fn recv_fds(socket_fd: RawFd, max: usize) -> io::Result<Vec<RawFd>> {
    assert!(max > 0 && max <= MAX_FDS);

    let cmsg_space = unsafe { libc::CMSG_SPACE((max * size_of::<RawFd>()) as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut marker = MaybeUninit::<[u8; 1]>::uninit();
    let mut iov = libc::iovec {
        iov_base: marker.as_mut_ptr() as *mut libc::c_void,
        iov_len: 1,
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let received = unsafe { libc::recvmsg(socket_fd, &mut msg, 0) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }
    if received == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "descriptor socket closed before any fds arrived",
        ));
    }

    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                    / size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count.min(max) {
                    fds.push(std::ptr::read_unaligned(data.add(i)));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if fds.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no descriptors received in ancillary data",
        ));
    }
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn round_trips_three_descriptors() {
        let (a, b) = UnixDatagram::pair().unwrap();

        let f0 = tempfile::tempfile().unwrap();
        let f1 = tempfile::tempfile().unwrap();
        let f2 = tempfile::tempfile().unwrap();
        let fds = [f0.as_raw_fd(), f1.as_raw_fd(), f2.as_raw_fd()];

        send_fds(a.as_raw_fd(), &fds).unwrap();
        let received = recv_fds(b.as_raw_fd(), 3).unwrap();
        assert_eq!(received.len(), 3);

        for fd in received {
            unsafe { libc::close(fd) };
        }
    }
}
