//! The raw socket `ip_tables` is driven through

use std::io;
use std::os::fd::RawFd;

/// `getsockopt`/`setsockopt` at level `SOL_IP`. Implemented by the real
/// socket and by [`crate::MemoryKernel`].
pub trait Sockopt {
    /// Fill `buf` (which carries the request on entry) and return the
    /// number of bytes the kernel wrote
    fn get(&mut self, optname: i32, buf: &mut [u8]) -> io::Result<usize>;

    fn set(&mut self, optname: i32, buf: &[u8]) -> io::Result<()>;
}

/// `socket(AF_INET, SOCK_RAW, IPPROTO_RAW)`; needs CAP_NET_ADMIN to do
/// anything useful
pub struct RawSocket {
    fd: RawFd,
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl RawSocket {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_RAW) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }
}

impl Sockopt for RawSocket {
    fn get(&mut self, optname: i32, buf: &mut [u8]) -> io::Result<usize> {
        let mut len = buf.len() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_IP,
                optname,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(len as usize)
    }

    fn set(&mut self, optname: i32, buf: &[u8]) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_IP,
                optname,
                buf.as_ptr() as *const libc::c_void,
                buf.len() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
