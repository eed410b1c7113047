//! 终端文件描述符的非阻塞读写
//!
//! 标准输入输出不归本进程所有，这里只借用描述符，不负责关闭。

use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use tracing::debug;

/// 借用描述符的写端
#[derive(Debug, Clone, Copy)]
pub struct FdWriter(pub RawFd);

impl Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 借用描述符的读端
#[derive(Debug, Clone, Copy)]
pub struct FdReader(pub RawFd);

impl Read for FdReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

/// 把描述符切到 O_NONBLOCK，析构时恢复原来的标志
///
/// 描述符原本就是非阻塞的（例如终端的标准输入输出共用同一个打开文件，
/// 已被另一个守卫切换过）时什么都不做，析构时也不恢复。
#[derive(Debug)]
pub struct NonBlockingGuard {
    fd: RawFd,
    original: Option<libc::c_int>,
}

impl NonBlockingGuard {
    pub fn new(fd: RawFd) -> io::Result<Self> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK != 0 {
            debug!("描述符 {} 已经是非阻塞的", fd);
            return Ok(Self { fd, original: None });
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        debug!("描述符 {} 已切换为非阻塞", fd);
        Ok(Self {
            fd,
            original: Some(flags),
        })
    }
}

impl Drop for NonBlockingGuard {
    fn drop(&mut self) {
        if let Some(flags) = self.original {
            unsafe {
                libc::fcntl(self.fd, libc::F_SETFL, flags);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_nonblocking_read_and_restore() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();
        {
            let _guard = NonBlockingGuard::new(fd).unwrap();
            let mut buf = [0u8; 8];
            let err = FdReader(fd).read(&mut buf).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

            theirs.write_all(b"ping").unwrap();
            assert_eq!(FdReader(fd).read(&mut buf).unwrap(), 4);
            assert_eq!(&buf[..4], b"ping");

            assert_eq!(FdWriter(fd).write(b"pong").unwrap(), 4);
        }
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        let mut buf = [0u8; 4];
        theirs.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_shared_description_restored() {
        // dup 出来的描述符与原描述符共用文件状态标志，和终端的 0/1 一样
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();
        let dup = unsafe { libc::dup(fd) };
        assert!(dup >= 0);

        let guards = vec![NonBlockingGuard::new(fd).unwrap(), NonBlockingGuard::new(dup).unwrap()];
        let flags = unsafe { libc::fcntl(dup, libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        drop(guards);

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);
        unsafe {
            libc::close(dup);
        }
    }
}
