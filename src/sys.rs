//! Thin wrappers over the libc calls std does not expose.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

pub trait IsMinusOne {
    fn is_minus_one(&self) -> bool;
}

macro_rules! impl_is_minus_one {
    ($($t:ident)*) => ($(impl IsMinusOne for $t {
        fn is_minus_one(&self) -> bool {
            *self == -1
        }
    })*)
}

impl_is_minus_one! { i8 i16 i32 i64 isize }

pub fn cvt<T: IsMinusOne>(t: T) -> io::Result<T> {
    if t.is_minus_one() {
        Err(io::Error::last_os_error())
    } else {
        Ok(t)
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = cvt(libc::fcntl(fd, libc::F_GETFL))?;
        cvt(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
        let flags = cvt(libc::fcntl(fd, libc::F_GETFD))?;
        cvt(libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
    }
    Ok(())
}

/// Non-blocking, close-on-exec pipe as `(read end, write end)`.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    // Owned from here on so both ends close on any error below.
    let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_nonblocking_cloexec(fds[0])?;
    set_nonblocking_cloexec(fds[1])?;
    Ok((reader, writer))
}

/// Write a single wake-up byte. A full pipe already holds a pending wake-up.
pub fn wake(fd: RawFd) -> io::Result<()> {
    let byte = 1u8;
    match cvt(unsafe { libc::write(fd, (&byte as *const u8).cast(), 1) }) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(e),
    }
}

// Write end of the pipe the termination handler pokes; -1 while unset.
static TERMINATE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_terminate(_signum: libc::c_int) {
    let fd = TERMINATE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 1u8;
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
    }
}

/// Route SIGTERM and SIGINT to a wake-up byte on `fd`, and ignore SIGPIPE so
/// sending to a closed peer fails with `EPIPE` instead of killing the process.
///
/// `fd` must stay open for as long as the handlers are installed.
pub fn install_termination_handlers(fd: RawFd) -> io::Result<()> {
    TERMINATE_FD.store(fd, Ordering::Relaxed);

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_terminate as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        cvt(libc::sigemptyset(&mut action.sa_mask))?;
        for signum in [libc::SIGTERM, libc::SIGINT] {
            cvt(libc::sigaction(signum, &action, std::ptr::null_mut()))?;
        }

        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Detach the termination handlers from `fd` before it is closed.
pub fn release_termination_fd(fd: RawFd) {
    let _ = TERMINATE_FD.compare_exchange(fd, -1, Ordering::Relaxed, Ordering::Relaxed);
}
