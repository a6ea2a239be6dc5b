//! Per-fd context table
//!
//! The hook layer needs three facts about an fd without a syscall on the
//! hot path: is it a socket, did the application itself ask for
//! non-blocking mode, and what are its recv/send timeouts. Contexts are
//! created lazily on first touch and dropped on close.
//!
//! Invariant: every socket's kernel flag is forced to `O_NONBLOCK` at
//! context creation (`sys_nonblock`), while `user_nonblock` tracks only
//! what the application requested. The fcntl/ioctl wrappers in the hook
//! layer reconcile the two so user code keeps seeing its own view.
//!
//! Timeouts are stored here in milliseconds and never forwarded to the
//! kernel; the hook layer enforces them with timers.

use log::trace;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Which timeout a hooked call consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Receive side (`SO_RCVTIMEO`)
    Recv,
    /// Send side (`SO_SNDTIMEO`)
    Send,
}

const NO_TIMEOUT: u64 = u64::MAX;

/// Framework-private state for one fd.
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let ctx = FdCtx {
            fd,
            is_socket: false,
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        };
        ctx.init()
    }

    fn init(mut self) -> FdCtx {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut st) } == 0 {
            self.is_socket = (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        }

        if self.is_socket {
            // sockets always run non-blocking at the kernel level; the
            // user's own view is kept in user_nonblock
            let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe {
                    libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            self.sys_nonblock.store(true, Ordering::Relaxed);
        }
        trace!("fd context created for {} (socket={})", self.fd, self.is_socket);
        self
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Relaxed);
    }

    /// Timeout in ms for one direction, None when unset.
    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let raw = match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Relaxed),
        };
        (raw != NO_TIMEOUT).then_some(raw)
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: Option<u64>) {
        let raw = ms.unwrap_or(NO_TIMEOUT);
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(raw, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.store(raw, Ordering::Relaxed),
        }
    }
}

/// Process-wide fd context table, indexed by fd value.
pub struct FdManager {
    ctxs: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

static FD_MANAGER: Lazy<FdManager> = Lazy::new(|| FdManager {
    ctxs: RwLock::new(vec![None; 64]),
});

impl FdManager {
    /// The process-wide instance, created on first access and never torn
    /// down.
    pub fn instance() -> &'static FdManager {
        &FD_MANAGER
    }

    /// Look up the context for `fd`, creating it when `auto_create`.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let ctxs = self.ctxs.read();
            if let Some(Some(ctx)) = ctxs.get(idx) {
                return Some(ctx.clone());
            }
        }
        if !auto_create {
            return None;
        }

        let mut ctxs = self.ctxs.write();
        if idx >= ctxs.len() {
            ctxs.resize((idx + 1) * 3 / 2, None);
        }
        if let Some(ctx) = &ctxs[idx] {
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdCtx::new(fd));
        ctxs[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Release the slot for `fd`. Outstanding context handles observe
    /// the closed flag.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut ctxs = self.ctxs.write();
        if let Some(slot) = ctxs.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.set_closed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_socket() -> RawFd {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fd
    }

    #[test]
    fn test_socket_forced_nonblocking() {
        let fd = tcp_socket();
        let ctx = FdManager::instance().get(fd, true).unwrap();

        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        assert!(!ctx.is_closed());

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0, "kernel flag must be forced");

        FdManager::instance().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_non_socket_untouched() {
        // stdin-like plain fd: use a pipe end
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = FdManager::instance().get(fds[0], true).unwrap();

        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());

        FdManager::instance().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_get_without_create() {
        // far beyond anything this test process opened
        assert!(FdManager::instance().get(1_000_000, false).is_none());
        assert!(FdManager::instance().get(-1, true).is_none());
    }

    #[test]
    fn test_timeouts_stored_not_propagated() {
        let fd = tcp_socket();
        let ctx = FdManager::instance().get(fd, true).unwrap();

        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);
        ctx.set_timeout(TimeoutKind::Recv, Some(300));
        ctx.set_timeout(TimeoutKind::Send, Some(500));
        assert_eq!(ctx.timeout(TimeoutKind::Recv), Some(300));
        assert_eq!(ctx.timeout(TimeoutKind::Send), Some(500));

        // the kernel never sees the timeout
        let mut tv = libc::timeval {
            tv_sec: 9,
            tv_usec: 9,
        };
        let mut len = std::mem::size_of::<libc::timeval>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &mut tv as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(tv.tv_sec, 0);
        assert_eq!(tv.tv_usec, 0);

        ctx.set_timeout(TimeoutKind::Recv, None);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);

        FdManager::instance().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_del_marks_closed() {
        let fd = tcp_socket();
        let ctx = FdManager::instance().get(fd, true).unwrap();
        FdManager::instance().del(fd);

        assert!(ctx.is_closed());
        assert!(FdManager::instance().get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }
}
