//! Blocking-call interception
//!
//! Straight-line blocking code becomes cooperative here: each wrapper
//! issues the real (non-blocking) syscall and, on would-block, parks the
//! calling fiber on the reactor until readiness, cancellation or a
//! timeout. Call sites keep libc shapes and errno semantics; a wrapper
//! never remaps a syscall error.
//!
//! Interception is per-thread (`tls::hook_enabled`, switched on by the
//! dispatch loop) and per-fd (only sockets the fd table knows about, and
//! only while the application has not asked for non-blocking mode
//! itself). Everything else falls through to the raw syscall.
//!
//! The retry loop for one hooked call:
//!
//! 1. issue the syscall, restarting on EINTR
//! 2. anything but EAGAIN resolves the call
//! 3. on EAGAIN: arm an optional timeout timer, bind the fiber to the
//!    fd event, yield
//! 4. resumed: timer cancelled; a timeout resolves with ETIMEDOUT,
//!    otherwise go to 1

use crate::fd_manager::{FdManager, TimeoutKind};
use crate::iomanager::{Event, IoManager};
use log::{debug, error, warn};
use once_cell::sync::Lazy;
use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_runtime::{config, tls, Fiber};

/// Whether blocking-call interception is active on this thread.
pub fn is_hook_enabled() -> bool {
    tls::hook_enabled()
}

/// Toggle interception for this thread. The dispatch loop enables it on
/// every worker; user threads stay un-hooked unless they opt in.
pub fn set_hook_enable(enabled: bool) {
    tls::set_hook_enabled(enabled);
}

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(v: i32) {
    unsafe { *libc::__errno_location() = v };
}

/// Process-wide default connect deadline, kept in sync with the
/// `tcp.connect.timeout` config var.
static CONNECT_TIMEOUT_MS: Lazy<Arc<AtomicU64>> = Lazy::new(|| {
    let var = config::lookup::<u64>("tcp.connect.timeout", 5000);
    let cached = Arc::new(AtomicU64::new(var.get()));
    let c = cached.clone();
    var.add_listener(move |old, new| {
        debug!("tcp.connect.timeout changed {} -> {}", old, new);
        c.store(*new, Ordering::Relaxed);
    });
    cached
});

/// Current default connect timeout in milliseconds.
pub fn connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT_MS.load(Ordering::Relaxed)
}

/// Per-call wake record. A timeout timer holds a weak reference; writing
/// ETIMEDOUT here and cancelling the event resolves the parked call.
#[derive(Default)]
struct WakeInfo {
    cancelled: AtomicI32,
}

/// Shared retry loop for every data-path wrapper.
fn do_io<F>(fd: RawFd, name: &'static str, event: Event, dir: TimeoutKind, mut call: F) -> isize
where
    F: FnMut() -> isize,
{
    if !tls::hook_enabled() {
        return call();
    }
    let Some(ctx) = FdManager::instance().get(fd, false) else {
        return call();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return call();
    }

    let timeout = ctx.timeout(dir);
    let winfo = Arc::new(WakeInfo::default());

    loop {
        let mut n = call();
        while n == -1 && errno() == libc::EINTR {
            n = call();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        let Some(iom) = IoManager::current() else {
            warn!("{} would block on fd {} outside a reactor thread", name, fd);
            return n;
        };

        let timer = timeout.map(|ms| {
            let weak = Arc::downgrade(&winfo);
            let iomw = Arc::downgrade(&iom);
            let winfo_any: Arc<dyn Any + Send + Sync> = winfo.clone();
            let cond: std::sync::Weak<dyn Any + Send + Sync> = Arc::downgrade(&winfo_any);
            iom.add_conditional_timer(
                ms,
                false,
                move || {
                    let Some(info) = weak.upgrade() else {
                        return;
                    };
                    if info.cancelled.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    info.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    if let Some(iom) = iomw.upgrade() {
                        iom.cancel_event(fd, event);
                    }
                },
                cond,
            )
        });

        if let Err(e) = iom.add_event(fd, event) {
            error!("{} add_event({}, {:?}) failed: {}", name, fd, event, e);
            if let Some(t) = &timer {
                t.cancel();
            }
            return -1;
        }

        Fiber::yield_now();

        if let Some(t) = &timer {
            t.cancel();
        }
        let cancelled = winfo.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // woken by readiness or a forced cancel: retry the syscall
    }
}

// ── sleep family ──

fn sleep_in_fiber(ms: u64) -> bool {
    if !tls::hook_enabled() {
        return false;
    }
    let Some(iom) = IoManager::current() else {
        return false;
    };
    let fiber = Fiber::current();
    let sched = tls::current_scheduler_weak();
    iom.add_timer(ms, false, move || {
        if let Some(s) = sched.upgrade() {
            s.schedule_fiber(fiber.clone());
        }
    });
    Fiber::yield_now();
    true
}

/// Cooperative `sleep`. Outside a reactor thread this blocks the OS
/// thread like the real call.
pub fn sleep(seconds: u32) -> u32 {
    if !sleep_in_fiber(seconds as u64 * 1000) {
        std::thread::sleep(Duration::from_secs(seconds as u64));
    }
    0
}

/// Cooperative `usleep`.
pub fn usleep(usec: u64) -> i32 {
    if !sleep_in_fiber(usec / 1000) {
        std::thread::sleep(Duration::from_micros(usec));
    }
    0
}

/// Cooperative `nanosleep` over a duration; always sleeps the full
/// request, there is no EINTR-style early return to report.
pub fn nanosleep(dur: Duration) -> i32 {
    if !sleep_in_fiber(dur.as_millis() as u64) {
        std::thread::sleep(dur);
    }
    0
}

/// Millisecond convenience over the sleep family.
pub fn sleep_ms(ms: u64) {
    if !sleep_in_fiber(ms) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

// ── socket lifecycle ──

/// `socket`, registering the new fd in the context table.
pub fn socket(domain: i32, ty: i32, protocol: i32) -> RawFd {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if !tls::hook_enabled() {
        return fd;
    }
    if fd >= 0 {
        FdManager::instance().get(fd, true);
    }
    fd
}

/// `connect` with an explicit deadline; `None` waits forever.
///
/// # Safety
///
/// `addr` must point to a valid socket address of `addrlen` bytes.
pub unsafe fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: Option<u64>,
) -> i32 {
    if !tls::hook_enabled() {
        return libc::connect(fd, addr, addrlen);
    }
    let Some(ctx) = FdManager::instance().get(fd, false) else {
        return libc::connect(fd, addr, addrlen);
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return libc::connect(fd, addr, addrlen);
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(iom) = IoManager::current() else {
        warn!("connect in progress on fd {} outside a reactor thread", fd);
        return n;
    };

    let winfo = Arc::new(WakeInfo::default());
    let timer = timeout_ms.map(|ms| {
        let weak = Arc::downgrade(&winfo);
        let iomw = Arc::downgrade(&iom);
        let winfo_any: Arc<dyn Any + Send + Sync> = winfo.clone();
        let cond: std::sync::Weak<dyn Any + Send + Sync> = Arc::downgrade(&winfo_any);
        iom.add_conditional_timer(
            ms,
            false,
            move || {
                let Some(info) = weak.upgrade() else {
                    return;
                };
                if info.cancelled.load(Ordering::SeqCst) != 0 {
                    return;
                }
                info.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                if let Some(iom) = iomw.upgrade() {
                    iom.cancel_event(fd, Event::Write);
                }
            },
            cond,
        )
    });

    match iom.add_event(fd, Event::Write) {
        Ok(()) => {
            Fiber::yield_now();
            if let Some(t) = &timer {
                t.cancel();
            }
            let cancelled = winfo.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = &timer {
                t.cancel();
            }
            error!("connect add_event({}, Write) failed: {}", fd, e);
        }
    }

    // the socket knows how the handshake went
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

/// `connect` under the process-wide default deadline
/// (`tcp.connect.timeout`).
///
/// # Safety
///
/// `addr` must point to a valid socket address of `addrlen` bytes.
pub unsafe fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> i32 {
    connect_with_timeout(fd, addr, addrlen, Some(connect_timeout_ms()))
}

/// `accept`, registering the accepted fd in the context table.
///
/// # Safety
///
/// `addr`/`addrlen` follow the libc accept contract and may be null.
pub unsafe fn accept(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> RawFd {
    let new_fd = do_io(fd, "accept", Event::Read, TimeoutKind::Recv, || {
        unsafe { libc::accept(fd, addr, addrlen) as isize }
    }) as RawFd;
    if new_fd >= 0 {
        FdManager::instance().get(new_fd, true);
    }
    new_fd
}

/// `close`: cancel everything parked on the fd, drop its context, then
/// close for real.
pub fn close(fd: RawFd) -> i32 {
    if !tls::hook_enabled() {
        return unsafe { libc::close(fd) };
    }
    if FdManager::instance().get(fd, false).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        FdManager::instance().del(fd);
    }
    unsafe { libc::close(fd) }
}

// ── read side ──

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    do_io(fd, "read", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr().cast(), buf.len())
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: RawFd, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, "readv", Event::Read, TimeoutKind::Recv, || {
        unsafe { libc::readv(fd, iov, iovcnt) }
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> isize {
    do_io(fd, "recv", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags)
    })
}

/// # Safety
///
/// `src_addr`/`addrlen` follow the libc recvfrom contract.
pub unsafe fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    do_io(fd, "recvfrom", Event::Read, TimeoutKind::Recv, || {
        unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                flags,
                src_addr,
                addrlen,
            )
        }
    })
}

/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> isize {
    do_io(fd, "recvmsg", Event::Read, TimeoutKind::Recv, || {
        unsafe { libc::recvmsg(fd, msg, flags) }
    })
}

// ── write side ──

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    do_io(fd, "write", Event::Write, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr().cast(), buf.len())
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: RawFd, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, "writev", Event::Write, TimeoutKind::Send, || {
        unsafe { libc::writev(fd, iov, iovcnt) }
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> isize {
    do_io(fd, "send", Event::Write, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf.as_ptr().cast(), buf.len(), flags)
    })
}

/// # Safety
///
/// `to` must point to a valid socket address of `tolen` bytes, or be null.
pub unsafe fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: i32,
    to: *const libc::sockaddr,
    tolen: libc::socklen_t,
) -> isize {
    do_io(fd, "sendto", Event::Write, TimeoutKind::Send, || {
        unsafe { libc::sendto(fd, buf.as_ptr().cast(), buf.len(), flags, to, tolen) }
    })
}

/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: i32) -> isize {
    do_io(fd, "sendmsg", Event::Write, TimeoutKind::Send, || {
        unsafe { libc::sendmsg(fd, msg, flags) }
    })
}

// ── flag and option reconciliation ──

/// `fcntl(F_SETFL)`: record the application's O_NONBLOCK wish, keep the
/// kernel flag non-blocking for managed sockets.
pub fn fcntl_setfl(fd: RawFd, flags: i32) -> i32 {
    let mut flags = flags;
    match FdManager::instance().get(fd, false) {
        Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
            ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            if ctx.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }
        }
        _ => unsafe { libc::fcntl(fd, libc::F_SETFL, flags) },
    }
}

/// `fcntl(F_GETFL)`: report the application's own O_NONBLOCK view, not
/// the forced kernel flag.
pub fn fcntl_getfl(fd: RawFd) -> i32 {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return flags;
    }
    match FdManager::instance().get(fd, false) {
        Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
            if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => flags,
    }
}

/// `ioctl(FIONBIO)`: records the wish for managed sockets without
/// touching the kernel flag, which stays non-blocking.
pub fn ioctl_fionbio(fd: RawFd, nonblock: bool) -> i32 {
    match FdManager::instance().get(fd, false) {
        Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
            ctx.set_user_nonblock(nonblock);
            0
        }
        _ => {
            let mut arg: libc::c_int = nonblock as libc::c_int;
            unsafe { libc::ioctl(fd, libc::FIONBIO, &mut arg as *mut libc::c_int) }
        }
    }
}

/// `setsockopt`: SO_RCVTIMEO/SO_SNDTIMEO land in the fd context as
/// milliseconds and never reach the kernel; everything else passes
/// through.
///
/// # Safety
///
/// `optval` must point to `optlen` valid bytes for the given option.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> i32 {
    if tls::hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(ctx) = FdManager::instance().get(fd, false) {
            debug_assert!(optlen as usize >= std::mem::size_of::<libc::timeval>());
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, (ms != 0).then_some(ms));
            return 0;
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}

/// Millisecond convenience over [`setsockopt`] for the two timeout
/// options.
pub fn set_socket_timeout(fd: RawFd, kind: TimeoutKind, ms: Option<u64>) {
    if let Some(ctx) = FdManager::instance().get(fd, true) {
        ctx.set_timeout(kind, ms);
    }
}

/// `getsockopt` passes straight through.
///
/// # Safety
///
/// `optval`/`optlen` follow the libc getsockopt contract.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> i32 {
    libc::getsockopt(fd, level, optname, optval, optlen)
}
