//! Reactor-level behavior: event binding bookkeeping, cancel versus
//! delete semantics, independence of the READ and WRITE bits, and the
//! application-visible non-blocking view kept by the fd context.

use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_io::{hook, Event, FdManager, IoManager};

static SERIAL: Mutex<()> = Mutex::new(());

fn init() -> parking_lot::MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    SERIAL.lock()
}

fn wait_for(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

fn close_pair(pair: (RawFd, RawFd)) {
    FdManager::instance().del(pair.0);
    FdManager::instance().del(pair.1);
    unsafe {
        libc::close(pair.0);
        libc::close(pair.1);
    }
}

#[test]
fn double_bind_is_rejected() {
    let _g = init();
    let iom = IoManager::new(1, false, "reactor-dup").unwrap();
    let pair = socketpair();

    iom.add_event_with(pair.0, Event::Read, || {}).unwrap();
    let err = iom.add_event_with(pair.0, Event::Read, || {}).unwrap_err();
    assert_eq!(
        err,
        strand_io::IoError::EventAlreadyBound {
            fd: pair.0,
            event: Event::Read
        }
    );
    assert_eq!(iom.pending_event_count(), 1);

    // releasing the bit makes the slot available again
    assert!(iom.del_event(pair.0, Event::Read));
    assert_eq!(iom.pending_event_count(), 0);
    iom.add_event_with(pair.0, Event::Read, || {}).unwrap();
    assert!(iom.cancel_all(pair.0));

    iom.stop();
    close_pair(pair);
}

#[test]
fn cancel_runs_handler_del_does_not() {
    let _g = init();
    let iom = IoManager::new(1, false, "reactor-cancel").unwrap();
    let pair = socketpair();

    let cancelled = Arc::new(AtomicBool::new(false));
    let deleted = Arc::new(AtomicBool::new(false));

    let c = cancelled.clone();
    iom.add_event_with(pair.0, Event::Read, move || {
        c.store(true, Ordering::SeqCst);
    })
    .unwrap();

    let d = deleted.clone();
    iom.add_event_with(pair.1, Event::Read, move || {
        d.store(true, Ordering::SeqCst);
    })
    .unwrap();

    assert!(iom.cancel_event(pair.0, Event::Read));
    assert!(iom.del_event(pair.1, Event::Read));

    assert!(wait_for(Duration::from_secs(5), || {
        cancelled.load(Ordering::SeqCst)
    }));
    // the deleted binding must stay silent
    std::thread::sleep(Duration::from_millis(100));
    assert!(!deleted.load(Ordering::SeqCst));
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
    close_pair(pair);
}

#[test]
fn read_and_write_bits_are_independent() {
    let _g = init();
    let iom = IoManager::new(1, false, "reactor-bits").unwrap();
    let pair = socketpair();

    let wrote = Arc::new(AtomicBool::new(false));
    let read = Arc::new(AtomicBool::new(false));

    // nothing to read yet, but an idle stream socket is writable
    let r = read.clone();
    iom.add_event_with(pair.0, Event::Read, move || {
        r.store(true, Ordering::SeqCst);
    })
    .unwrap();
    let w = wrote.clone();
    iom.add_event_with(pair.0, Event::Write, move || {
        w.store(true, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(iom.pending_event_count(), 2);

    assert!(wait_for(Duration::from_secs(5), || {
        wrote.load(Ordering::SeqCst)
    }));
    assert!(!read.load(Ordering::SeqCst), "read fired with no data");

    // feed a byte through the peer; now the read side becomes ready
    assert_eq!(unsafe { libc::write(pair.1, b"x".as_ptr().cast(), 1) }, 1);
    assert!(wait_for(Duration::from_secs(5), || {
        read.load(Ordering::SeqCst)
    }));
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
    close_pair(pair);
}

#[test]
fn user_nonblock_view_is_preserved() {
    let _g = init();
    let iom = IoManager::new(1, false, "reactor-nonblock").unwrap();
    let pair = socketpair();

    let done = Arc::new(AtomicBool::new(false));
    let checks = Arc::new(AtomicUsize::new(0));
    {
        let done = done.clone();
        let checks = checks.clone();
        let fd = pair.0;
        iom.schedule(move || {
            // bring the fd under management; forces the kernel flag
            let ctx = FdManager::instance().get(fd, true).unwrap();
            assert!(ctx.is_socket());

            // the application never asked for non-blocking mode, so its
            // view must not show it
            if hook::fcntl_getfl(fd) & libc::O_NONBLOCK == 0 {
                checks.fetch_add(1, Ordering::SeqCst);
            }
            let kernel = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if kernel & libc::O_NONBLOCK != 0 {
                checks.fetch_add(1, Ordering::SeqCst);
            }

            // opting in flips only the user view
            hook::ioctl_fionbio(fd, true);
            if hook::fcntl_getfl(fd) & libc::O_NONBLOCK != 0 {
                checks.fetch_add(1, Ordering::SeqCst);
            }

            // with user non-blocking set, a hooked read must surface
            // EAGAIN instead of parking
            let mut buf = [0u8; 8];
            let n = hook::read(fd, &mut buf);
            if n == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EAGAIN) {
                checks.fetch_add(1, Ordering::SeqCst);
            }

            // back to the default, the view clears again
            hook::fcntl_setfl(fd, 0);
            if hook::fcntl_getfl(fd) & libc::O_NONBLOCK == 0 {
                checks.fetch_add(1, Ordering::SeqCst);
            }

            done.store(true, Ordering::SeqCst);
        });
    }

    assert!(wait_for(Duration::from_secs(5), || done.load(Ordering::SeqCst)));
    iom.stop();
    assert_eq!(checks.load(Ordering::SeqCst), 5, "a flag view leaked through");
    close_pair(pair);
}

#[test]
fn managed_read_parks_until_data_arrives() {
    let _g = init();
    let iom = IoManager::new(1, false, "reactor-park").unwrap();
    let pair = socketpair();

    let got = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));
    {
        let got = got.clone();
        let done = done.clone();
        let fd = pair.0;
        iom.schedule(move || {
            FdManager::instance().get(fd, true).unwrap();
            let mut buf = [0u8; 16];
            // no data yet: this parks the fiber instead of spinning
            let n = hook::read(fd, &mut buf);
            if n > 0 {
                got.lock().extend_from_slice(&buf[..n as usize]);
            }
            done.store(true, Ordering::SeqCst);
        });
    }

    // give the fiber time to park, then satisfy the read
    std::thread::sleep(Duration::from_millis(100));
    assert!(!done.load(Ordering::SeqCst), "read returned with nothing to read");
    assert_eq!(unsafe { libc::write(pair.1, b"wake".as_ptr().cast(), 4) }, 4);

    assert!(wait_for(Duration::from_secs(5), || done.load(Ordering::SeqCst)));
    iom.stop();
    assert_eq!(got.lock().as_slice(), b"wake");
    close_pair(pair);
}
