//! The process-wide event reactor.
//!
//! One background thread blocks on the kernel poller (edge-triggered epoll on
//! Linux, kqueue elsewhere, via mio) and dispatches readiness to registered
//! handlers. Handlers are looked up by descriptor under a reader/writer lock,
//! cloned out, and invoked with the lock released, so registration and
//! removal stay safe while the loop is running. A handler racing with
//! `remove` may observe one final dispatch.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use ahash::RandomState;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, trace, warn};

/// Bounded poll timeout so shutdown requests are observed promptly.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const EVENTS_CAPACITY: usize = 1024;
const WAKE_TOKEN: Token = Token(usize::MAX);

/// A subset of {READ, WRITE, ERROR, CLOSE}.
///
/// READ, ERROR and CLOSE stay armed for the lifetime of a registration;
/// WRITE is armed only while a connection has pending outbound data.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InterestSet(u8);

impl InterestSet {
    pub const READ: InterestSet = InterestSet(0x01);
    pub const WRITE: InterestSet = InterestSet(0x02);
    pub const ERROR: InterestSet = InterestSet(0x04);
    pub const CLOSE: InterestSet = InterestSet(0x08);

    pub const fn contains(self, other: InterestSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: InterestSet) -> InterestSet {
        InterestSet(self.0 | other.0)
    }

    pub const fn without(self, other: InterestSet) -> InterestSet {
        InterestSet(self.0 & !other.0)
    }
}

impl std::ops::BitOr for InterestSet {
    type Output = InterestSet;

    fn bitor(self, rhs: InterestSet) -> InterestSet {
        self.with(rhs)
    }
}

/// Translate an interest set into the poller's registration interest.
///
/// The poller always delivers error and hangup conditions, so only READ and
/// WRITE map onto the registered set; READ is kept armed unconditionally.
fn poller_interest(set: InterestSet) -> Interest {
    if set.contains(InterestSet::WRITE) {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

/// A descriptor-owning object that reacts to readiness events.
///
/// For one composite event the reactor invokes, in order: `on_read` if
/// readable, `on_write` if writable, `on_error` on an error condition, and
/// `on_close` on hangup. All four can land in the same turn, so
/// implementations must not assume exclusivity. Interest changes go through
/// [`EventReactor::modify`], never by mutating the handler in place.
pub trait EventHandler: Send + Sync {
    /// The descriptor this handler owns. Fixed after construction.
    fn handle(&self) -> RawFd;

    /// Current interest set, consulted at registration time.
    fn interest(&self) -> InterestSet {
        InterestSet::READ | InterestSet::ERROR | InterestSet::CLOSE
    }

    fn on_read(&self, fd: RawFd);

    fn on_write(&self, _fd: RawFd) {}

    fn on_error(&self, _fd: RawFd) {}

    fn on_close(&self, _fd: RawFd) {}
}

type HandlerMap = HashMap<RawFd, Arc<dyn EventHandler>, RandomState>;

/// The singleton reactor. Obtain it with [`EventReactor::instance`].
pub struct EventReactor {
    registry: Registry,
    waker: Waker,
    running: Arc<AtomicBool>,
    handlers: Arc<RwLock<HandlerMap>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EventReactor {
    /// The process-wide reactor, started on first use.
    ///
    /// Panics if the kernel poller cannot be created; nothing in the library
    /// can operate without it.
    pub fn instance() -> &'static EventReactor {
        static INSTANCE: OnceLock<EventReactor> = OnceLock::new();
        INSTANCE.get_or_init(|| EventReactor::start().expect("failed to start the event reactor"))
    }

    fn start() -> io::Result<EventReactor> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        let running = Arc::new(AtomicBool::new(false));
        let handlers: Arc<RwLock<HandlerMap>> = Arc::new(RwLock::new(HashMap::default()));
        let startup = Arc::new((Mutex::new(false), Condvar::new()));

        let thread = {
            let running = Arc::clone(&running);
            let handlers = Arc::clone(&handlers);
            let startup = Arc::clone(&startup);
            thread::Builder::new()
                .name("event-reactor".to_string())
                .spawn(move || run_loop(poll, running, handlers, startup))?
        };

        // Wait for the loop thread to report in before accepting
        // registrations.
        {
            let (lock, cond) = &*startup;
            let mut up = lock.lock();
            while !*up {
                cond.wait(&mut up);
            }
        }

        Ok(EventReactor {
            registry,
            waker,
            running,
            handlers,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Register a handler for its descriptor. Fails when the reactor is shut
    /// down or the kernel rejects the registration.
    pub fn register(&self, handler: Arc<dyn EventHandler>) -> bool {
        if !self.running.load(Ordering::Acquire) {
            warn!("reactor is not running");
            return false;
        }

        let fd = handler.handle();
        if fd < 0 {
            warn!("refusing to register an invalid descriptor");
            return false;
        }

        let interest = handler.interest();
        if let Err(e) =
            self.registry
                .register(&mut SourceFd(&fd), Token(fd as usize), poller_interest(interest))
        {
            error!(fd, error = %e, "failed to register descriptor with the poller");
            return false;
        }

        self.handlers.write().insert(fd, handler);
        trace!(fd, ?interest, "handler registered");
        true
    }

    /// Drop the handler for `fd` and detach the descriptor from the poller.
    pub fn remove(&self, fd: RawFd) -> bool {
        if self.handlers.write().remove(&fd).is_none() {
            warn!(fd, "no handler registered for descriptor");
            return false;
        }

        if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
            warn!(fd, error = %e, "failed to detach descriptor from the poller");
            return false;
        }

        trace!(fd, "handler removed");
        true
    }

    /// Re-register `fd` with a new interest set. The handler map is
    /// unchanged.
    pub fn modify(&self, fd: RawFd, interest: InterestSet) -> bool {
        if !self.running.load(Ordering::Acquire) {
            warn!("reactor is not running");
            return false;
        }

        if !self.handlers.read().contains_key(&fd) {
            warn!(fd, "no handler registered for descriptor during modify");
            return false;
        }

        if let Err(e) = self.registry.reregister(
            &mut SourceFd(&fd),
            Token(fd as usize),
            poller_interest(interest),
        ) {
            error!(fd, error = %e, "failed to modify descriptor interest");
            return false;
        }

        trace!(fd, ?interest, "handler interest modified");
        true
    }

    /// Stop the loop thread and join it. Registered handlers are left in the
    /// map; this is a process-teardown operation.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.waker.wake();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn run_loop(
    mut poll: Poll,
    running: Arc<AtomicBool>,
    handlers: Arc<RwLock<HandlerMap>>,
    startup: Arc<(Mutex<bool>, Condvar)>,
) {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    running.store(true, Ordering::Release);
    {
        let (lock, cond) = &*startup;
        *lock.lock() = true;
        cond.notify_all();
    }
    debug!("event reactor running");

    while running.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "poll failed, reactor exiting");
            return;
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }

            let fd = event.token().0 as RawFd;
            let handler = handlers.read().get(&fd).cloned();
            let Some(handler) = handler else {
                trace!(fd, "event for unregistered descriptor");
                continue;
            };

            // Handler failures must not take the reactor down.
            let dispatched = panic::catch_unwind(AssertUnwindSafe(|| {
                if event.is_readable() {
                    handler.on_read(fd);
                }
                if event.is_writable() {
                    handler.on_write(fd);
                }
                if event.is_error() {
                    handler.on_error(fd);
                }
                if event.is_read_closed() || event.is_write_closed() {
                    handler.on_close(fd);
                }
            }));
            if dispatched.is_err() {
                error!(fd, "handler panicked during event dispatch");
            }
        }
    }

    debug!("event reactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn test_interest_set_ops() {
        let set = InterestSet::READ | InterestSet::ERROR | InterestSet::CLOSE;
        assert!(set.contains(InterestSet::READ));
        assert!(!set.contains(InterestSet::WRITE));

        let armed = set.with(InterestSet::WRITE);
        assert!(armed.contains(InterestSet::WRITE));
        assert_eq!(armed.without(InterestSet::WRITE), set);
    }

    #[test]
    fn test_poller_interest_translation() {
        let read_only = poller_interest(InterestSet::READ | InterestSet::CLOSE);
        assert!(read_only.is_readable());
        assert!(!read_only.is_writable());

        let with_write = poller_interest(InterestSet::READ | InterestSet::WRITE);
        assert!(with_write.is_readable());
        assert!(with_write.is_writable());
    }

    struct CountingHandler {
        fd: RawFd,
        reads: AtomicUsize,
    }

    impl EventHandler for CountingHandler {
        fn handle(&self) -> RawFd {
            self.fd
        }

        fn on_read(&self, _fd: RawFd) {
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_register_dispatch_remove() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let addr = socket.local_addr().unwrap();
        let fd = socket.as_raw_fd();

        let handler = Arc::new(CountingHandler {
            fd,
            reads: AtomicUsize::new(0),
        });

        let reactor = EventReactor::instance();
        assert!(reactor.register(handler.clone()));

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while handler.reads.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(handler.reads.load(Ordering::SeqCst) >= 1);

        // register/remove restores the reactor's state exactly.
        assert!(reactor.remove(fd));
        assert!(!reactor.remove(fd));
    }

    #[test]
    fn test_modify_unknown_descriptor_fails() {
        let reactor = EventReactor::instance();
        assert!(!reactor.modify(-1, InterestSet::READ));
    }
}
