//! Counting semaphores gating the socket control channel.
//!
//! The interception shim and the socket handler rendezvous over a pair of
//! counting semaphores: the shim writes a call record and posts the call
//! semaphore, the handler serves the call, writes the reply record and
//! posts the reply semaphore. In the daemon the pair are the named POSIX
//! semaphores `main_channel1`/`main_channel2` shared with the shim process;
//! in tests an in-process semaphore with the same semantics is used.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Conventional name of the call-ready semaphore.
pub const CALL_SEM_NAME: &'static str = "main_channel1";
/// Conventional name of the reply-ready semaphore.
pub const REPLY_SEM_NAME: &'static str = "main_channel2";

/// In-process counting semaphore.
pub struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(initial: u32) -> Semaphore {
        Semaphore {
            count: Mutex::new(initial),
            cv: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Returns false if the timeout elapsed without acquiring.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            let (guard, result) = self.cv.wait_timeout(count, timeout).unwrap();
            count = guard;
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }
}

/// The handler side of the control-channel rendezvous.
pub trait ChannelGate: Send {
    /// Blocks until the shim published a call record. Returns false when
    /// the gate has been torn down and the server loop should exit.
    fn wait_call(&self) -> bool;

    /// Releases the shim after the reply record has been written.
    fn post_reply(&self);
}

/// In-process gate used by tests and single-process deployments.
pub struct LocalGate {
    call: Arc<Semaphore>,
    reply: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
}

impl LocalGate {
    /// Builds the gate plus the handles the shim side needs: the call
    /// semaphore to post, the reply semaphore to wait on, and the close
    /// flag.
    pub fn new() -> (LocalGate, Arc<Semaphore>, Arc<Semaphore>, Arc<AtomicBool>) {
        let call = Arc::new(Semaphore::new(0));
        let reply = Arc::new(Semaphore::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let gate = LocalGate {
            call: call.clone(),
            reply: reply.clone(),
            closed: closed.clone(),
        };
        (gate, call, reply, closed)
    }
}

impl ChannelGate for LocalGate {
    fn wait_call(&self) -> bool {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            if self.call.wait_timeout(Duration::from_millis(100)) {
                return true;
            }
        }
    }

    fn post_reply(&self) {
        self.reply.post();
    }
}

/// A named POSIX semaphore, shared between processes.
#[cfg(unix)]
pub struct NamedSemaphore {
    sem: *mut ::libc::sem_t,
}

#[cfg(unix)]
unsafe impl Send for NamedSemaphore {}
#[cfg(unix)]
unsafe impl Sync for NamedSemaphore {}

#[cfg(unix)]
impl NamedSemaphore {
    /// Opens (creating if needed) the semaphore `name` with `initial`
    /// tokens. The leading slash required by `sem_open` is added here, so
    /// callers pass the conventional names unchanged.
    pub fn open(name: &str, initial: u32) -> io::Result<NamedSemaphore> {
        use std::ffi::CString;
        let path = format!("/{}", name.trim_start_matches('/'));
        let c_name = CString::new(path)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad semaphore name"))?;
        let sem = unsafe {
            ::libc::sem_open(c_name.as_ptr(),
                             ::libc::O_CREAT,
                             0o644 as ::libc::c_uint,
                             initial as ::libc::c_uint)
        };
        if sem == ::libc::SEM_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(NamedSemaphore { sem: sem })
        }
    }

    pub fn post(&self) {
        unsafe {
            ::libc::sem_post(self.sem);
        }
    }

    pub fn wait(&self) -> io::Result<()> {
        loop {
            let result = unsafe { ::libc::sem_wait(self.sem) };
            if result == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Waits up to `timeout`. `Ok(true)` when the semaphore was taken,
    /// `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let mut now = ::libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { ::libc::clock_gettime(::libc::CLOCK_REALTIME, &mut now) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut deadline = ::libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as ::libc::time_t,
            tv_nsec: now.tv_nsec + timeout.subsec_nanos() as ::libc::c_long,
        };
        if deadline.tv_nsec >= 1_000_000_000 {
            deadline.tv_sec += 1;
            deadline.tv_nsec -= 1_000_000_000;
        }
        loop {
            let result = unsafe { ::libc::sem_timedwait(self.sem, &deadline) };
            if result == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(::libc::ETIMEDOUT) => return Ok(false),
                Some(::libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }
}

#[cfg(unix)]
impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            ::libc::sem_close(self.sem);
        }
    }
}

/// Gate over the named semaphore pair, used by the daemon. The close flag
/// lets the process interrupt a server parked on the call semaphore during
/// shutdown.
#[cfg(unix)]
pub struct NamedGate {
    call: NamedSemaphore,
    reply: NamedSemaphore,
    closed: Arc<AtomicBool>,
}

#[cfg(unix)]
impl NamedGate {
    pub fn open() -> io::Result<NamedGate> {
        Ok(NamedGate {
            call: NamedSemaphore::open(CALL_SEM_NAME, 0)?,
            reply: NamedSemaphore::open(REPLY_SEM_NAME, 0)?,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn close_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

#[cfg(unix)]
impl ChannelGate for NamedGate {
    fn wait_call(&self) -> bool {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            match self.call.wait_timeout(Duration::from_millis(100)) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    error!("semaphore wait failed: {}", e);
                    return false;
                }
            }
        }
    }

    fn post_reply(&self) {
        self.reply.post();
    }
}
