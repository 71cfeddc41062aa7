//! The connect waiter. When a connect finds every pipe instance in use, a
//! waiter task keeps retrying the open, bounded by the connect timeout,
//! interruptible through a termination event owned by the socket. In
//! blocking mode the connecting thread joins the waiter; in non-blocking
//! mode the waiter finishes asynchronously and publishes its result through
//! `so_error` and the connect state.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use nix::errno::Errno;

use crate::host::pipes::pipe_root;
use crate::host::status::{errno_for, HostStatus};
use crate::host::wait::{Event, SigMode, WaitOutcome};
use crate::socket::unix::{UnixSocket, CONNECT_TIMEOUT};
use crate::socket::ConnectState;

/// The waiter's parameter block. Ownership moves to whichever side takes it
/// out of the slot first; the other side finds it gone.
#[derive(Debug)]
pub(crate) struct ConnectWaitParam {
    pub pipe_name: String,
}

/// Per-socket waiter bookkeeping.
pub(crate) struct WaiterSlot {
    pub thread: Option<JoinHandle<i32>>,
    pub termination: Option<Arc<Event>>,
    pub param: Option<Box<ConnectWaitParam>>,
}

impl std::fmt::Debug for WaiterSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaiterSlot")
            .field("thread", &self.thread.as_ref().map(|_| "JoinHandle"))
            .field("termination", &self.termination)
            .field("param", &self.param)
            .finish()
    }
}

impl WaiterSlot {
    pub fn new() -> Self {
        Self {
            thread: None,
            termination: None,
            param: None,
        }
    }
}

/// Start a waiter task for a pipe with no free instance. In blocking mode,
/// wait for the task to finish; in non-blocking mode just report
/// `EINPROGRESS`.
pub(crate) fn wait_pipe(socket: &Arc<UnixSocket>, pipe_name: String) -> Result<(), Errno> {
    let termination = Arc::new(Event::new());
    let done = Arc::new(Event::new());

    {
        let mut slot = socket.waiter.lock().unwrap();
        slot.termination = Some(Arc::clone(&termination));
        slot.param = Some(Box::new(ConnectWaitParam { pipe_name }));

        let sock = Arc::clone(socket);
        let term = Arc::clone(&termination);
        let done = Arc::clone(&done);
        let thread = std::thread::Builder::new()
            .name("af-unix-connect-wait".into())
            .spawn(move || wait_pipe_thread(sock, term, done));
        match thread {
            Ok(thread) => slot.thread = Some(thread),
            Err(err) => {
                log::debug!("couldn't start connect waiter: {err}");
                slot.param = None;
                slot.termination = None;
                return Err(Errno::EAGAIN);
            }
        }
    }

    if socket.is_nonblocking() {
        return Err(Errno::EINPROGRESS);
    }

    match done.wait(None, SigMode::Eintr) {
        WaitOutcome::Object(_) => {
            // the result is already published; the join only makes sure the
            // task is fully gone before we return
            let thread = socket.waiter.lock().unwrap().thread.take();
            if let Some(thread) = thread {
                let _ = thread.join();
            }
            socket.waiter.lock().unwrap().termination = None;
            let error = socket.so_error.load(Ordering::SeqCst);
            if error == 0 {
                Ok(())
            } else {
                Err(Errno::from_i32(error))
            }
        }
        WaitOutcome::Interrupted => {
            termination.set();
            let thread = socket.waiter.lock().unwrap().thread.take();
            if let Some(thread) = thread {
                let _ = thread.join();
            }
            socket.waiter.lock().unwrap().termination = None;
            Err(Errno::EINTR)
        }
        WaitOutcome::TimedOut => unreachable!("no timeout on waiter join"),
    }
}

/// Waiter task body. The important things to do:
///
/// - set the peer pipe handle if successful
/// - send the local name to the peer if successful
/// - set the connect state
/// - set `so_error` for a later `SO_ERROR` or `select()`
fn wait_pipe_thread(socket: Arc<UnixSocket>, termination: Arc<Event>, done: Arc<Event>) -> i32 {
    let param = socket.waiter.lock().unwrap().param.take();
    let error = match param {
        Some(param) => wait_pipe_loop(&socket, &param.pipe_name, &termination),
        // the socket is already being torn down
        None => Errno::EINTR as i32,
    };

    {
        let mut conn = socket.conn.write().unwrap();
        socket.so_error.store(error, Ordering::SeqCst);
        conn.state = if error == 0 {
            ConnectState::Connected
        } else {
            ConnectState::ConnectFailed
        };
    }
    done.set();
    // detach ourselves so that a teardown triggered by our own Arc being the
    // last one does not try to join the current thread
    socket.waiter.lock().unwrap().thread.take();
    error
}

fn wait_pipe_loop(socket: &UnixSocket, pipe_name: &str, termination: &Event) -> i32 {
    let deadline = Instant::now() + CONNECT_TIMEOUT;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Errno::ETIMEDOUT as i32;
        }

        match pipe_root().wait_for_instance(
            pipe_name,
            deadline - now,
            Some(termination),
            SigMode::Ignore,
        ) {
            Ok(()) => match socket.open_pipe(pipe_name) {
                Ok(()) => return 0,
                Err(status) if status.no_instance_available() => {
                    // another concurrent connect grabbed the instance under
                    // our nose; go waiting again with the reduced timeout
                    continue;
                }
                Err(status) => return errno_for(status) as i32,
            },
            Err(HostStatus::IoTimeout) => return Errno::ETIMEDOUT as i32,
            Err(HostStatus::ThreadIsTerminating) => return Errno::EINTR as i32,
            Err(HostStatus::InsufficientResources) => return Errno::ENOBUFS as i32,
            Err(HostStatus::ObjectNameNotFound) => {
                return errno_for(HostStatus::ObjectNameNotFound) as i32
            }
            Err(_) => return Errno::EIO as i32,
        }
    }
}
