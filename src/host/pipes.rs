//! Named message-mode pipes, the host's only data channel. A pipe is a named
//! rendezvous object owning one or more instances; a server end listens on an
//! instance, a client end connects by name. Reads and writes preserve message
//! boundaries. All conditions surface as [`HostStatus`] values; POSIX meaning
//! is assigned by the socket layer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;

use crate::host::status::HostStatus;
use crate::host::wait::{wait_any, Event, SigMode, WaitOutcome};

/// Process-wide root of the pipe namespace.
pub struct PipeRoot {
    pipes: Mutex<HashMap<String, Arc<NamedPipe>>>,
}

/// The pipe namespace root. Lockless after first call.
pub fn pipe_root() -> &'static PipeRoot {
    static ROOT: OnceCell<PipeRoot> = OnceCell::new();
    ROOT.get_or_init(|| PipeRoot {
        pipes: Mutex::new(HashMap::new()),
    })
}

/// Pipe names match case-insensitively.
fn pipe_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

struct NamedPipe {
    name: String,
    max_instances: Option<usize>,
    instances: Mutex<Vec<Arc<PipeInstance>>>,
    /// Set whenever an instance becomes free for a new client connection.
    instance_available: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstState {
    /// Created or disconnected; a client may still connect.
    Idle,
    /// The server end is waiting for a client.
    Listening,
    Connected,
}

struct InstanceInner {
    state: InstState,
    conn: Option<Arc<Conn>>,
}

struct PipeInstance {
    pipe: Weak<NamedPipe>,
    inner: Mutex<InstanceInner>,
    /// Set when a client attaches; reset by listen/disconnect.
    connected_ev: Event,
    closed: AtomicBool,
    rmem: usize,
    wmem: usize,
}

struct MsgQueue {
    msgs: VecDeque<Vec<u8>>,
    nbytes: usize,
    cap: usize,
}

impl MsgQueue {
    fn new(cap: usize) -> Self {
        Self {
            msgs: VecDeque::new(),
            nbytes: 0,
            cap,
        }
    }

    fn has_space_for(&self, len: usize) -> bool {
        // a lone message may exceed the quota, otherwise writers would stall
        // forever on queues smaller than one message
        self.msgs.is_empty() || self.nbytes + len <= self.cap
    }
}

/// One accepted client connection: a message queue per direction plus the
/// liveness of both ends.
struct Conn {
    inner: Mutex<ConnInner>,
    s2c_readable: Event,
    s2c_writable: Event,
    c2s_readable: Event,
    c2s_writable: Event,
}

struct ConnInner {
    s2c: MsgQueue,
    c2s: MsgQueue,
    client_open: bool,
    server_detached: bool,
}

impl Conn {
    fn new(rmem: usize, wmem: usize) -> Self {
        Self {
            inner: Mutex::new(ConnInner {
                s2c: MsgQueue::new(wmem),
                c2s: MsgQueue::new(rmem),
                client_open: true,
                server_detached: false,
            }),
            s2c_readable: Event::new(),
            s2c_writable: Event::new(),
            c2s_readable: Event::new(),
            c2s_writable: Event::new(),
        }
    }

    /// Recompute all four events from the queue and liveness state. Must be
    /// called with `inner` locked, after every mutation.
    fn refresh_events(&self, inner: &ConnInner) {
        let set_to = |ev: &Event, cond: bool| {
            if cond {
                ev.set();
            } else {
                ev.reset();
            }
        };

        // a dead peer makes both directions "ready" so blocked threads can
        // observe the failure
        set_to(
            &self.s2c_readable,
            !inner.s2c.msgs.is_empty() || inner.server_detached,
        );
        set_to(
            &self.s2c_writable,
            inner.s2c.has_space_for(1) || !inner.client_open,
        );
        set_to(
            &self.c2s_readable,
            !inner.c2s.msgs.is_empty() || !inner.client_open,
        );
        set_to(
            &self.c2s_writable,
            inner.c2s.has_space_for(1) || inner.server_detached,
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    Server,
    Client,
}

enum EndKind {
    Server,
    Client(Arc<Conn>),
}

struct EndInner {
    inst: Arc<PipeInstance>,
    kind: EndKind,
    nonblocking: AtomicBool,
    closed: AtomicBool,
}

/// One end of a pipe connection. Clones share the underlying end; the end is
/// closed explicitly or when the last clone drops.
pub struct PipeHandle(Arc<EndInner>);

impl Clone for PipeHandle {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl std::fmt::Debug for PipeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PipeHandle").field(&Arc::as_ptr(&self.0)).finish()
    }
}

impl PipeRoot {
    /// Create a named pipe and its first instance. Fails if a pipe of that
    /// name already exists.
    pub fn create_pipe(
        &self,
        name: &str,
        max_instances: Option<usize>,
        rmem: usize,
        wmem: usize,
    ) -> Result<PipeHandle, HostStatus> {
        let mut pipes = self.pipes.lock().unwrap();
        match pipes.entry(pipe_key(name)) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(HostStatus::ObjectNameCollision)
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                let pipe = Arc::new(NamedPipe {
                    name: name.to_owned(),
                    max_instances,
                    instances: Mutex::new(Vec::new()),
                    instance_available: Event::new(),
                });
                let inst = new_instance(&pipe, rmem, wmem);
                entry.insert(pipe);
                Ok(server_handle(inst))
            }
        }
    }

    /// Create an additional instance of an existing pipe: open if the pipe
    /// exists, fail if it does not.
    pub fn create_pipe_instance(
        &self,
        name: &str,
        rmem: usize,
        wmem: usize,
    ) -> Result<PipeHandle, HostStatus> {
        let pipe = self
            .lookup(name)
            .ok_or(HostStatus::ObjectNameNotFound)?;

        {
            let instances = pipe.instances.lock().unwrap();
            if let Some(max) = pipe.max_instances {
                if instances.len() >= max {
                    return Err(HostStatus::InstanceNotAvailable);
                }
            }
        }
        let inst = new_instance(&pipe, rmem, wmem);
        Ok(server_handle(inst))
    }

    /// Connect a client end to a free instance of the named pipe. Reports one
    /// of the "no instance available" statuses when every instance is in use.
    pub fn open_pipe(&self, name: &str) -> Result<PipeHandle, HostStatus> {
        let pipe = self
            .lookup(name)
            .ok_or(HostStatus::ObjectNameNotFound)?;

        let instances = pipe.instances.lock().unwrap();
        for inst in instances.iter() {
            if inst.closed.load(Ordering::Relaxed) {
                continue;
            }
            let mut inner = inst.inner.lock().unwrap();
            if inner.conn.is_none() && inner.state != InstState::Connected {
                let conn = Arc::new(Conn::new(inst.rmem, inst.wmem));
                inner.conn = Some(Arc::clone(&conn));
                inner.state = InstState::Connected;
                inst.connected_ev.set();
                return Ok(PipeHandle(Arc::new(EndInner {
                    inst: Arc::clone(inst),
                    kind: EndKind::Client(conn),
                    nonblocking: AtomicBool::new(false),
                    closed: AtomicBool::new(false),
                })));
            }
        }

        // single-instance pipes report the dedicated status
        if pipe.max_instances == Some(1) {
            Err(HostStatus::InstanceNotAvailable)
        } else {
            Err(HostStatus::PipeBusy)
        }
    }

    /// Block until an instance of the named pipe is free for connection, the
    /// timeout expires, or the termination event fires.
    pub fn wait_for_instance(
        &self,
        name: &str,
        timeout: Duration,
        terminate: Option<&Event>,
        sig: SigMode,
    ) -> Result<(), HostStatus> {
        let deadline = Instant::now() + timeout;

        loop {
            let pipe = self
                .lookup(name)
                .ok_or(HostStatus::ObjectNameNotFound)?;

            // reset before scanning so a concurrent release is not lost
            pipe.instance_available.reset();
            {
                let instances = pipe.instances.lock().unwrap();
                let available = instances.iter().any(|inst| {
                    !inst.closed.load(Ordering::Relaxed) && {
                        let inner = inst.inner.lock().unwrap();
                        inner.conn.is_none() && inner.state != InstState::Connected
                    }
                });
                if available {
                    return Ok(());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HostStatus::IoTimeout);
            }

            let mut events = vec![&pipe.instance_available];
            if let Some(term) = terminate {
                events.push(term);
            }
            match wait_any(&events, Some(deadline - now), sig) {
                WaitOutcome::Object(0) => continue,
                WaitOutcome::Object(_) => return Err(HostStatus::ThreadIsTerminating),
                WaitOutcome::TimedOut => return Err(HostStatus::IoTimeout),
                WaitOutcome::Interrupted => return Err(HostStatus::WaitSignaled),
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<NamedPipe>> {
        self.pipes.lock().unwrap().get(&pipe_key(name)).cloned()
    }

    fn remove_if_empty(&self, pipe: &Arc<NamedPipe>) {
        let mut pipes = self.pipes.lock().unwrap();
        if pipe.instances.lock().unwrap().is_empty() {
            pipes.remove(&pipe_key(&pipe.name));
        }
        // wake name waiters so they observe the removal
        pipe.instance_available.set();
    }
}

fn new_instance(pipe: &Arc<NamedPipe>, rmem: usize, wmem: usize) -> Arc<PipeInstance> {
    let inst = Arc::new(PipeInstance {
        pipe: Arc::downgrade(pipe),
        inner: Mutex::new(InstanceInner {
            state: InstState::Idle,
            conn: None,
        }),
        connected_ev: Event::new(),
        closed: AtomicBool::new(false),
        rmem,
        wmem,
    });
    pipe.instances.lock().unwrap().push(Arc::clone(&inst));
    pipe.instance_available.set();
    inst
}

fn server_handle(inst: Arc<PipeInstance>) -> PipeHandle {
    PipeHandle(Arc::new(EndInner {
        inst,
        kind: EndKind::Server,
        nonblocking: AtomicBool::new(false),
        closed: AtomicBool::new(false),
    }))
}

impl PipeHandle {
    pub fn role(&self) -> PipeRole {
        match &self.0.kind {
            EndKind::Server => PipeRole::Server,
            EndKind::Client(_) => PipeRole::Client,
        }
    }

    pub fn pipe_name(&self) -> String {
        match self.0.inst.pipe.upgrade() {
            Some(pipe) => pipe.name.clone(),
            None => String::new(),
        }
    }

    /// Switch between queue-operation (blocking) and complete-operation
    /// (non-blocking) behavior. Message mode is unconditional.
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.0.nonblocking.store(nonblocking, Ordering::Relaxed);
    }

    pub fn is_nonblocking(&self) -> bool {
        self.0.nonblocking.load(Ordering::Relaxed)
    }

    /// Wait for a client to connect to this server instance. Reports success
    /// immediately when a client is already attached; in non-blocking mode an
    /// unconnected instance reports [`HostStatus::PipeListening`].
    pub fn listen(&self, timeout: Option<Duration>) -> Result<(), HostStatus> {
        if !matches!(self.0.kind, EndKind::Server) {
            return Err(HostStatus::InvalidDeviceRequest);
        }
        let inst = &self.0.inst;

        {
            let mut inner = inst.inner.lock().unwrap();
            match inner.state {
                InstState::Connected => return Ok(()),
                InstState::Listening => {}
                InstState::Idle => {
                    inner.state = InstState::Listening;
                    inst.connected_ev.reset();
                }
            }
        }

        if self.is_nonblocking() {
            let inner = inst.inner.lock().unwrap();
            return match inner.state {
                InstState::Connected => Ok(()),
                _ => Err(HostStatus::PipeListening),
            };
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            wait_with_deadline(&inst.connected_ev, deadline)?;
            if inst.closed.load(Ordering::Relaxed) {
                return Err(HostStatus::PipeBroken);
            }
            let inner = inst.inner.lock().unwrap();
            if inner.state == InstState::Connected {
                return Ok(());
            }
        }
    }

    /// Detach the current client connection and return the instance to the
    /// connectable pool. Not cancellable.
    pub fn disconnect(&self) -> Result<(), HostStatus> {
        if !matches!(self.0.kind, EndKind::Server) {
            return Err(HostStatus::InvalidDeviceRequest);
        }
        let inst = &self.0.inst;

        let conn = {
            let mut inner = inst.inner.lock().unwrap();
            inner.state = InstState::Idle;
            inst.connected_ev.reset();
            inner.conn.take()
        };
        if let Some(conn) = conn {
            let mut ci = conn.inner.lock().unwrap();
            ci.server_detached = true;
            conn.refresh_events(&ci);
        }
        if let Some(pipe) = inst.pipe.upgrade() {
            pipe.instance_available.set();
        }
        Ok(())
    }

    /// Read one message. A message longer than `buf` is truncated to fit and
    /// the remainder dropped, reported as [`HostStatus::BufferOverflow`].
    pub fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, HostStatus> {
        let conn = self.conn()?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            {
                let mut inner = conn.inner.lock().unwrap();
                let (queue, peer_gone, eof_status) = match &self.0.kind {
                    EndKind::Server => {
                        let gone = !inner.client_open;
                        (&mut inner.c2s, gone, HostStatus::PipeClosing)
                    }
                    EndKind::Client(_) => {
                        let gone = inner.server_detached;
                        (&mut inner.s2c, gone, HostStatus::PipeDisconnected)
                    }
                };

                if let Some(msg) = queue.msgs.pop_front() {
                    queue.nbytes -= msg.len();
                    let n = msg.len().min(buf.len());
                    buf[..n].copy_from_slice(&msg[..n]);
                    conn.refresh_events(&inner);
                    if n < msg.len() {
                        return Err(HostStatus::BufferOverflow);
                    }
                    return Ok(n);
                }
                if peer_gone {
                    return Err(eof_status);
                }
                if self.is_nonblocking() {
                    return Err(HostStatus::PipeEmpty);
                }
            }

            let readable = match &self.0.kind {
                EndKind::Server => &conn.c2s_readable,
                EndKind::Client(_) => &conn.s2c_readable,
            };
            wait_with_deadline(readable, deadline)?;
        }
    }

    /// Write one message. In non-blocking mode a full queue reports zero
    /// bytes transferred.
    pub fn write(&self, msg: &[u8], timeout: Option<Duration>) -> Result<usize, HostStatus> {
        let conn = self.conn()?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            {
                let mut inner = conn.inner.lock().unwrap();
                let (queue, peer_gone) = match &self.0.kind {
                    EndKind::Server => {
                        let gone = !inner.client_open;
                        (&mut inner.s2c, gone)
                    }
                    EndKind::Client(_) => {
                        let gone = inner.server_detached;
                        (&mut inner.c2s, gone)
                    }
                };

                if peer_gone {
                    return Err(HostStatus::PipeClosing);
                }
                if queue.has_space_for(msg.len()) {
                    queue.msgs.push_back(msg.to_vec());
                    queue.nbytes += msg.len();
                    conn.refresh_events(&inner);
                    return Ok(msg.len());
                }
                if self.is_nonblocking() {
                    return Ok(0);
                }
            }

            let writable = match &self.0.kind {
                EndKind::Server => &conn.s2c_writable,
                EndKind::Client(_) => &conn.c2s_writable,
            };
            wait_with_deadline(writable, deadline)?;
        }
    }

    /// Close this end. Idempotent; also performed when the last clone drops.
    pub fn close(&self) {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.0.close_end();
    }

    fn conn(&self) -> Result<Arc<Conn>, HostStatus> {
        if self.0.closed.load(Ordering::Relaxed) {
            return Err(HostStatus::InvalidDeviceRequest);
        }
        match &self.0.kind {
            EndKind::Client(conn) => Ok(Arc::clone(conn)),
            EndKind::Server => {
                let inner = self.0.inst.inner.lock().unwrap();
                match (inner.state, &inner.conn) {
                    (InstState::Connected, Some(conn)) => Ok(Arc::clone(conn)),
                    (InstState::Listening, _) => Err(HostStatus::PipeListening),
                    _ => Err(HostStatus::PipeDisconnected),
                }
            }
        }
    }
}

fn wait_with_deadline(ev: &Event, deadline: Option<Instant>) -> Result<(), HostStatus> {
    let remaining = match deadline {
        None => None,
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Err(HostStatus::IoTimeout);
            }
            Some(deadline - now)
        }
    };
    match ev.wait(remaining, SigMode::Eintr) {
        WaitOutcome::Object(_) => Ok(()),
        WaitOutcome::TimedOut => Err(HostStatus::IoTimeout),
        WaitOutcome::Interrupted => Err(HostStatus::WaitSignaled),
    }
}

impl EndInner {
    fn close_end(&self) {
        match &self.kind {
            EndKind::Client(conn) => {
                let mut ci = conn.inner.lock().unwrap();
                ci.client_open = false;
                conn.refresh_events(&ci);
            }
            EndKind::Server => {
                let conn = {
                    let mut inner = self.inst.inner.lock().unwrap();
                    inner.conn.take()
                };
                if let Some(conn) = conn {
                    let mut ci = conn.inner.lock().unwrap();
                    ci.server_detached = true;
                    conn.refresh_events(&ci);
                }
                self.inst.closed.store(true, Ordering::SeqCst);
                // wake a pending listen so it observes the broken pipe
                self.inst.connected_ev.set();
                if let Some(pipe) = self.inst.pipe.upgrade() {
                    pipe.instances
                        .lock()
                        .unwrap()
                        .retain(|i| !Arc::ptr_eq(i, &self.inst));
                    pipe_root().remove_if_empty(&pipe);
                }
            }
        }
    }
}

impl Drop for EndInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_end();
        }
    }
}
