//! The unix socket object: three lock-protected state segments (binding,
//! connection, io), the public POSIX-shaped operation surface, and the
//! peer-name handshake gluing the name registry and the pipe transport
//! together.
//!
//! A connecting, bound stream socket sends its local name once after a
//! successful connect. An already connected socket also sends its name after
//! a successful bind (border case, but still...). A bound datagram socket
//! embeds its name in every outgoing datagram.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use nix::errno::Errno;

use crate::host;
use crate::host::fs::{self, AclEntry, FileStat, FsNode};
use crate::host::pipes::{pipe_root, PipeHandle};
use crate::host::status::{errno_for, HostStatus};

// Not exported by the `libc` crate on this target; fixed value from
// <linux/sockios.h>.
const SIOCATMARK: libc::c_ulong = 0x8905;
use crate::host::wait::SigMode;
use crate::host::Ucred;
use crate::socket::packet::{self, Packet, MAX_PACKET_LEN};
use crate::socket::waiter::{self, WaiterSlot};
use crate::socket::{ns, BackingHandle, BindingState, ConnectState, UnixSocketType};
use crate::utility::sockaddr::SunName;

/// Default pipe buffer size per direction.
const DEFAULT_BUF_SIZE: usize = 262_144;

/// Default timeout of connect and of the peer-name handshake: 20 secs, as on
/// Linux.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Sentinel distinguishing "no timeout configured" from an explicit zero.
const TIMEO_INFINITE: u32 = u32::MAX;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SocketStatus: u32 {
        const NONBLOCK = 1 << 0;
        const CLOEXEC = 1 << 1;
        const APPEND = 1 << 2;
    }
}

#[derive(Debug)]
pub(crate) struct BindSeg {
    pub state: BindingState,
    pub sun_path: Option<SunName>,
    pub backing: BackingHandle,
}

#[derive(Debug)]
pub(crate) struct ConnSeg {
    pub state: ConnectState,
    pub peer_sun_path: Option<SunName>,
    pub peer_cred: Ucred,
    /// A datagram socket's open handle to its connected peer's pipe.
    pub peer_pipe: Option<PipeHandle>,
}

#[derive(Debug)]
pub(crate) struct IoSeg {
    pub pipe: Option<PipeHandle>,
}

#[derive(Debug)]
pub struct UnixSocket {
    unique_id: u64,
    sock_type: UnixSocketType,
    flags: AtomicU32,
    rmem: AtomicUsize,
    wmem: AtomicUsize,
    rcvtimeo_ms: AtomicU32,
    sndtimeo_ms: AtomicU32,
    pub(crate) so_error: AtomicI32,
    saw_reuseaddr: AtomicBool,
    /// The basename of this socket's own pipe, generated by `bind`/`listen`.
    pipe_path: Mutex<Option<String>>,
    pub(crate) bind: RwLock<BindSeg>,
    pub(crate) conn: RwLock<ConnSeg>,
    pub(crate) io: RwLock<IoSeg>,
    pub(crate) waiter: Mutex<WaiterSlot>,
}

impl UnixSocket {
    /// Create a socket. `sock_type` takes the base type possibly combined
    /// with `SOCK_NONBLOCK` and `SOCK_CLOEXEC`.
    pub fn socket(
        af: libc::c_int,
        sock_type: libc::c_int,
        protocol: libc::c_int,
    ) -> Result<Arc<Self>, Errno> {
        if af != libc::AF_UNIX {
            return Err(Errno::EAFNOSUPPORT);
        }
        let base = sock_type & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
        let sock_type_flags = sock_type & (libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
        let base = UnixSocketType::try_from_raw(base)?;
        if protocol != 0 {
            return Err(Errno::EPROTONOSUPPORT);
        }

        let mut status = SocketStatus::empty();
        if sock_type_flags & libc::SOCK_NONBLOCK != 0 {
            status |= SocketStatus::NONBLOCK;
        }
        if sock_type_flags & libc::SOCK_CLOEXEC != 0 {
            status |= SocketStatus::CLOEXEC;
        }

        Ok(Arc::new(Self::new(base, status)))
    }

    fn new(sock_type: UnixSocketType, status: SocketStatus) -> Self {
        Self {
            unique_id: host::next_unique_id(),
            sock_type,
            flags: AtomicU32::new(status.bits()),
            rmem: AtomicUsize::new(DEFAULT_BUF_SIZE),
            wmem: AtomicUsize::new(DEFAULT_BUF_SIZE),
            rcvtimeo_ms: AtomicU32::new(TIMEO_INFINITE),
            sndtimeo_ms: AtomicU32::new(TIMEO_INFINITE),
            so_error: AtomicI32::new(0),
            saw_reuseaddr: AtomicBool::new(false),
            pipe_path: Mutex::new(None),
            bind: RwLock::new(BindSeg {
                state: BindingState::Unbound,
                sun_path: None,
                backing: BackingHandle::None,
            }),
            conn: RwLock::new(ConnSeg {
                state: ConnectState::Unconnected,
                peer_sun_path: None,
                peer_cred: Ucred::unknown(),
                peer_pipe: None,
            }),
            io: RwLock::new(IoSeg { pipe: None }),
            waiter: Mutex::new(WaiterSlot::new()),
        }
    }

    /// Create a pair of connected sockets.
    pub fn socketpair(
        af: libc::c_int,
        sock_type: libc::c_int,
        protocol: libc::c_int,
    ) -> Result<(Arc<Self>, Arc<Self>), Errno> {
        if af != libc::AF_UNIX {
            return Err(Errno::EAFNOSUPPORT);
        }
        let base = sock_type & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
        UnixSocketType::try_from_raw(base)?;
        if protocol != 0 {
            return Err(Errno::EPROTONOSUPPORT);
        }
        // the pairing protocol is not realized yet
        Err(Errno::EAFNOSUPPORT)
    }

    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn socket_type(&self) -> UnixSocketType {
        self.sock_type
    }

    pub fn binding_state(&self) -> BindingState {
        self.bind.read().unwrap().state
    }

    pub fn connect_state(&self) -> ConnectState {
        self.conn.read().unwrap().state
    }

    fn status(&self) -> SocketStatus {
        SocketStatus::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    fn set_status(&self, status: SocketStatus) {
        self.flags.store(status.bits(), Ordering::Relaxed);
    }

    pub fn is_nonblocking(&self) -> bool {
        self.status().contains(SocketStatus::NONBLOCK)
    }

    pub fn close_on_exec(&self) -> bool {
        self.status().contains(SocketStatus::CLOEXEC)
    }

    fn rcvtimeo(&self) -> Option<Duration> {
        timeo_duration(self.rcvtimeo_ms.load(Ordering::Relaxed))
    }

    fn sndtimeo(&self) -> Option<Duration> {
        timeo_duration(self.sndtimeo_ms.load(Ordering::Relaxed))
    }

    /* ------------------------- pipe plumbing ------------------------- */

    /// Generate this socket's pipe basename from its type and unique id.
    fn gen_pipe_name(&self) {
        let name = ns::pipe_basename(self.sock_type, self.unique_id);
        *self.pipe_path.lock().unwrap() = Some(name);
    }

    fn pipe_name(&self) -> Result<String, Errno> {
        self.pipe_path.lock().unwrap().clone().ok_or(Errno::EINVAL)
    }

    /// Propagate the O_NONBLOCK flag into the pipe handle. This also keeps
    /// the pipe in message mode unconditionally.
    fn set_pipe_non_blocking(&self, nonblocking: bool) {
        let io = self.io.read().unwrap();
        if let Some(pipe) = &io.pipe {
            pipe.set_nonblocking(nonblocking);
        }
    }

    /// Create this socket's pipe and its first instance.
    fn create_pipe(&self) -> Result<PipeHandle, Errno> {
        let name = self.pipe_name()?;
        let max_instances = match self.sock_type {
            UnixSocketType::Dgram => Some(1),
            UnixSocketType::Stream => None,
        };
        let pipe = pipe_root()
            .create_pipe(
                &name,
                max_instances,
                self.rmem.load(Ordering::Relaxed),
                self.wmem.load(Ordering::Relaxed),
            )
            .map_err(errno_for)?;
        pipe.set_nonblocking(self.is_nonblocking());
        Ok(pipe)
    }

    /// Create an additional instance of this socket's existing pipe.
    fn create_pipe_instance(&self) -> Result<PipeHandle, Errno> {
        let name = self.pipe_name()?;
        let pipe = pipe_root()
            .create_pipe_instance(
                &name,
                self.rmem.load(Ordering::Relaxed),
                self.wmem.load(Ordering::Relaxed),
            )
            .map_err(errno_for)?;
        pipe.set_nonblocking(self.is_nonblocking());
        Ok(pipe)
    }

    /// Open the peer's pipe and publish the handle. On a stream socket the
    /// handle becomes the data channel and the local name is sent right away;
    /// on a datagram socket the handle is kept as the connected send target.
    pub(crate) fn open_pipe(&self, pipe_name: &str) -> Result<(), HostStatus> {
        let pipe = pipe_root().open_pipe(pipe_name)?;
        pipe.set_nonblocking(self.is_nonblocking());
        match self.sock_type {
            UnixSocketType::Stream => {
                self.io.write().unwrap().pipe = Some(pipe);
                if self.send_my_name().is_err() {
                    log::debug!("couldn't send my name after connect");
                }
            }
            UnixSocketType::Dgram => {
                let mut conn = self.conn.write().unwrap();
                if let Some(old) = conn.peer_pipe.take() {
                    old.close();
                }
                conn.peer_pipe = Some(pipe);
            }
        }
        Ok(())
    }

    /// Try connecting first. If no instance is available, hand the job to
    /// the waiter.
    fn connect_pipe(socket: &Arc<Self>, pipe_name: &str) -> Result<(), Errno> {
        match socket.open_pipe(pipe_name) {
            Ok(()) => {
                socket.so_error.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(status) if status.no_instance_available() => {
                waiter::wait_pipe(socket, pipe_name.to_owned())
            }
            Err(status) => {
                let errno = errno_for(status);
                socket.so_error.store(errno as i32, Ordering::SeqCst);
                Err(errno)
            }
        }
    }

    /// Wait for a client on the listener's current instance.
    fn listen_pipe(&self) -> Result<(), Errno> {
        let pipe = self
            .io
            .read()
            .unwrap()
            .pipe
            .clone()
            .ok_or(Errno::EINVAL)?;
        match pipe.listen(None) {
            Ok(()) => Ok(()),
            Err(HostStatus::PipeListening) => Err(Errno::EAGAIN),
            Err(HostStatus::WaitSignaled) => Err(Errno::EINTR),
            Err(status) => Err(errno_for(status)),
        }
    }

    fn disconnect_pipe(pipe: &PipeHandle) {
        if let Err(status) = pipe.disconnect() {
            log::debug!("pipe disconnect failed: {status}");
        }
    }

    /* --------------------- peer-name handshake ----------------------- */

    /// Send the local name to the peer in a header-only packet. The theory:
    /// fire and forget.
    fn send_my_name(&self) -> Result<(), Errno> {
        let name = {
            let bind = self.bind.read().unwrap();
            bind.sun_path
        };
        let pkt = packet::encode_packet(0, name.as_ref(), &[], &[])?;

        let io = self.io.write().unwrap();
        let Some(pipe) = &io.pipe else {
            return Err(Errno::ENOTCONN);
        };
        pipe.set_nonblocking(true);
        let res = pipe.write(&pkt, None);
        pipe.set_nonblocking(self.is_nonblocking());
        match res {
            Ok(_) => Ok(()),
            Err(status) => {
                log::debug!("couldn't send my name: {status}");
                Err(errno_for(status))
            }
        }
    }

    /// Read the peer's name packet after accepting a connection. Locking is
    /// not required, user space doesn't know about this socket yet.
    fn recv_peer_name(&self) -> Result<(), Errno> {
        let pipe = self
            .io
            .read()
            .unwrap()
            .pipe
            .clone()
            .ok_or(Errno::ENOTCONN)?;

        pipe.set_nonblocking(false);
        let mut buf = vec![0u8; packet::HEADER_LEN + crate::utility::sockaddr::SUN_NAME_MAX];
        let res = pipe.read(&mut buf, Some(CONNECT_TIMEOUT));
        pipe.set_nonblocking(self.is_nonblocking());

        let n = match res {
            Ok(n) => n,
            Err(HostStatus::IoTimeout) => return Err(Errno::ECONNABORTED),
            Err(HostStatus::WaitSignaled) => return Err(Errno::EINTR),
            Err(status) => return Err(errno_for(status)),
        };
        buf.truncate(n);
        let pkt = Packet::decode(buf)?;
        if let Some(name) = pkt.name() {
            self.conn.write().unwrap().peer_sun_path = Some(name);
        }
        Ok(())
    }

    /* ------------------------- state machine ------------------------- */

    /// Bind creates the backing name object, generates the pipe name and
    /// sets the binding state. On datagram sockets it also creates the pipe;
    /// on stream sockets either listen or connect will do that.
    pub fn bind(&self, name: &SunName) -> Result<(), Errno> {
        if name.family() != Some(libc::AF_UNIX as libc::sa_family_t) {
            return Err(Errno::EINVAL);
        }
        let unnamed = name.is_unnamed();

        {
            let mut bind = self.bind.write().unwrap();
            match bind.state {
                BindingState::BindPending => return Err(Errno::EALREADY),
                BindingState::Bound => return Err(Errno::EINVAL),
                BindingState::Unbound => bind.state = BindingState::BindPending,
            }
        }

        self.gen_pipe_name();
        let pipe_name = self.pipe_name()?;

        if self.sock_type == UnixSocketType::Dgram {
            match self.create_pipe() {
                Ok(pipe) => self.io.write().unwrap().pipe = Some(pipe),
                Err(err) => {
                    self.bind.write().unwrap().state = BindingState::Unbound;
                    return Err(err);
                }
            }
        }

        let created = if unnamed {
            ns::autobind(&pipe_name, rand::thread_rng())
        } else {
            ns::create_backing(name, &pipe_name).map(|backing| (*name, backing))
        };
        let (bound_name, backing) = match created {
            Ok(x) => x,
            Err(err) => {
                if self.sock_type == UnixSocketType::Dgram {
                    if let Some(pipe) = self.io.write().unwrap().pipe.take() {
                        pipe.close();
                    }
                }
                self.bind.write().unwrap().state = BindingState::Unbound;
                return Err(err);
            }
        };

        {
            let mut bind = self.bind.write().unwrap();
            bind.sun_path = Some(bound_name);
            bind.backing = backing;
        }

        // if we're already connected, send the name to the peer
        let connected = self.conn.read().unwrap().state == ConnectState::Connected;
        if connected && self.sock_type == UnixSocketType::Stream {
            let _ = self.send_my_name();
        }

        self.bind.write().unwrap().state = BindingState::Bound;
        Ok(())
    }

    /// Create the pipe and mark this socket a listener. The backlog is
    /// recorded nowhere: instances are created on demand.
    pub fn listen(&self, _backlog: i32) -> Result<(), Errno> {
        if self.sock_type == UnixSocketType::Dgram {
            return Err(Errno::EOPNOTSUPP);
        }

        loop {
            let state = self.bind.read().unwrap().state;
            match state {
                BindingState::BindPending => std::thread::yield_now(),
                BindingState::Unbound => return Err(Errno::EDESTADDRREQ),
                BindingState::Bound => break,
            }
        }

        let mut conn = self.conn.write().unwrap();
        match conn.state {
            ConnectState::Unconnected | ConnectState::ConnectFailed => {}
            ConnectState::Listener => return Err(Errno::EADDRINUSE),
            _ => return Err(Errno::EINVAL),
        }
        match self.create_pipe() {
            Ok(pipe) => self.io.write().unwrap().pipe = Some(pipe),
            Err(err) => {
                conn.state = ConnectState::Unconnected;
                return Err(err);
            }
        }
        conn.state = ConnectState::Listener;
        Ok(())
    }

    pub fn accept(&self) -> Result<Arc<UnixSocket>, Errno> {
        self.accept4(SocketStatus::empty())
    }

    /// Accept one client. The connected instance moves into the returned
    /// socket; the listener installs a fresh instance for the next accept.
    pub fn accept4(&self, status: SocketStatus) -> Result<Arc<UnixSocket>, Errno> {
        if self.sock_type != UnixSocketType::Stream {
            return Err(Errno::EOPNOTSUPP);
        }
        if self.conn.read().unwrap().state != ConnectState::Listener {
            return Err(Errno::EINVAL);
        }

        self.listen_pipe()?;

        // our handle is now connected with a client and becomes the accepted
        // socket's data channel; replace it with a new instance atomically
        let accepted = {
            let mut io = self.io.write().unwrap();
            let accepted = io.pipe.take().ok_or(Errno::EINVAL)?;
            match self.create_pipe_instance() {
                Ok(new_inst) => {
                    io.pipe = Some(new_inst);
                    accepted
                }
                Err(err) => {
                    // we can't handle the client if we couldn't create a new
                    // instance to accept more connections
                    log::debug!("couldn't replace listener instance: {err}");
                    io.pipe = Some(accepted.clone());
                    drop(io);
                    Self::disconnect_pipe(&accepted);
                    return Err(Errno::ENOBUFS);
                }
            }
        };

        let child = Arc::new(Self::new(self.sock_type, status));
        accepted.set_nonblocking(child.is_nonblocking());
        {
            *child.pipe_path.lock().unwrap() = self.pipe_path.lock().unwrap().clone();
            let parent_bind = self.bind.read().unwrap();
            let mut bind = child.bind.write().unwrap();
            bind.state = parent_bind.state;
            bind.sun_path = parent_bind.sun_path;
            drop(bind);
            drop(parent_bind);
            child.conn.write().unwrap().state = ConnectState::Connected;
            child.io.write().unwrap().pipe = Some(accepted.clone());
        }

        match child.recv_peer_name() {
            Ok(()) => Ok(child),
            Err(err) => {
                Self::disconnect_pipe(&accepted);
                Err(err)
            }
        }
    }

    pub fn connect(socket: &Arc<Self>, name: &SunName) -> Result<(), Errno> {
        // test and set connection state
        {
            let mut conn = socket.conn.write().unwrap();
            match conn.state {
                ConnectState::ConnectPending => return Err(Errno::EALREADY),
                ConnectState::Listener => return Err(Errno::EADDRINUSE),
                ConnectState::Connected if socket.sock_type != UnixSocketType::Dgram => {
                    return Err(Errno::EISCONN)
                }
                _ => {}
            }
            conn.state = ConnectState::ConnectPending;
        }

        if let Err(err) = socket.check_peer_name(name) {
            socket.conn.write().unwrap().state = ConnectState::Unconnected;
            return Err(err);
        }

        // check that the peer address exists
        let (peer_type, pipe_name) = match ns::open_file(name) {
            Ok(x) => x,
            Err(err) => {
                socket.conn.write().unwrap().state = ConnectState::Unconnected;
                return Err(err);
            }
        };
        if peer_type != socket.sock_type {
            socket.conn.write().unwrap().state = ConnectState::Unconnected;
            return Err(Errno::EINVAL);
        }

        socket.conn.write().unwrap().peer_sun_path = Some(*name);

        if let Err(err) = Self::connect_pipe(socket, &pipe_name) {
            if err != Errno::EINPROGRESS {
                let mut conn = socket.conn.write().unwrap();
                conn.peer_sun_path = None;
                conn.state = ConnectState::ConnectFailed;
            }
            return Err(err);
        }

        socket.conn.write().unwrap().state = ConnectState::Connected;
        Ok(())
    }

    fn check_peer_name(&self, name: &SunName) -> Result<(), Errno> {
        if (name.len() as usize) <= crate::utility::sockaddr::SUN_PATH_OFFSET {
            return Err(Errno::EINVAL);
        }
        if name.family() != Some(libc::AF_UNIX as libc::sa_family_t) {
            return Err(Errno::EAFNOSUPPORT);
        }
        // the un-representable length-3 abstract name
        name.check_usable()
    }

    pub fn getsockname(&self) -> SunName {
        self.bind
            .read()
            .unwrap()
            .sun_path
            .unwrap_or_else(SunName::new_unnamed)
    }

    pub fn getpeername(&self) -> SunName {
        self.conn
            .read()
            .unwrap()
            .peer_sun_path
            .unwrap_or_else(SunName::new_unnamed)
    }

    pub fn getpeereid(&self) -> Result<Ucred, Errno> {
        if self.sock_type != UnixSocketType::Stream {
            return Err(Errno::EINVAL);
        }
        let conn = self.conn.read().unwrap();
        if conn.state != ConnectState::Connected {
            return Err(Errno::ENOTCONN);
        }
        Ok(conn.peer_cred)
    }

    pub fn shutdown(&self, _how: libc::c_int) -> Result<(), Errno> {
        Err(Errno::EAFNOSUPPORT)
    }

    /// Close is infallible from the caller's perspective: terminate and join
    /// the waiter (holding no lock across the join), then close the pipe and
    /// the backing-name handles.
    pub fn close(&self) {
        let (thread, termination) = {
            let mut slot = self.waiter.lock().unwrap();
            (slot.thread.take(), slot.termination.take())
        };
        if let Some(thread) = thread {
            if let Some(termination) = &termination {
                termination.set();
            }
            if thread.join().is_err() && !std::thread::panicking() {
                debug_panic!("connect waiter panicked");
            }
        }
        self.waiter.lock().unwrap().param.take();

        if let Some(pipe) = self.io.write().unwrap().pipe.take() {
            pipe.close();
        }
        if let Some(pipe) = self.conn.write().unwrap().peer_pipe.take() {
            pipe.close();
        }
        self.bind.read().unwrap().backing.close();
    }

    /* --------------------------- data path --------------------------- */

    /// Send on a connected socket. Stream payloads larger than one packet
    /// are split; the byte count actually placed on the pipe is returned.
    pub fn send(&self, buf: &[u8]) -> Result<usize, Errno> {
        if self.sock_type == UnixSocketType::Dgram {
            return self.sendto(buf, None);
        }
        if self.conn.read().unwrap().state != ConnectState::Connected {
            return Err(Errno::ENOTCONN);
        }
        let pipe = self
            .io
            .read()
            .unwrap()
            .pipe
            .clone()
            .ok_or(Errno::ENOTCONN)?;

        let mut sent = 0;
        for chunk in buf.chunks(packet::max_data_len(0, 0)) {
            let pkt = packet::encode_packet(0, None, &[], chunk)?;
            match pipe.write(&pkt, self.sndtimeo()) {
                Ok(0) => {
                    // non-blocking pipe couldn't take the packet
                    if sent == 0 {
                        return Err(Errno::EAGAIN);
                    }
                    break;
                }
                Ok(_) => sent += chunk.len(),
                Err(status) => {
                    if sent > 0 {
                        break;
                    }
                    return Err(match status {
                        HostStatus::IoTimeout => Errno::EAGAIN,
                        HostStatus::WaitSignaled => Errno::EINTR,
                        status if status.pipe_is_closing() => Errno::EPIPE,
                        status => errno_for(status),
                    });
                }
            }
        }
        Ok(sent)
    }

    /// Receive from a connected stream socket. One packet is consumed per
    /// call; a packet that carries the sender's name updates the stored peer
    /// name, so a peer that rebinds is observed here.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        if self.sock_type == UnixSocketType::Dgram {
            return Ok(self.recvfrom(buf)?.0);
        }
        let pipe = self
            .io
            .read()
            .unwrap()
            .pipe
            .clone()
            .ok_or(Errno::ENOTCONN)?;

        let mut pktbuf = vec![0u8; MAX_PACKET_LEN];
        let n = match pipe.read(&mut pktbuf, self.rcvtimeo()) {
            Ok(n) => n,
            Err(status) if status.pipe_is_closing() => return Ok(0),
            Err(HostStatus::PipeEmpty) | Err(HostStatus::IoTimeout) => {
                return Err(Errno::EAGAIN)
            }
            Err(HostStatus::WaitSignaled) => return Err(Errno::EINTR),
            Err(status) => return Err(errno_for(status)),
        };
        pktbuf.truncate(n);
        let pkt = Packet::decode(pktbuf)?;
        if let Some(name) = pkt.name() {
            self.conn.write().unwrap().peer_sun_path = Some(name);
        }

        let data = pkt.data();
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        if n < data.len() {
            log::warn!("stream packet truncated from {} to {n} bytes", data.len());
        }
        Ok(n)
    }

    /// Send one datagram. The sender's bound name rides along in the packet.
    pub fn sendto(&self, buf: &[u8], to: Option<&SunName>) -> Result<usize, Errno> {
        if self.sock_type == UnixSocketType::Stream {
            return match to {
                Some(_) => Err(Errno::EISCONN),
                None => self.send(buf),
            };
        }

        let (use_connected, dest) = match to {
            Some(dest) => (false, *dest),
            None => {
                let conn = self.conn.read().unwrap();
                match conn.peer_sun_path {
                    Some(peer) if conn.state == ConnectState::Connected => (true, peer),
                    _ => return Err(Errno::EDESTADDRREQ),
                }
            }
        };
        self.check_peer_name(&dest)?;

        let (peer_type, pipe_name) = ns::open_file(&dest)?;
        if peer_type != UnixSocketType::Dgram {
            return Err(Errno::EINVAL);
        }

        let name = self.bind.read().unwrap().sun_path;
        let pkt = packet::encode_packet(0, name.as_ref(), &[], buf)?;

        let (pipe, transient) = if use_connected {
            let pipe = self.conn.read().unwrap().peer_pipe.clone();
            match pipe {
                Some(pipe) => (pipe, false),
                // connected without a cached handle; open one transiently
                None => (self.open_dgram_pipe(&pipe_name)?, true),
            }
        } else {
            (self.open_dgram_pipe(&pipe_name)?, true)
        };

        let res = pipe.write(&pkt, self.sndtimeo());
        if transient {
            pipe.close();
        }
        match res {
            Ok(0) => Err(Errno::EAGAIN),
            Ok(_) => Ok(buf.len()),
            Err(HostStatus::IoTimeout) => Err(Errno::EAGAIN),
            Err(HostStatus::WaitSignaled) => Err(Errno::EINTR),
            Err(status) => Err(errno_for(status)),
        }
    }

    /// Open a datagram peer's single-instance pipe, waiting for the instance
    /// when another sender holds it.
    fn open_dgram_pipe(&self, pipe_name: &str) -> Result<PipeHandle, Errno> {
        loop {
            match pipe_root().open_pipe(pipe_name) {
                Ok(pipe) => {
                    pipe.set_nonblocking(self.is_nonblocking());
                    return Ok(pipe);
                }
                Err(status) if status.no_instance_available() => {
                    if self.is_nonblocking() {
                        return Err(Errno::EAGAIN);
                    }
                    let timeout = self.sndtimeo().unwrap_or(CONNECT_TIMEOUT);
                    match pipe_root().wait_for_instance(pipe_name, timeout, None, SigMode::Eintr)
                    {
                        Ok(()) => continue,
                        Err(HostStatus::IoTimeout) => {
                            if self.sndtimeo().is_some() {
                                return Err(Errno::EAGAIN);
                            }
                            continue;
                        }
                        Err(HostStatus::WaitSignaled) => return Err(Errno::EINTR),
                        Err(status) => return Err(errno_for(status)),
                    }
                }
                Err(status) => return Err(errno_for(status)),
            }
        }
    }

    /// Receive one datagram, reporting the sender's address when the sender
    /// was bound.
    pub fn recvfrom(&self, buf: &mut [u8]) -> Result<(usize, Option<SunName>), Errno> {
        if self.sock_type == UnixSocketType::Stream {
            return Ok((self.recv(buf)?, None));
        }
        let pipe = self
            .io
            .read()
            .unwrap()
            .pipe
            .clone()
            .ok_or(Errno::EINVAL)?;

        let deadline = self.rcvtimeo().map(|t| Instant::now() + t);

        loop {
            match pipe.listen(remaining(deadline)) {
                Ok(()) => {}
                Err(HostStatus::PipeListening) | Err(HostStatus::IoTimeout) => {
                    return Err(Errno::EAGAIN)
                }
                Err(HostStatus::WaitSignaled) => return Err(Errno::EINTR),
                Err(status) => return Err(errno_for(status)),
            }

            let mut pktbuf = vec![0u8; MAX_PACKET_LEN];
            let n = match pipe.read(&mut pktbuf, remaining(deadline)) {
                Ok(n) => n,
                Err(status) if status.pipe_is_closing() => {
                    // the sender went away; recycle the instance for the next
                    Self::disconnect_pipe(&pipe);
                    continue;
                }
                Err(HostStatus::PipeEmpty) | Err(HostStatus::IoTimeout) => {
                    return Err(Errno::EAGAIN)
                }
                Err(HostStatus::WaitSignaled) => return Err(Errno::EINTR),
                Err(status) => return Err(errno_for(status)),
            };
            pktbuf.truncate(n);
            let pkt = Packet::decode(pktbuf)?;
            let src = pkt.name().filter(|name| !name.is_unnamed());

            let data = pkt.data();
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            return Ok((n, src));
        }
    }

    /// The msghdr form able to carry ancillary data; not realized yet.
    pub fn sendmsg(
        &self,
        _iov: &[std::io::IoSlice],
        _cmsg: &[u8],
        _to: Option<&SunName>,
        _flags: libc::c_int,
    ) -> Result<usize, Errno> {
        Err(Errno::EAFNOSUPPORT)
    }

    /// The msghdr form able to carry ancillary data; not realized yet.
    pub fn recvmsg(
        &self,
        _iov: &mut [std::io::IoSliceMut],
        _cmsg: &mut [u8],
        _flags: libc::c_int,
    ) -> Result<usize, Errno> {
        Err(Errno::EAFNOSUPPORT)
    }

    /* ----------------------- options and controls -------------------- */

    pub fn setsockopt(
        &self,
        level: libc::c_int,
        optname: libc::c_int,
        optval: &[u8],
    ) -> Result<(), Errno> {
        if level != libc::SOL_SOCKET {
            return Err(Errno::ENOPROTOOPT);
        }
        match optname {
            libc::SO_PASSCRED => Ok(()),
            libc::SO_REUSEADDR => {
                self.saw_reuseaddr
                    .store(read_int(optval)? != 0, Ordering::Relaxed);
                Ok(())
            }
            libc::SO_RCVBUF => {
                self.rmem
                    .store(read_int(optval)?.max(0) as usize, Ordering::Relaxed);
                Ok(())
            }
            libc::SO_SNDBUF => {
                self.wmem
                    .store(read_int(optval)?.max(0) as usize, Ordering::Relaxed);
                Ok(())
            }
            libc::SO_RCVTIMEO | libc::SO_SNDTIMEO => {
                if optval.len() < std::mem::size_of::<libc::timeval>() {
                    return Err(Errno::EINVAL);
                }
                let ms = timeval_to_ms(optval).ok_or(Errno::EDOM)?;
                let cell = if optname == libc::SO_RCVTIMEO {
                    &self.rcvtimeo_ms
                } else {
                    &self.sndtimeo_ms
                };
                cell.store(ms, Ordering::Relaxed);
                Ok(())
            }
            // unix sockets simply ignore all other SOL_SOCKET options
            _ => Ok(()),
        }
    }

    /// Write the option value into `optval` and return the stored size.
    pub fn getsockopt(
        &self,
        level: libc::c_int,
        optname: libc::c_int,
        optval: &mut [u8],
    ) -> Result<usize, Errno> {
        if level != libc::SOL_SOCKET {
            return Err(Errno::ENOPROTOOPT);
        }
        match optname {
            libc::SO_ERROR => {
                let err = self.so_error.swap(0, Ordering::SeqCst);
                write_int(optval, err)
            }
            libc::SO_PASSCRED => write_int(optval, 0),
            libc::SO_PEERCRED => {
                if optval.len() < 12 {
                    return Err(Errno::EINVAL);
                }
                if self.sock_type != UnixSocketType::Stream {
                    return Err(Errno::EINVAL);
                }
                let cred = {
                    let conn = self.conn.read().unwrap();
                    if conn.state != ConnectState::Connected {
                        return Err(Errno::ENOTCONN);
                    }
                    conn.peer_cred
                };
                optval[0..4].copy_from_slice(&cred.pid.to_ne_bytes());
                optval[4..8].copy_from_slice(&cred.uid.to_ne_bytes());
                optval[8..12].copy_from_slice(&cred.gid.to_ne_bytes());
                Ok(12)
            }
            libc::SO_REUSEADDR => {
                write_int(optval, self.saw_reuseaddr.load(Ordering::Relaxed) as i32)
            }
            libc::SO_RCVBUF => write_int(optval, self.rmem.load(Ordering::Relaxed) as i32),
            libc::SO_SNDBUF => write_int(optval, self.wmem.load(Ordering::Relaxed) as i32),
            libc::SO_RCVTIMEO | libc::SO_SNDTIMEO => {
                if optval.len() < std::mem::size_of::<libc::timeval>() {
                    return Err(Errno::EINVAL);
                }
                let ms = if optname == libc::SO_RCVTIMEO {
                    self.rcvtimeo_ms.load(Ordering::Relaxed)
                } else {
                    self.sndtimeo_ms.load(Ordering::Relaxed)
                };
                let (sec, usec) = if ms == 0 || ms == TIMEO_INFINITE {
                    (0i64, 0i64)
                } else {
                    ((ms / 1000) as i64, ((ms % 1000) * 1000) as i64)
                };
                optval[0..8].copy_from_slice(&sec.to_ne_bytes());
                optval[8..16].copy_from_slice(&usec.to_ne_bytes());
                Ok(std::mem::size_of::<libc::timeval>())
            }
            libc::SO_TYPE => write_int(optval, self.sock_type.to_raw()),
            libc::SO_LINGER => {
                let len = std::mem::size_of::<libc::linger>();
                if optval.len() < len {
                    return Err(Errno::EINVAL);
                }
                optval[..len].fill(0);
                Ok(len)
            }
            // unix sockets simply ignore all other SOL_SOCKET options
            _ => write_int(optval, 0),
        }
    }

    pub fn ioctl(&self, cmd: libc::c_ulong, arg: &mut libc::c_int) -> Result<(), Errno> {
        match cmd {
            libc::FIONBIO => {
                let was_nonblocking = self.is_nonblocking();
                let mut status = self.status();
                status.set(SocketStatus::NONBLOCK, *arg != 0);
                self.set_status(status);
                let now_nonblocking = self.is_nonblocking();
                if was_nonblocking != now_nonblocking {
                    self.set_pipe_non_blocking(now_nonblocking);
                }
                Ok(())
            }
            libc::FIOASYNC => Ok(()),
            SIOCATMARK => {
                *arg = 0;
                Ok(())
            }
            _ => Err(Errno::EINVAL),
        }
    }

    pub fn fcntl(&self, cmd: libc::c_int, arg: libc::c_int) -> Result<libc::c_int, Errno> {
        match cmd {
            libc::F_GETFL => {
                let status = self.status();
                let mut flags = 0;
                if status.contains(SocketStatus::NONBLOCK) {
                    flags |= libc::O_NONBLOCK;
                }
                if status.contains(SocketStatus::APPEND) {
                    flags |= libc::O_APPEND;
                }
                Ok(flags)
            }
            libc::F_SETFL => {
                let was_nonblocking = self.is_nonblocking();
                let mut status = self.status();
                status.set(SocketStatus::NONBLOCK, arg & libc::O_NONBLOCK != 0);
                status.set(SocketStatus::APPEND, arg & libc::O_APPEND != 0);
                self.set_status(status);
                let now_nonblocking = self.is_nonblocking();
                if was_nonblocking != now_nonblocking {
                    self.set_pipe_non_blocking(now_nonblocking);
                }
                Ok(0)
            }
            libc::F_GETFD => {
                Ok(if self.close_on_exec() { libc::FD_CLOEXEC } else { 0 })
            }
            libc::F_SETFD => {
                let mut status = self.status();
                status.set(SocketStatus::CLOEXEC, arg & libc::FD_CLOEXEC != 0);
                self.set_status(status);
                Ok(0)
            }
            libc::F_GETOWN | libc::F_SETOWN => Ok(0),
            _ => Err(Errno::EINVAL),
        }
    }

    /* --------------------- file-object fallthrough ------------------- */

    /// The filesystem node backing a pathname-bound socket, if any.
    fn bound_path_node(&self) -> Option<Result<Arc<FsNode>, Errno>> {
        let bind = self.bind.read().unwrap();
        let sun = bind.sun_path.as_ref()?;
        let path = sun.as_path()?;
        let path = match std::str::from_utf8(path.to_bytes()) {
            Ok(p) => std::path::PathBuf::from(p),
            Err(_) => return Some(Err(Errno::EILSEQ)),
        };
        Some(fs::fs().open(&path).map_err(errno_for))
    }

    pub fn fstat(&self) -> Result<FileStat, Errno> {
        match self.bound_path_node() {
            Some(node) => {
                let mut st = node?.stat();
                st.st_mode = (st.st_mode & !libc::S_IFMT) | libc::S_IFSOCK;
                st.st_size = 0;
                Ok(st)
            }
            None => {
                let cred = host::my_cred();
                Ok(FileStat {
                    st_ino: self.unique_id,
                    st_mode: libc::S_IFSOCK
                        | libc::S_IRWXU
                        | libc::S_IRWXG
                        | libc::S_IRWXO,
                    st_uid: cred.uid,
                    st_gid: cred.gid,
                    st_nlink: 1,
                    st_size: 0,
                })
            }
        }
    }

    pub fn fchmod(&self, mode: libc::mode_t) -> Result<(), Errno> {
        match self.bound_path_node() {
            Some(node) => {
                // Kludge: don't allow to remove the read bit on socket files
                // for user/group/other if the accompanying write bit is set,
                // so that anybody able to access the socket can read the
                // contents of the socket file.
                let mode =
                    mode | ((mode & (libc::S_IWUSR | libc::S_IWGRP | libc::S_IWOTH)) << 1);
                node?.chmod(libc::S_IFSOCK | mode);
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn fchown(&self, uid: libc::uid_t, gid: libc::gid_t) -> Result<(), Errno> {
        match self.bound_path_node() {
            Some(node) => {
                node?.chown(uid, gid);
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn facl_get(&self) -> Result<Vec<AclEntry>, Errno> {
        match self.bound_path_node() {
            Some(node) => Ok(node?.get_acl()),
            None => Err(Errno::EINVAL),
        }
    }

    pub fn facl_set(&self, entries: &[AclEntry]) -> Result<(), Errno> {
        match self.bound_path_node() {
            Some(node) => {
                node?.set_acl(entries);
                Ok(())
            }
            None => Err(Errno::EINVAL),
        }
    }

    /// Create an additional filesystem name for a pathname-bound socket.
    pub fn link(&self, newpath: &std::path::Path) -> Result<(), Errno> {
        let bind = self.bind.read().unwrap();
        let Some(sun) = bind.sun_path.as_ref() else {
            return Err(Errno::EINVAL);
        };
        let Some(path) = sun.as_path() else {
            return Err(Errno::EINVAL);
        };
        let oldpath = std::path::PathBuf::from(
            std::str::from_utf8(path.to_bytes()).map_err(|_| Errno::EILSEQ)?,
        );
        fs::fs().link(&oldpath, newpath).map_err(|status| match status {
            HostStatus::ObjectNameCollision => Errno::EEXIST,
            other => errno_for(other),
        })
    }
}

impl Drop for UnixSocket {
    fn drop(&mut self) {
        self.close();
    }
}

fn timeo_duration(ms: u32) -> Option<Duration> {
    match ms {
        0 | TIMEO_INFINITE => None,
        ms => Some(Duration::from_millis(ms as u64)),
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

fn read_int(buf: &[u8]) -> Result<i32, Errno> {
    let bytes: [u8; 4] = buf
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(Errno::EINVAL)?;
    Ok(i32::from_ne_bytes(bytes))
}

fn write_int(buf: &mut [u8], val: i32) -> Result<usize, Errno> {
    let Some(out) = buf.get_mut(..4) else {
        return Err(Errno::EINVAL);
    };
    out.copy_from_slice(&val.to_ne_bytes());
    Ok(4)
}

/// Convert a raw `timeval` to milliseconds. `None` when the value cannot be
/// represented.
fn timeval_to_ms(buf: &[u8]) -> Option<u32> {
    let sec = i64::from_ne_bytes(buf.get(0..8)?.try_into().ok()?);
    let usec = i64::from_ne_bytes(buf.get(8..16)?.try_into().ok()?);
    if sec < 0 || usec < 0 || usec >= 1_000_000 {
        return None;
    }
    let ms = (sec as u64)
        .checked_mul(1000)?
        .checked_add((usec as u64 + 999) / 1000)?;
    if ms >= TIMEO_INFINITE as u64 {
        return None;
    }
    Some(ms as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_validates_arguments() {
        assert_eq!(
            UnixSocket::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap_err(),
            Errno::EAFNOSUPPORT
        );
        assert_eq!(
            UnixSocket::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0).unwrap_err(),
            Errno::EINVAL
        );
        assert_eq!(
            UnixSocket::socket(libc::AF_UNIX, libc::SOCK_STREAM, 1).unwrap_err(),
            Errno::EPROTONOSUPPORT
        );

        let sock =
            UnixSocket::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0)
                .unwrap();
        assert!(sock.is_nonblocking());
        assert!(!sock.close_on_exec());
    }

    #[test]
    fn socketpair_not_realized() {
        assert_eq!(
            UnixSocket::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap_err(),
            Errno::EAFNOSUPPORT
        );
        // argument validation still applies
        assert_eq!(
            UnixSocket::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 7).unwrap_err(),
            Errno::EPROTONOSUPPORT
        );
    }

    #[test]
    fn unique_ids_differ() {
        let a = UnixSocket::socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0).unwrap();
        let b = UnixSocket::socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0).unwrap();
        assert_ne!(a.unique_id(), b.unique_id());
    }

    #[test]
    fn timeval_conversion() {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&2i64.to_ne_bytes());
        buf[8..16].copy_from_slice(&500_000i64.to_ne_bytes());
        assert_eq!(timeval_to_ms(&buf), Some(2500));

        buf[8..16].copy_from_slice(&(-1i64).to_ne_bytes());
        assert_eq!(timeval_to_ms(&buf), None);

        buf[0..8].copy_from_slice(&(-1i64).to_ne_bytes());
        buf[8..16].copy_from_slice(&0i64.to_ne_bytes());
        assert_eq!(timeval_to_ms(&buf), None);

        buf[0..8].copy_from_slice(&i64::MAX.to_ne_bytes());
        assert_eq!(timeval_to_ms(&buf), None);
    }

    #[test]
    fn shutdown_is_a_placeholder() {
        let sock = UnixSocket::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();
        assert_eq!(sock.shutdown(libc::SHUT_RDWR).unwrap_err(), Errno::EAFNOSUPPORT);
    }

    #[test]
    fn fstat_synthesizes_socket_inode() {
        let sock = UnixSocket::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();
        let st = sock.fstat().unwrap();
        assert_eq!(st.st_ino, sock.unique_id());
        assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFSOCK);
        assert_eq!(st.st_size, 0);
    }
}
