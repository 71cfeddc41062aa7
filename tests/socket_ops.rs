//! End-to-end socket scenarios across threads: rendezvous, handshake,
//! datagram address embedding, non-blocking connect, and interruption.

use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use afunix::host::wait::current_signal_token;
use afunix::{ConnectState, Errno, SunName, UnixSocket};

fn unique_tag() -> u64 {
    static N: AtomicU64 = AtomicU64::new(0);
    N.fetch_add(1, Ordering::Relaxed)
}

fn upath(prefix: &str) -> SunName {
    let path = CString::new(format!("/tmp/{prefix}-{}-{}", std::process::id(), unique_tag()))
        .unwrap();
    SunName::new_path(&path).unwrap()
}

fn uabstract(prefix: &str) -> SunName {
    let name = format!("{prefix}-{}-{}", std::process::id(), unique_tag());
    SunName::new_abstract(name.as_bytes()).unwrap()
}

fn stream_socket() -> std::sync::Arc<UnixSocket> {
    UnixSocket::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap()
}

fn dgram_socket() -> std::sync::Arc<UnixSocket> {
    UnixSocket::socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0).unwrap()
}

fn so_error(sock: &UnixSocket) -> i32 {
    let mut buf = [0u8; 4];
    sock.getsockopt(libc::SOL_SOCKET, libc::SO_ERROR, &mut buf)
        .unwrap();
    i32::from_ne_bytes(buf)
}

fn wait_not_pending(sock: &UnixSocket) -> ConnectState {
    for _ in 0..1000 {
        let state = sock.connect_state();
        if state != ConnectState::ConnectPending {
            return state;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("connect still pending");
}

/// A stream server observes an unnamed client's peer name as length 2, and a
/// bind performed after the connect reaches the server as one header-only
/// packet carrying the client's new name.
#[test]
fn stream_connect_accept_and_rebind() {
    let name = upath("s1");
    let server = stream_socket();
    server.bind(&name).unwrap();
    server.listen(5).unwrap();

    let client = stream_socket();
    let client2 = std::sync::Arc::clone(&client);
    let peer_name = name;
    let t = std::thread::spawn(move || {
        UnixSocket::connect(&client2, &peer_name).unwrap();
    });

    let child = server.accept().unwrap();
    t.join().unwrap();

    // the client was not bound: its name is unnamed, length 2
    assert_eq!(child.getpeername().len(), 2);
    assert!(child.getpeername().is_unnamed());

    // both sides observe each other (the client side trivially)
    assert_eq!(client.getpeername(), server.getsockname());
    assert_eq!(child.getsockname(), server.getsockname());

    // border case: bind after connect announces the new name to the peer
    let late_name = uabstract("s1-late");
    client.bind(&late_name).unwrap();

    let mut buf = [0u8; 64];
    // the name packet delivers zero user bytes
    assert_eq!(child.recv(&mut buf).unwrap(), 0);
    assert_eq!(child.getpeername(), late_name);

    // exactly once: nothing else is queued
    let mut on = 1;
    child.ioctl(libc::FIONBIO, &mut on).unwrap();
    assert_eq!(child.recv(&mut buf).unwrap_err(), Errno::EAGAIN);
}

#[test]
fn stream_data_both_directions() {
    let name = uabstract("s1-data");
    let server = stream_socket();
    server.bind(&name).unwrap();
    server.listen(5).unwrap();

    let client = stream_socket();
    let client2 = std::sync::Arc::clone(&client);
    let t = std::thread::spawn(move || {
        UnixSocket::connect(&client2, &name).unwrap();
        assert_eq!(client2.send(b"hello").unwrap(), 5);
    });

    let child = server.accept().unwrap();
    t.join().unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(child.recv(&mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");

    assert_eq!(child.send(b"world!").unwrap(), 6);
    assert_eq!(client.recv(&mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"world!");

    // getsockname after bind returns the same bytes and length
    assert_eq!(server.getsockname(), name);

    // a bound client's name reaches the acceptor through the handshake
    let bound_client = stream_socket();
    let bound_name = uabstract("s1-bound");
    bound_client.bind(&bound_name).unwrap();
    let bc = std::sync::Arc::clone(&bound_client);
    let t = std::thread::spawn(move || {
        UnixSocket::connect(&bc, &name).unwrap();
    });
    let child2 = server.accept().unwrap();
    t.join().unwrap();
    assert_eq!(child2.getpeername(), bound_name);
    assert_eq!(bound_client.getsockname(), bound_name);
}

/// Autobind: an unnamed bind picks a fresh 5-hex-digit abstract name; the
/// nul-only abstract name is rejected outright.
#[test]
fn abstract_autobind() {
    let sock = dgram_socket();

    // family + single nul path byte, length 3
    let nul_only = SunName::from_raw(&[libc::AF_UNIX as u8, 0, 0]);
    assert_eq!(sock.bind(&nul_only).unwrap_err(), Errno::EINVAL);

    // unnamed, length 2: autobind
    sock.bind(&SunName::new_unnamed()).unwrap();
    let bound = sock.getsockname();
    assert_eq!(bound.len(), 8);
    let tail = bound.as_abstract().unwrap();
    assert_eq!(tail.len(), 5);
    assert!(tail.iter().all(|b| b.is_ascii_hexdigit()));

    let other = dgram_socket();
    other.bind(&SunName::new_unnamed()).unwrap();
    assert_ne!(other.getsockname(), bound);
}

#[test]
fn bind_collision() {
    let name = upath("s3");
    let first = stream_socket();
    first.bind(&name).unwrap();

    let second = stream_socket();
    assert_eq!(second.bind(&name).unwrap_err(), Errno::EADDRINUSE);

    // rebinding the bound socket is also rejected
    assert_eq!(first.bind(&upath("s3-other")).unwrap_err(), Errno::EINVAL);
}

/// Non-blocking connect against a busy listener: EINPROGRESS, then the waiter
/// completes once an instance frees up, and SO_ERROR reads 0 exactly once
/// (trivially, since it stays 0).
#[test]
fn nonblocking_connect_completes() {
    let name = upath("s4");
    let server = stream_socket();
    server.bind(&name).unwrap();
    server.listen(5).unwrap();

    // occupy the listener's only instance; no accept yet, so no replacement
    // instance exists
    let first = stream_socket();
    UnixSocket::connect(&first, &name).unwrap();

    let second = UnixSocket::socket(
        libc::AF_UNIX,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
        0,
    )
    .unwrap();
    assert_eq!(UnixSocket::connect(&second, &name).unwrap_err(), Errno::EINPROGRESS);

    // accepting the first client installs a fresh instance; the waiter grabs
    // it and finishes the pending connect
    let _child_a = server.accept().unwrap();
    assert_eq!(wait_not_pending(&second), ConnectState::Connected);
    let _child_b = server.accept().unwrap();

    assert_eq!(so_error(&second), 0);
    assert_eq!(so_error(&second), 0);
}

/// Non-blocking connect whose waiter fails publishes the error through
/// SO_ERROR, which reads non-zero exactly once.
#[test]
fn nonblocking_connect_failure_latches_so_error() {
    let name = upath("s4-fail");
    let server = stream_socket();
    server.bind(&name).unwrap();
    server.listen(5).unwrap();

    // occupy the single instance so the next connect goes to the waiter
    let first = stream_socket();
    UnixSocket::connect(&first, &name).unwrap();

    let second = UnixSocket::socket(
        libc::AF_UNIX,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
        0,
    )
    .unwrap();
    assert_eq!(UnixSocket::connect(&second, &name).unwrap_err(), Errno::EINPROGRESS);

    // tear the listener down; the waiter observes the vanished pipe
    server.close();
    drop(server);

    assert_eq!(wait_not_pending(&second), ConnectState::ConnectFailed);
    assert_eq!(so_error(&second), Errno::ENOENT as i32);
    assert_eq!(so_error(&second), 0);
}

/// A signal delivered to a thread blocked in accept interrupts it with EINTR
/// and leaves the socket a listener.
#[test]
fn signal_interrupts_accept() {
    let name = uabstract("s5");
    let server = stream_socket();
    server.bind(&name).unwrap();
    server.listen(5).unwrap();

    let (tx, rx) = mpsc::channel();
    let srv = std::sync::Arc::clone(&server);
    let t = std::thread::spawn(move || {
        tx.send(current_signal_token()).unwrap();
        srv.accept()
    });

    let token = rx.recv().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    token.raise();

    let res = t.join().unwrap();
    assert_eq!(res.err(), Some(Errno::EINTR));
    assert_eq!(server.connect_state(), ConnectState::Listener);

    // the listener still works
    let client = stream_socket();
    let c = std::sync::Arc::clone(&client);
    let t = std::thread::spawn(move || {
        UnixSocket::connect(&c, &name).unwrap();
    });
    let _child = server.accept().unwrap();
    t.join().unwrap();
}

/// Datagram sends carry the sender's bound name; unbound senders arrive
/// without a source address.
#[test]
fn dgram_address_embedding() {
    let name = upath("s6");
    let receiver = dgram_socket();
    receiver.bind(&name).unwrap();

    let bound_sender = dgram_socket();
    let sender_name = uabstract("s6-sender");
    bound_sender.bind(&sender_name).unwrap();
    assert_eq!(bound_sender.sendto(b"hello", Some(&name)).unwrap(), 5);

    let mut buf = [0u8; 64];
    let (n, src) = receiver.recvfrom(&mut buf).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(src.unwrap(), sender_name);

    // the second sender has to wait until the receiver recycles the single
    // pipe instance, so it runs concurrently with the receive
    let anon_sender = dgram_socket();
    let t = std::thread::spawn(move || anon_sender.sendto(b"anon", Some(&name)));
    let (n, src) = receiver.recvfrom(&mut buf).unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf[..4], b"anon");
    assert!(src.is_none());
    assert_eq!(t.join().unwrap().unwrap(), 4);
}

#[test]
fn dgram_connected_send() {
    let name = uabstract("s6-conn");
    let receiver = dgram_socket();
    receiver.bind(&name).unwrap();

    let sender = dgram_socket();
    UnixSocket::connect(&sender, &name).unwrap();
    assert_eq!(sender.connect_state(), ConnectState::Connected);
    assert_eq!(sender.send(b"via-connect").unwrap(), 11);

    let mut buf = [0u8; 64];
    let (n, src) = receiver.recvfrom(&mut buf).unwrap();
    assert_eq!(n, 11);
    assert!(src.is_none());

    // a datagram socket may be re-connected
    let other = dgram_socket();
    let other_name = uabstract("s6-conn-2");
    other.bind(&other_name).unwrap();
    UnixSocket::connect(&sender, &other_name).unwrap();
}

#[test]
fn state_machine_errors() {
    let name = uabstract("state");
    let sock = stream_socket();

    // listen before bind
    assert_eq!(sock.listen(5).unwrap_err(), Errno::EDESTADDRREQ);

    sock.bind(&name).unwrap();
    sock.listen(5).unwrap();
    // a listener cannot connect
    assert_eq!(UnixSocket::connect(&sock, &name).unwrap_err(), Errno::EADDRINUSE);
    // listen twice
    assert_eq!(sock.listen(5).unwrap_err(), Errno::EADDRINUSE);

    // accept on a non-listener
    let other = stream_socket();
    assert_eq!(other.accept().unwrap_err(), Errno::EINVAL);

    // dgram sockets do not listen or accept
    let dgram = dgram_socket();
    assert_eq!(dgram.listen(5).unwrap_err(), Errno::EOPNOTSUPP);
    assert_eq!(dgram.accept().unwrap_err(), Errno::EOPNOTSUPP);

    // connecting to nowhere fails before any pipe is touched
    let client = stream_socket();
    assert_eq!(
        UnixSocket::connect(&client, &uabstract("state-nothing")).unwrap_err(),
        Errno::ENOENT
    );
    assert_eq!(client.connect_state(), ConnectState::Unconnected);

    // connecting a stream socket to a datagram peer
    let dname = uabstract("state-dgram");
    dgram.bind(&dname).unwrap();
    let client = stream_socket();
    assert_eq!(UnixSocket::connect(&client, &dname).unwrap_err(), Errno::EINVAL);

    // sending on an unconnected datagram socket without an address
    assert_eq!(dgram.send(b"x").unwrap_err(), Errno::EDESTADDRREQ);
}

#[test]
fn double_connect_is_eisconn() {
    let name = uabstract("eisconn");
    let server = stream_socket();
    server.bind(&name).unwrap();
    server.listen(5).unwrap();

    let client = stream_socket();
    let c = std::sync::Arc::clone(&client);
    let t = std::thread::spawn(move || {
        UnixSocket::connect(&c, &name).unwrap();
        UnixSocket::connect(&c, &name)
    });
    let _child = server.accept().unwrap();
    assert_eq!(t.join().unwrap().unwrap_err(), Errno::EISCONN);
}

#[test]
fn nonblocking_flag_sync_is_idempotent() {
    let sock = stream_socket();

    let mut on = 1;
    sock.ioctl(libc::FIONBIO, &mut on).unwrap();
    assert!(sock.is_nonblocking());
    assert_ne!(sock.fcntl(libc::F_GETFL, 0).unwrap() & libc::O_NONBLOCK, 0);

    // same value again: no change
    sock.ioctl(libc::FIONBIO, &mut on).unwrap();
    assert!(sock.is_nonblocking());

    let mut off = 0;
    sock.ioctl(libc::FIONBIO, &mut off).unwrap();
    assert!(!sock.is_nonblocking());
    assert_eq!(sock.fcntl(libc::F_GETFL, 0).unwrap() & libc::O_NONBLOCK, 0);

    // F_SETFL drives the same flag
    sock.fcntl(libc::F_SETFL, libc::O_NONBLOCK).unwrap();
    assert!(sock.is_nonblocking());
}

#[test]
fn receive_timeout_reports_eagain() {
    let name = uabstract("timeo");
    let server = stream_socket();
    server.bind(&name).unwrap();
    server.listen(5).unwrap();

    let client = stream_socket();
    let c = std::sync::Arc::clone(&client);
    let t = std::thread::spawn(move || {
        UnixSocket::connect(&c, &name).unwrap();
    });
    let child = server.accept().unwrap();
    t.join().unwrap();

    // 50 ms receive timeout as a timeval
    let mut tv = [0u8; 16];
    tv[8..16].copy_from_slice(&50_000i64.to_ne_bytes());
    child
        .setsockopt(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv)
        .unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(child.recv(&mut buf).unwrap_err(), Errno::EAGAIN);

    // an invalid timeval is out of the representable domain
    let mut bad = [0u8; 16];
    bad[8..16].copy_from_slice(&(-1i64).to_ne_bytes());
    assert_eq!(
        child
            .setsockopt(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &bad)
            .unwrap_err(),
        Errno::EDOM
    );
}

#[test]
fn peer_credentials_default() {
    let name = uabstract("cred");
    let server = stream_socket();
    server.bind(&name).unwrap();
    server.listen(5).unwrap();

    let client = stream_socket();
    assert_eq!(client.getpeereid().unwrap_err(), Errno::ENOTCONN);

    let c = std::sync::Arc::clone(&client);
    let t = std::thread::spawn(move || {
        UnixSocket::connect(&c, &name).unwrap();
    });
    let child = server.accept().unwrap();
    t.join().unwrap();

    let cred = child.getpeereid().unwrap();
    assert_eq!(cred.pid, 0);
    assert_eq!(cred.uid, libc::uid_t::MAX);
    assert_eq!(cred.gid, libc::gid_t::MAX);

    // datagram sockets have no peer credentials
    let dgram = dgram_socket();
    assert_eq!(dgram.getpeereid().unwrap_err(), Errno::EINVAL);
}

#[test]
fn sockopt_surface() {
    let sock = stream_socket();

    // SO_TYPE
    let mut buf = [0u8; 4];
    sock.getsockopt(libc::SOL_SOCKET, libc::SO_TYPE, &mut buf)
        .unwrap();
    assert_eq!(i32::from_ne_bytes(buf), libc::SOCK_STREAM);

    // buffer sizes default and update
    sock.getsockopt(libc::SOL_SOCKET, libc::SO_RCVBUF, &mut buf)
        .unwrap();
    assert_eq!(i32::from_ne_bytes(buf), 262_144);
    sock.setsockopt(libc::SOL_SOCKET, libc::SO_SNDBUF, &4096i32.to_ne_bytes())
        .unwrap();
    sock.getsockopt(libc::SOL_SOCKET, libc::SO_SNDBUF, &mut buf)
        .unwrap();
    assert_eq!(i32::from_ne_bytes(buf), 4096);

    // SO_REUSEADDR is recorded but inert
    sock.setsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, &1i32.to_ne_bytes())
        .unwrap();
    sock.getsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, &mut buf)
        .unwrap();
    assert_eq!(i32::from_ne_bytes(buf), 1);

    // SO_LINGER is always zero
    let mut linger = [0xffu8; 8];
    sock.getsockopt(libc::SOL_SOCKET, libc::SO_LINGER, &mut linger)
        .unwrap();
    assert!(linger.iter().all(|&b| b == 0));

    // unknown SOL_SOCKET options read as zero
    let mut other = [0xffu8; 4];
    sock.getsockopt(libc::SOL_SOCKET, libc::SO_BROADCAST, &mut other)
        .unwrap();
    assert_eq!(i32::from_ne_bytes(other), 0);

    // other levels are refused
    assert_eq!(
        sock.setsockopt(libc::IPPROTO_TCP, libc::TCP_NODELAY, &1i32.to_ne_bytes())
            .unwrap_err(),
        Errno::ENOPROTOOPT
    );
}

#[test]
fn pathname_file_operations() {
    let name = upath("fileops");
    let sock = stream_socket();
    sock.bind(&name).unwrap();

    let st = sock.fstat().unwrap();
    assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFSOCK);
    assert_eq!(st.st_size, 0);

    // chmod keeps the read bit alongside any write bit
    sock.fchmod(0o200).unwrap();
    let st = sock.fstat().unwrap();
    assert_eq!(st.st_mode & 0o700, 0o600);

    sock.fchown(1000, 1000).unwrap();
    let st = sock.fstat().unwrap();
    assert_eq!(st.st_uid, 1000);
    assert_eq!(st.st_gid, 1000);

    let acl = sock.facl_get().unwrap();
    assert_eq!(acl.len(), 3);

    // a hard link provides a second route to the same socket
    let link_path = format!("/tmp/fileops-link-{}-{}", std::process::id(), unique_tag());
    sock.link(std::path::Path::new(&link_path)).unwrap();
    let st = sock.fstat().unwrap();
    assert_eq!(st.st_nlink, 2);

    // abstract sockets have no filesystem node to forward to
    let anon = stream_socket();
    assert_eq!(anon.facl_get().unwrap_err(), Errno::EINVAL);
}

#[test]
fn nonblocking_accept_reports_eagain() {
    let name = uabstract("nb-accept");
    let server = UnixSocket::socket(
        libc::AF_UNIX,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
        0,
    )
    .unwrap();
    server.bind(&name).unwrap();
    server.listen(5).unwrap();

    assert_eq!(server.accept().unwrap_err(), Errno::EAGAIN);
}

#[test]
fn close_is_idempotent_and_releases_the_name() {
    let name = uabstract("close");
    let sock = stream_socket();
    sock.bind(&name).unwrap();
    sock.close();
    sock.close();

    // the abstract name is released with the handle
    let again = stream_socket();
    again.bind(&name).unwrap();
}
