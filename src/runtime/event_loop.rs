//! mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls straight into each connection's
//! circular buffers. Uses epoll on Linux, kqueue on macOS.
//!
//! Each worker owns its listener (SO_REUSEPORT), connections, buffer pools
//! and login timers, so a connection is only ever touched by one thread. The
//! only state shared between workers is the [`Shard`].

use crate::config::Config;
use crate::error::NetError;
use crate::protocol::{LoginPoll, Session, Shard};
use crate::runtime::buffer::BufferPool;
use crate::runtime::connection::{ConnState, Connection, ConnectionId, ConnectionRegistry};
use crate::runtime::timer::{Scheduler, TimerId};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

/// Run the login server until every worker exits.
pub fn run(config: Config, shard: Arc<Shard>) -> io::Result<()> {
    let num_workers = config.workers.filter(|&n| n > 0).unwrap_or_else(num_cpus);
    let addr = config.listen;

    info!(
        workers = num_workers,
        addr = %addr,
        max_connections = config.max_connections,
        "starting login workers"
    );

    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let config = config.clone();
        let shard = Arc::clone(&shard);

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                let result =
                    Worker::new(worker_id, addr, &config, shard).and_then(|mut worker| worker.run());
                if let Err(e) = result {
                    error!(worker = worker_id, error = %e, "worker failed");
                }
            })?;

        handles.push(handle);
    }

    // Wait for all workers
    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

/// Per-thread event loop state.
struct Worker {
    id: usize,
    poll: Poll,
    listener: TcpListener,
    connections: ConnectionRegistry<Connection>,
    recv_pool: BufferPool,
    send_pool: BufferPool,
    /// Login timers, keyed back to their connection.
    timers: Scheduler<ConnectionId>,
    shard: Arc<Shard>,
    version_poll: Duration,
}

impl Worker {
    fn new(id: usize, addr: SocketAddr, config: &Config, shard: Arc<Shard>) -> io::Result<Self> {
        let poll = Poll::new()?;

        // Create listener with SO_REUSEPORT for kernel load balancing
        let listener = create_listener_with_reuseport(addr)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let max_connections = config.max_connections;

        info!(
            worker = id,
            max_connections,
            receive_size = config.receive_size,
            send_size = config.send_size,
            "worker listening"
        );

        Ok(Self {
            id,
            poll,
            listener,
            connections: ConnectionRegistry::new(max_connections),
            recv_pool: BufferPool::new(max_connections, config.receive_size),
            send_pool: BufferPool::new(max_connections, config.send_size),
            timers: Scheduler::new(),
            version_poll: shard.settings().version_poll,
            shard,
        })
    }

    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            let timeout = self.timers.timeout(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(key) => {
                        let Some(id) = self.connections.id_for_key(key) else {
                            continue;
                        };
                        let readable = event.is_readable() || event.is_read_closed();
                        self.service(id, readable);
                    }
                }
            }

            self.run_timers();
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.len() >= self.connections.capacity() {
                        warn!(worker = self.id, peer = %peer, "connection limit reached, rejecting connection");
                        continue;
                    }

                    let Some(recv) = self.recv_pool.alloc() else {
                        warn!(worker = self.id, peer = %peer, "buffer pool exhausted, rejecting connection");
                        continue;
                    };
                    let Some(send) = self.send_pool.alloc() else {
                        warn!(worker = self.id, peer = %peer, "buffer pool exhausted, rejecting connection");
                        self.recv_pool.free(recv);
                        continue;
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                    }

                    let shard = Arc::clone(&self.shard);
                    let Some(id) = self.connections.insert_with(|id| Connection {
                        stream,
                        peer,
                        state: ConnState::Open,
                        writable: false,
                        recv,
                        session: Session::new(id, shard, send),
                    }) else {
                        continue;
                    };

                    let Some(conn) = self.connections.get_mut(id) else {
                        continue;
                    };
                    let registered = self.poll.registry().register(
                        &mut conn.stream,
                        Token(id.key()),
                        Interest::READABLE,
                    );
                    if let Err(e) = registered {
                        warn!(conn_id = %id, error = %e, "failed to register connection");
                        self.close_connection(id);
                        continue;
                    }

                    debug!(worker = self.id, conn_id = %id, peer = %peer, "accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(worker = self.id, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Read and dispatch (when `readable`), flush, and close the connection
    /// if it failed or finished draining.
    fn service(&mut self, id: ConnectionId, readable: bool) {
        match self.drive(id, readable) {
            Ok(true) => {}
            Ok(false) => self.close_connection(id),
            Err(e) => {
                if let Some(conn) = self.connections.get(id) {
                    report(id, conn.peer, &e);
                }
                self.close_connection(id);
            }
        }
    }

    /// Returns false once a disposed connection has flushed everything.
    fn drive(&mut self, id: ConnectionId, readable: bool) -> Result<bool, NetError> {
        let Some(conn) = self.connections.get_mut(id) else {
            return Ok(true);
        };

        if readable && conn.state == ConnState::Open {
            read_available(conn)?;
        }

        if conn.session.login_timer_requested() {
            let timer = self
                .timers
                .schedule_every(Instant::now(), self.version_poll, id);
            conn.session.arm_login_timer(timer);
        }

        if conn.session.is_disposed() {
            conn.state = ConnState::Draining;
        }

        flush(conn)?;

        let pending = !conn.session.outbox().buffer().is_empty();
        if conn.state == ConnState::Draining && !pending {
            return Ok(false);
        }

        if pending != conn.writable {
            let interest = if pending {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            self.poll
                .registry()
                .reregister(&mut conn.stream, Token(id.key()), interest)?;
            conn.writable = pending;
        }

        Ok(true)
    }

    /// Tick every due login timer.
    fn run_timers(&mut self) {
        for (timer, id) in self.timers.poll_due(Instant::now()) {
            let Some(conn) = self.connections.get_mut(id) else {
                // Connection closed without cancelling; stop quietly
                self.timers.cancel(timer);
                continue;
            };

            match conn.session.poll_login() {
                Ok(LoginPoll::Pending) => {}
                Ok(LoginPoll::Entered) => {
                    self.timers.cancel(timer);
                    // Frames held back during version negotiation are
                    // dispatched now, along with anything still unread.
                    self.service(id, true);
                }
                Ok(LoginPoll::Abandoned) => {
                    self.timers.cancel(timer);
                }
                Err(e) => {
                    self.timers.cancel(timer);
                    report(id, conn.peer, &e);
                    self.close_connection(id);
                }
            }
        }
    }

    fn close_connection(&mut self, id: ConnectionId) {
        let Some(mut conn) = self.connections.remove(id) else {
            return;
        };

        if let Some(timer) = conn.session.close() {
            cancel_timer(&mut self.timers, timer);
        }
        let _ = self.poll.registry().deregister(&mut conn.stream);

        self.recv_pool.free(conn.recv);
        self.send_pool.free(conn.session.into_outbox().into_buffer());

        debug!(worker = self.id, conn_id = %id, peer = %conn.peer, "connection closed");
    }
}

fn cancel_timer(timers: &mut Scheduler<ConnectionId>, timer: TimerId) {
    if timers.cancel(timer).is_none() {
        debug!(?timer, "login timer already stopped");
    }
}

/// Drain the socket into the receive buffer, dispatching as it fills.
///
/// Stops early when a full buffer cannot be drained because incoming
/// frames are held back; the rest is read once they are released.
fn read_available(conn: &mut Connection) -> Result<(), NetError> {
    loop {
        if conn.recv.is_full() {
            conn.session.pump(&mut conn.recv)?;
            if conn.recv.is_full() || conn.session.is_disposed() {
                return Ok(());
            }
        }

        let (first, second) = conn.recv.free_segments_mut();
        let mut bufs = [IoSliceMut::new(first), IoSliceMut::new(second)];
        match conn.stream.read_vectored(&mut bufs) {
            Ok(0) => {
                // EOF
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "EOF").into());
            }
            Ok(n) => conn.recv.commit(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    conn.session.pump(&mut conn.recv)
}

/// Write as much of the send buffer as the socket takes.
fn flush(conn: &mut Connection) -> io::Result<()> {
    loop {
        let send = conn.session.outbox_mut().buffer_mut();
        if send.is_empty() {
            return Ok(());
        }

        let (first, second) = send.segments();
        let bufs = [IoSlice::new(first), IoSlice::new(second)];
        match conn.stream.write_vectored(&bufs) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => send.consume(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn report(id: ConnectionId, peer: SocketAddr, err: &NetError) {
    match err {
        NetError::Handshake(fault) => {
            warn!(conn_id = %id, peer = %peer, %fault, "invalid client detected, disconnecting");
        }
        NetError::Io(e) if e.kind() == io::ErrorKind::ConnectionReset => {
            debug!(conn_id = %id, peer = %peer, "peer closed connection");
        }
        _ => debug!(conn_id = %id, peer = %peer, error = %err, "connection error"),
    }
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{self as frames, shard};
    use std::net::TcpStream;

    fn worker() -> Worker {
        let config = Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            workers: Some(1),
            max_connections: 4,
            receive_size: 4096,
            send_size: 4096,
            auth_window: 128,
            version_poll: Duration::from_millis(10),
            features: 0,
            character_flags: 0,
            servers: Vec::new(),
            log_level: "info".to_string(),
        };
        Worker::new(0, config.listen, &config, shard()).unwrap()
    }

    /// Poll until `done` holds or the deadline passes.
    fn turn_until(worker: &mut Worker, mut done: impl FnMut(&Worker) -> bool) {
        let mut events = Events::with_capacity(16);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(&*worker) && Instant::now() < deadline {
            worker
                .poll
                .poll(&mut events, Some(Duration::from_millis(10)))
                .unwrap();
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => worker.accept_connections(),
                    Token(key) => {
                        if let Some(id) = worker.connections.id_for_key(key) {
                            worker.service(id, event.is_readable() || event.is_read_closed());
                        }
                    }
                }
            }
            worker.run_timers();
        }
        assert!(done(&*worker), "condition not reached");
    }

    #[test]
    fn test_accept_and_login() {
        let mut worker = worker();
        let addr = worker.listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        turn_until(&mut worker, |w| w.connections.len() == 1);
        assert_eq!(worker.recv_pool.available(), 3);

        client
            .write_all(&frames::seed_packet(0x0A0B_0C0D, (7, 0, 15, 1)))
            .unwrap();
        client
            .write_all(&frames::account_login("avatar", "secret"))
            .unwrap();

        let mut reply = [0u8; 3];
        client
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let mut got = 0;
        turn_until(&mut worker, |_| {
            if let Ok(n) = client.read(&mut reply[got..]) {
                got += n;
            }
            got == reply.len()
        });
        // Server list with one shard
        assert_eq!(reply, [0xA8, 0x00, 46]);
    }

    #[test]
    fn test_handshake_fault_closes_connection() {
        let mut worker = worker();
        let addr = worker.listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        turn_until(&mut worker, |w| w.connections.len() == 1);

        client.write_all(&[0, 0, 0, 0]).unwrap();
        turn_until(&mut worker, |w| w.connections.is_empty());

        assert_eq!(worker.recv_pool.available(), 4);
        assert_eq!(worker.send_pool.available(), 4);
    }

    #[test]
    fn test_closed_connection_stops_login_timer() {
        let mut worker = worker();
        let addr = worker.listener.local_addr().unwrap();
        let token = worker.shard.auth().issue(None);

        let mut client = TcpStream::connect(addr).unwrap();
        turn_until(&mut worker, |w| w.connections.len() == 1);

        client.write_all(&token.to_be_bytes()).unwrap();
        client
            .write_all(&frames::game_login(token, "avatar", "secret"))
            .unwrap();
        client
            .write_all(&frames::create_character("Iolo", true))
            .unwrap();
        turn_until(&mut worker, |w| w.timers.len() == 1);

        drop(client);
        turn_until(&mut worker, |w| w.connections.is_empty());
        assert!(worker.timers.is_empty());
    }
}
