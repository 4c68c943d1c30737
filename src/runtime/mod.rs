//! Blocking thread-per-connection runtime.
//!
//! [`Server::start`] binds the listener and hands the accept loop to an
//! [`Executor`]; every accepted socket then gets its own worker thread running
//! a [`Connection`](connection::Connection) until the peer leaves or the
//! server stops.
//!
//! Cross-thread state lives in [`Shared`]. The `running` flag is written with
//! `Release` by `start`/`stop` and read with `Acquire` at every loop head, and
//! the listener is published before the acceptor task is submitted. `stop`
//! shuts sockets down rather than relying on the flag alone, because a thread
//! parked in `accept` or `recv` never gets to poll it.

mod acceptor;
mod buffer;
mod connection;
mod io;

use crate::config::Limits;
use crate::error::ServerError;
use crate::executor::Executor;
use crate::signals;
use crate::storage::Storage;
use connection::ConnectionRegistry;
use socket2::Socket;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long `stop` waits on a wake-up connection to its own listener.
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// State read by the acceptor and every connection thread.
pub(crate) struct Shared {
    running: AtomicBool,
    listener: Mutex<Option<Arc<Socket>>>,
    registry: Arc<ConnectionRegistry>,
    storage: Arc<Storage>,
    limits: Limits,
    local_addr: SocketAddr,
}

impl Shared {
    fn listener(&self) -> MutexGuard<'_, Option<Arc<Socket>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the server's handle on the listener once the acceptor is done.
    fn release_listener(&self) {
        if self.listener().take().is_some() {
            debug!(addr = %self.local_addr, "Listener closed");
        }
    }

    /// Force a blocked `accept` to return.
    fn interrupt_listener(&self) {
        let Some(listener) = self.listener().clone() else {
            return;
        };

        // Linux fails the pending accept with EINVAL. Elsewhere shutdown on a
        // listening socket may be refused, so connect to it instead.
        if let Err(e) = listener.shutdown(Shutdown::Both) {
            debug!(error = %e, "Listener shutdown refused, waking acceptor");
            let target = wake_addr(self.local_addr);
            if let Err(e) = TcpStream::connect_timeout(&target, WAKE_TIMEOUT) {
                warn!(addr = %target, error = %e, "Unable to wake acceptor");
            }
        }
    }
}

/// Loopback equivalent of a wildcard listen address.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}

struct Active {
    shared: Arc<Shared>,
    executor: Arc<Executor>,
}

/// Cache server lifecycle: `start`, then `stop` and `join`.
///
/// A `Server` runs at most once.
pub struct Server {
    storage: Arc<Storage>,
    limits: Limits,
    active: Option<Active>,
}

impl Server {
    pub fn new(storage: Arc<Storage>, limits: Limits) -> Self {
        Self {
            storage,
            limits,
            active: None,
        }
    }

    /// Bind `addr` and start accepting, with at most `max_workers`
    /// connections served concurrently.
    ///
    /// Returns the bound address, which differs from `addr` when port 0 was
    /// requested. Failing to create, configure, bind or listen on the socket
    /// is reported here.
    pub fn start(&mut self, addr: SocketAddr, max_workers: usize) -> Result<SocketAddr, ServerError> {
        if self.active.is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        // A send to a reset peer must come back as EPIPE, not kill the process.
        signals::block(&[libc::SIGPIPE]).map_err(ServerError::SignalMask)?;

        let listener = acceptor::bind(addr, self.limits.backlog)?;
        let local_addr = listener
            .local_addr()
            .map_err(ServerError::setup("getsockname"))?
            .as_socket()
            .unwrap_or(addr);
        let listener = Arc::new(listener);

        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            listener: Mutex::new(Some(Arc::clone(&listener))),
            registry: Arc::new(ConnectionRegistry::new()),
            storage: Arc::clone(&self.storage),
            limits: self.limits,
            local_addr,
        });
        // One extra slot for the acceptor itself.
        let executor = Arc::new(Executor::new("worker", max_workers + 1));

        shared.running.store(true, Ordering::Release);

        let task_shared = Arc::clone(&shared);
        let task_executor = Arc::clone(&executor);
        let submitted = executor.execute(move || {
            if let Err(e) = acceptor::run(&task_shared, &listener, &task_executor) {
                error!(error = %e, "Acceptor failed");
            }
        });
        if !submitted {
            shared.running.store(false, Ordering::Release);
            shared.release_listener();
            return Err(ServerError::Submit);
        }

        info!(
            addr = %local_addr,
            max_workers,
            buffer_size = self.limits.buffer_size,
            max_body_size = self.limits.max_body_size,
            "Server started"
        );
        self.active = Some(Active { shared, executor });
        Ok(local_addr)
    }

    /// Stop accepting and wake every thread blocked on a socket.
    ///
    /// Requests already being executed finish; `join` waits for them.
    pub fn stop(&self) {
        let Some(active) = &self.active else {
            return;
        };
        let shared = &active.shared;
        if !shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(addr = %shared.local_addr, "Stopping server");

        shared.interrupt_listener();
        let woken = shared.registry.shutdown_all();
        debug!(
            connections = woken,
            workers = active.executor.live(),
            "Shut down live connections"
        );
        active.executor.stop(false);
    }

    /// Block until the acceptor and every connection thread have exited.
    pub fn join(&self) {
        if let Some(active) = &self.active {
            active.executor.join();
            info!("Server stopped");
        }
    }

    /// Address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|active| active.shared.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    const DEADLINE: Duration = Duration::from_secs(5);

    fn start_server(limits: Limits, max_workers: usize) -> (Server, SocketAddr) {
        let mut server = Server::new(Storage::new(1024 * 1024), limits);
        let addr = server
            .start("127.0.0.1:0".parse().unwrap(), max_workers)
            .unwrap();
        (server, addr)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(DEADLINE)).unwrap();
        client
    }

    fn expect(client: &mut TcpStream, expected: &[u8]) {
        let mut got = vec![0u8; expected.len()];
        client.read_exact(&mut got).unwrap();
        assert_eq!(
            String::from_utf8_lossy(&got),
            String::from_utf8_lossy(expected)
        );
    }

    fn read_line(client: &TcpStream) -> String {
        let mut line = String::new();
        BufReader::new(client).read_line(&mut line).unwrap();
        line
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < DEADLINE, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn shared(server: &Server) -> &Arc<Shared> {
        &server.active.as_ref().unwrap().shared
    }

    /// Run stop and join on another thread and require both to finish.
    fn stop_within_deadline(server: Server) {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            server.stop();
            server.join();
            let _ = tx.send(server);
        });
        let server = rx
            .recv_timeout(DEADLINE)
            .expect("stop and join did not complete");
        assert!(shared(&server).listener().is_none());
    }

    #[test]
    fn test_no_body_command() {
        let (server, addr) = start_server(Limits::default(), 4);
        let mut client = connect(addr);

        client.write_all(b"version\r\n").unwrap();
        let line = read_line(&client);
        assert!(line.starts_with("VERSION blocking-cache "), "{line}");
        assert!(line.ends_with("\r\n"));

        stop_within_deadline(server);
    }

    #[test]
    fn test_body_in_three_writes() {
        let (server, addr) = start_server(Limits::default(), 4);
        let mut client = connect(addr);

        client.write_all(b"set greeting 0 0 5\r\n").unwrap();
        thread::sleep(Duration::from_millis(20));
        client.write_all(b"hello").unwrap();
        thread::sleep(Duration::from_millis(20));
        client.write_all(b"\r\n").unwrap();
        expect(&mut client, b"STORED\r\n");

        client.write_all(b"get greeting\r\n").unwrap();
        expect(&mut client, b"VALUE greeting 0 5\r\nhello\r\nEND\r\n");

        stop_within_deadline(server);
    }

    #[test]
    fn test_oversized_body_keeps_connection() {
        let limits = Limits {
            max_body_size: 16,
            ..Limits::default()
        };
        let (server, addr) = start_server(limits, 4);
        let mut client = connect(addr);

        client.write_all(b"set big 0 0 64\r\n").unwrap();
        expect(&mut client, b"SERVER_ERROR body of 64 bytes exceeds limit of 16\r\n");

        client.write_all(b"set small 0 0 2\r\nok\r\n").unwrap();
        expect(&mut client, b"STORED\r\n");

        stop_within_deadline(server);
    }

    #[test]
    fn test_abrupt_close_mid_header_releases_connection() {
        let (server, addr) = start_server(Limits::default(), 4);

        let mut client = connect(addr);
        client.write_all(b"get ke").unwrap();
        wait_until("connection to register", || {
            !shared(&server).registry.is_empty()
        });
        drop(client);
        wait_until("connection to be released", || {
            shared(&server).registry.is_empty()
        });

        let mut other = connect(addr);
        other.write_all(b"get ke\r\n").unwrap();
        expect(&mut other, b"END\r\n");

        stop_within_deadline(server);
    }

    #[test]
    fn test_stop_unblocks_accept() {
        let (server, addr) = start_server(Limits::default(), 4);
        stop_within_deadline(server);
        assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_err());
    }

    #[test]
    fn test_stop_releases_idle_connection() {
        let (server, addr) = start_server(Limits::default(), 4);
        let mut client = connect(addr);
        client.write_all(b"version\r\n").unwrap();
        read_line(&client);

        stop_within_deadline(server);

        let mut rest = [0u8; 1];
        assert!(matches!(client.read(&mut rest), Ok(0) | Err(_)));
    }

    #[test]
    fn test_submission_fault_stops_acceptor() {
        let (server, addr) = start_server(Limits::default(), 1);

        let mut first = connect(addr);
        first.write_all(b"version\r\n").unwrap();
        read_line(&first);

        let mut second = connect(addr);
        let mut rest = [0u8; 1];
        assert!(matches!(second.read(&mut rest), Ok(0) | Err(_)));
        wait_until("listener to close", || shared(&server).listener().is_none());

        stop_within_deadline(server);
    }

    #[test]
    fn test_start_twice_and_port_in_use() {
        let (mut server, addr) = start_server(Limits::default(), 1);
        assert!(matches!(
            server.start(addr, 1),
            Err(ServerError::AlreadyStarted)
        ));

        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut other = Server::new(Storage::new(1024), Limits::default());
        assert!(matches!(
            other.start(holder.local_addr().unwrap(), 1),
            Err(ServerError::Setup { context: "bind", .. })
        ));
        assert!(other.local_addr().is_none());

        stop_within_deadline(server);
    }

    #[test]
    fn test_wake_addr_maps_wildcards_to_loopback() {
        assert_eq!(
            wake_addr("0.0.0.0:8080".parse().unwrap()),
            "127.0.0.1:8080".parse().unwrap()
        );
        assert_eq!(
            wake_addr("[::]:8080".parse().unwrap()),
            "[::1]:8080".parse().unwrap()
        );
        assert_eq!(
            wake_addr("10.1.2.3:11211".parse().unwrap()),
            "10.1.2.3:11211".parse().unwrap()
        );
    }
}
