//! Listening socket and the accept loop.

use crate::error::ServerError;
use crate::executor::Executor;
use crate::runtime::connection::Connection;
use crate::runtime::Shared;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// Create a blocking listener on `addr` with address and port reuse.
pub(super) fn bind(addr: SocketAddr, backlog: i32) -> Result<Socket, ServerError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(ServerError::setup("socket"))?;

    socket
        .set_reuse_address(true)
        .map_err(ServerError::setup("SO_REUSEADDR"))?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket
        .set_reuse_port(true)
        .map_err(ServerError::setup("SO_REUSEPORT"))?;

    socket
        .bind(&addr.into())
        .map_err(ServerError::setup("bind"))?;
    socket
        .listen(backlog)
        .map_err(ServerError::setup("listen"))?;
    Ok(socket)
}

/// Accept connections until the server stops, handing each to `executor`.
///
/// Returns `Ok` when the loop ends because of [`Server::stop`]; the listener
/// is released either way.
///
/// [`Server::stop`]: crate::runtime::Server::stop
pub(super) fn run(shared: &Arc<Shared>, listener: &Socket, executor: &Arc<Executor>) -> Result<(), ServerError> {
    let result = accept_loop(shared, listener, executor);
    shared.release_listener();
    result
}

fn accept_loop(shared: &Arc<Shared>, listener: &Socket, executor: &Arc<Executor>) -> Result<(), ServerError> {
    info!(addr = %shared.local_addr, "Accepting connections");

    while shared.running.load(Ordering::Acquire) {
        let stream: TcpStream = match listener.accept() {
            Ok((socket, _)) => socket.into(),
            // A listener shut down from `stop` fails with EINVAL.
            Err(e) if e.kind() == ErrorKind::InvalidInput => break,
            Err(e) if !shared.running.load(Ordering::Acquire) => {
                debug!(error = %e, "accept() failed during shutdown");
                break;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::Interrupted | ErrorKind::ConnectionAborted
                ) =>
            {
                continue
            }
            Err(e) => return Err(ServerError::Accept(e)),
        };

        if !shared.running.load(Ordering::Acquire) {
            // Wake-up connection from `stop`, or a client that lost the race.
            break;
        }

        let peer = stream.peer_addr().ok();
        debug!(peer = ?peer, "Accepted connection");

        let registration = match stream.try_clone() {
            Ok(handle) => shared.registry.register(handle),
            Err(e) => {
                debug!(peer = ?peer, error = %e, "Unable to track connection, dropping it");
                continue;
            }
        };

        let task_shared = Arc::clone(shared);
        let submitted = executor.execute(move || {
            let _registration = registration;
            // Registration and the stop sweep synchronize on the registry
            // lock, so a connection missed by the sweep sees the cleared flag.
            if !task_shared.running.load(Ordering::Acquire) {
                return;
            }
            let storage = Arc::clone(&task_shared.storage);
            Connection::new(stream, storage, &task_shared.limits).run(&task_shared.running);
            debug!(peer = ?peer, "Connection released");
        });

        if !submitted {
            // The closure, and with it the stream, was dropped by the pool.
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            return Err(ServerError::Submit);
        }
    }

    info!("Acceptor stopped");
    Ok(())
}
