//! Per-connection request cycle.
//!
//! Each request walks the same states:
//!
//! ```text
//! AwaitHeader -> HaveHeader -> [AwaitBody -> AwaitDelimiter] -> Execute -> Respond
//! ```
//!
//! and the connection loops back to `AwaitHeader` until the peer leaves, a
//! socket call fails, or the server stops. Protocol faults are answered with a
//! `SERVER_ERROR` line and the buffer is cleared; transport faults end the
//! connection.

use crate::config::Limits;
use crate::error::{ProtocolError, RequestError, TransportError};
use crate::protocol::{Parser, Response, DELIMITER};
use crate::runtime::buffer::RecvBuffer;
use crate::runtime::io::{self, Transport};
use crate::storage::Storage;
use slab::Slab;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// State owned by the thread serving one connection.
pub struct Connection<T: Transport> {
    stream: T,
    buffer: RecvBuffer,
    body: Box<[u8]>,
    parser: Parser,
    storage: Arc<Storage>,
}

impl<T: Transport> Connection<T> {
    pub fn new(stream: T, storage: Arc<Storage>, limits: &Limits) -> Self {
        Self {
            stream,
            buffer: RecvBuffer::new(limits.buffer_size.max(DELIMITER.len())),
            body: vec![0u8; limits.max_body_size].into_boxed_slice(),
            parser: Parser::new(),
            storage,
        }
    }

    /// Serve requests until the peer goes away, I/O fails, or `running`
    /// is cleared. The stream is closed on return.
    pub fn run(mut self, running: &AtomicBool) {
        while running.load(Ordering::Acquire) {
            match self.step() {
                Ok(()) => {}
                Err(TransportError::Closed) => {
                    debug!("Connection closed by peer");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Connection failed");
                    return;
                }
            }
        }
        debug!("Server stopping, closing connection");
    }

    /// Serve one request, answering protocol faults in-band.
    fn step(&mut self) -> Result<(), TransportError> {
        match self.serve_request() {
            Ok(()) => Ok(()),
            Err(RequestError::Transport(e)) => Err(e),
            Err(RequestError::Protocol(e)) => {
                warn!(error = %e, "SERVER_ERROR");
                self.buffer.reset();
                self.parser.reset();
                io::write_exact(&mut self.stream, &Response::server_error(&e.to_string()))
            }
        }
    }

    /// Run one full request cycle.
    fn serve_request(&mut self) -> Result<(), RequestError> {
        self.await_header()?;

        let (command, body_size) = self.parser.build()?;
        let max = self.body.len();
        if body_size > max {
            return Err(ProtocolError::BodyTooLarge {
                size: body_size,
                max,
            }
            .into());
        }
        trace!(?command, body_size, "Parsed header");

        if body_size > 0 {
            self.await_body(body_size)?;
            self.await_delimiter()?;
        } else {
            self.buffer.compact();
        }

        let response = command.execute(&self.storage, &self.body[..body_size])?;
        io::write_exact(&mut self.stream, &response)?;
        Ok(())
    }

    /// Feed the parser until it holds a complete header line.
    fn await_header(&mut self) -> Result<(), RequestError> {
        loop {
            let parse = self.parser.parse(self.buffer.unconsumed())?;
            self.buffer.consume(parse.consumed);
            if parse.complete {
                return Ok(());
            }

            // The parser has taken every buffered byte, so a full buffer can
            // be recycled without losing header data.
            if self.buffer.is_full() {
                self.buffer.reset();
            }
            let n = io::read_some(&mut self.stream, self.buffer.spare_mut())?;
            self.buffer.commit(n);
        }
    }

    /// Assemble `body_size` bytes in the body buffer, buffered bytes first.
    fn await_body(&mut self, body_size: usize) -> Result<(), TransportError> {
        let body = &mut self.body[..body_size];
        let buffered = self.buffer.drain_into(body);
        io::read_exact(&mut self.stream, &mut body[buffered..])
    }

    /// Check that the body is followed by `\r\n`.
    fn await_delimiter(&mut self) -> Result<(), RequestError> {
        let have = self.buffer.unconsumed().len();
        if have < DELIMITER.len() {
            let missing = DELIMITER.len() - have;
            io::read_exact(&mut self.stream, &mut self.buffer.spare_mut()[..missing])?;
            self.buffer.commit(missing);
        }

        if self.buffer.unconsumed()[..DELIMITER.len()] != DELIMITER[..] {
            return Err(ProtocolError::BadDelimiter.into());
        }
        self.buffer.consume(DELIMITER.len());
        self.buffer.compact();
        Ok(())
    }
}

/// Shutdown handles for every live connection, so a stopping server can
/// wake threads parked in `recv`.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<Slab<TcpStream>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slab<TcpStream>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `handle` until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, handle: TcpStream) -> Registration {
        let id = self.lock().insert(handle);
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Shut down the read half of every registered connection.
    ///
    /// Threads blocked in `recv` see end-of-stream; a response already being
    /// written still goes out.
    pub fn shutdown_all(&self) -> usize {
        let connections = self.lock();
        for (id, stream) in connections.iter() {
            if let Err(e) = stream.shutdown(Shutdown::Read) {
                trace!(conn_id = id, error = %e, "Shutdown of connection failed");
            }
        }
        connections.len()
    }

    /// Number of connections currently registered.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a connection registered while alive.
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: usize,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.lock().remove(self.id);
    }
}
