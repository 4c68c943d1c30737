//! Error types, one per recovery boundary.
//!
//! - [`TransportError`] ends a connection.
//! - [`ProtocolError`] ends a single request; the client gets a `SERVER_ERROR`
//!   line and the connection keeps serving.
//! - [`ServerError`] ends the acceptor and is reported to whoever started the
//!   server.

use crate::protocol::{ExecuteError, ParseError};
use std::io;
use thiserror::Error;

/// Socket-level failure on an accepted connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer closed the connection")]
    Closed,
    #[error("recv failed: {0}")]
    Recv(#[source] io::Error),
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
}

/// Malformed or unservable request.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("body of {size} bytes exceeds limit of {max}")]
    BodyTooLarge { size: usize, max: usize },
    #[error("Incorrect command format: body is not followed by \\r\\n")]
    BadDelimiter,
    #[error(transparent)]
    Execute(#[from] ExecuteError),
}

/// Anything that can interrupt one request cycle.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<ParseError> for RequestError {
    fn from(e: ParseError) -> Self {
        RequestError::Protocol(e.into())
    }
}

impl From<ExecuteError> for RequestError {
    fn from(e: ExecuteError) -> Self {
        RequestError::Protocol(e.into())
    }
}

/// Failure of the server as a whole.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{context}: {source}")]
    Setup {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("accept() failed: {0}")]
    Accept(#[source] io::Error),
    #[error("worker pool refused connection task")]
    Submit,
    #[error("unable to mask signals: {0}")]
    SignalMask(#[source] io::Error),
    #[error("server is already running")]
    AlreadyStarted,
}

impl ServerError {
    pub(crate) fn setup(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| ServerError::Setup { context, source }
    }
}
