use std::io;
use std::time::Duration;

use thiserror::Error as ThisError;

use crate::frame;
use crate::value::Destination;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Malformed data on the wire. The connection cannot be trusted afterwards.
    #[error("protocol error; {0}")]
    Protocol(String),
    #[error("protocol error; buffered frame exceeds the limit of {0} bytes")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    ConnectionClosed,

    /// The server answered the command with a `-` reply.
    #[error("{0}")]
    Server(String),
    #[error("cannot bind {actual} reply to a {expected} destination")]
    Binding {
        expected: Destination,
        actual: &'static str,
    },

    #[error("not connected")]
    NotConnected,
    #[error("command not allowed while the connection is in subscription mode")]
    Subscribed,
    #[error("connection is not in subscription mode")]
    NotSubscribed,
    #[error("{0:?} cannot be issued through this operation")]
    WrongCommand(String),
}

impl Error {
    /// Returns `true` when the error poisoned the whole connection, as opposed to failing a single
    /// command.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::FrameTooLarge(_)
                | Error::Io(_)
                | Error::Timeout(_)
                | Error::ConnectionClosed
        )
    }

    /// Misuse of the connection detected before any I/O took place.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Error::NotConnected | Error::Subscribed | Error::NotSubscribed | Error::WrongCommand(_)
        )
    }
}

impl From<frame::Error> for Error {
    fn from(err: frame::Error) -> Error {
        Error::Protocol(err.to_string())
    }
}
