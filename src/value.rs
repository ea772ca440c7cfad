use std::str;

use bytes::Bytes;
use strum_macros::Display;

use crate::frame::Frame;
use crate::Error;

/// The shape a caller wants a reply converted into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Destination {
    String,
    Integer,
    Boolean,
    Strings,
    /// Hands the decoded frame back untouched, e.g. for `EXEC` results mixing types.
    Frame,
}

/// A reply bound to a [`Destination`].
///
/// Nil bulk strings and nil arrays bind to [`Value::Nil`] for every destination but
/// [`Destination::Frame`], so a missing key can always be told apart from an empty string.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    String(String),
    Integer(i64),
    Boolean(bool),
    /// Elements of a sequence keep their own nil marker, as in `MGET` with missing keys.
    Strings(Vec<Option<String>>),
    Frame(Frame),
}

/// Applies the coercion rules of `destination` to `frame`.
///
/// An error reply short-circuits into [`Error::Server`] whatever the destination.
pub fn bind(frame: Frame, destination: Destination) -> Result<Value, Error> {
    if let Frame::Error(message) = frame {
        return Err(Error::Server(text(message)));
    }

    match destination {
        Destination::Frame => Ok(Value::Frame(frame)),
        Destination::String => {
            let string = bind_string(frame)?;
            Ok(string.map_or(Value::Nil, Value::String))
        }
        Destination::Integer => match frame {
            Frame::Integer(i) => Ok(Value::Integer(i)),
            Frame::Simple(ref s) => match str::from_utf8(s).ok().and_then(|s| s.parse().ok()) {
                Some(i) => Ok(Value::Integer(i)),
                None => Err(mismatch(destination, &frame)),
            },
            frame if frame.is_nil() => Ok(Value::Nil),
            frame => Err(mismatch(destination, &frame)),
        },
        Destination::Boolean => match frame {
            Frame::Integer(0) => Ok(Value::Boolean(false)),
            Frame::Integer(1) => Ok(Value::Boolean(true)),
            frame if frame.is_nil() => Ok(Value::Nil),
            frame => Err(mismatch(destination, &frame)),
        },
        Destination::Strings => match frame {
            Frame::Array(Some(items)) => items
                .into_iter()
                .map(bind_string)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Strings),
            frame if frame.is_nil() => Ok(Value::Nil),
            frame => Err(mismatch(destination, &frame)),
        },
    }
}

// Nested error frames (e.g. inside an `EXEC` reply) bind to their message text.
fn bind_string(frame: Frame) -> Result<Option<String>, Error> {
    match frame {
        Frame::Simple(s) | Frame::Error(s) => Ok(Some(text(s))),
        Frame::Integer(i) => Ok(Some(i.to_string())),
        Frame::Bulk(Some(bytes)) => match String::from_utf8(bytes.to_vec()) {
            Ok(string) => Ok(Some(string)),
            Err(_) => Err(Error::Binding {
                expected: Destination::String,
                actual: "non UTF-8 bulk string",
            }),
        },
        Frame::Bulk(None) | Frame::Array(None) => Ok(None),
        frame => Err(mismatch(Destination::String, &frame)),
    }
}

fn text(bytes: Bytes) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

fn mismatch(expected: Destination, frame: &Frame) -> Error {
    Error::Binding {
        expected,
        actual: frame.kind(),
    }
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::String(_) => "string",
            Value::Integer(_) => "integer",
            Value::Boolean(_) => "boolean",
            Value::Strings(_) => "strings",
            Value::Frame(frame) => frame.kind(),
        }
    }

    fn wrong(&self, expected: Destination) -> Error {
        Error::Binding {
            expected,
            actual: self.kind(),
        }
    }

    pub fn into_string(self) -> Result<Option<String>, Error> {
        match self {
            Value::Nil => Ok(None),
            Value::String(s) => Ok(Some(s)),
            value => Err(value.wrong(Destination::String)),
        }
    }

    pub fn into_integer(self) -> Result<Option<i64>, Error> {
        match self {
            Value::Nil => Ok(None),
            Value::Integer(i) => Ok(Some(i)),
            value => Err(value.wrong(Destination::Integer)),
        }
    }

    pub fn into_bool(self) -> Result<Option<bool>, Error> {
        match self {
            Value::Nil => Ok(None),
            Value::Boolean(b) => Ok(Some(b)),
            value => Err(value.wrong(Destination::Boolean)),
        }
    }

    pub fn into_strings(self) -> Result<Option<Vec<Option<String>>>, Error> {
        match self {
            Value::Nil => Ok(None),
            Value::Strings(strings) => Ok(Some(strings)),
            value => Err(value.wrong(Destination::Strings)),
        }
    }

    pub fn into_frame(self) -> Result<Frame, Error> {
        match self {
            Value::Frame(frame) => Ok(frame),
            value => Err(value.wrong(Destination::Frame)),
        }
    }
}
