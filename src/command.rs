use std::fmt;

use bytes::Bytes;

use crate::frame::Frame;
use crate::Error;

/// An ordered, non-empty list of arguments. The first one is the verb.
///
/// ```
/// use resplex::Command;
///
/// let cmd = Command::new("SET").arg("key").arg(42);
/// assert_eq!(cmd.len(), 3);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(verb: impl ToArg) -> Command {
        Command {
            args: vec![verb.to_arg()],
        }
    }

    pub fn arg(mut self, arg: impl ToArg) -> Command {
        self.args.push(arg.to_arg());
        self
    }

    pub fn args<I>(mut self, args: I) -> Command
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.args.extend(args.into_iter().map(|arg| arg.to_arg()));
        self
    }

    pub fn verb(&self) -> &[u8] {
        &self.args[0]
    }

    /// The verb, lowercased. Non UTF-8 verbs are replaced lossily.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.verb()).to_lowercase()
    }

    pub fn as_slice(&self) -> &[Bytes] {
        &self.args
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    // A command always carries its verb.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn into_args(self) -> Vec<Bytes> {
        self.args
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

impl TryFrom<Frame> for Command {
    type Error = Error;

    /// Rebuilds a command from a request array, as a server would see it.
    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        // Clients send commands to the Redis server as RESP arrays.
        let frames = match frame {
            Frame::Array(Some(array)) if !array.is_empty() => array,
            frame => {
                return Err(Error::Protocol(format!(
                    "invalid command frame, expected non-empty array, got {}",
                    frame.kind()
                )))
            }
        };

        let args = frames
            .into_iter()
            .map(|frame| match frame {
                Frame::Bulk(Some(bytes)) => Ok(bytes),
                Frame::Simple(bytes) => Ok(bytes),
                Frame::Integer(i) => Ok(i.to_arg()),
                frame => Err(Error::Protocol(format!(
                    "invalid command argument, expected string, got {}",
                    frame.kind()
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Command { args })
    }
}

/// Conversion of a value into a single command argument.
pub trait ToArg {
    fn to_arg(&self) -> Bytes;
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Bytes {
        (**self).to_arg()
    }
}

impl ToArg for str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl<const N: usize> ToArg for [u8; N] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

macro_rules! number_to_arg {
    ($($ty:ty),*) => {
        $(
            impl ToArg for $ty {
                fn to_arg(&self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

number_to_arg!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_command_with_mixed_arguments() {
        let cmd = Command::new("SET")
            .arg("key")
            .arg(String::from("value"))
            .arg(-7i64)
            .arg(1.5f64)
            .arg(&b"raw\x00bytes"[..])
            .arg(Bytes::from_static(b"bytes"));

        assert_eq!(
            cmd.as_slice(),
            &[
                Bytes::from("SET"),
                Bytes::from("key"),
                Bytes::from("value"),
                Bytes::from("-7"),
                Bytes::from("1.5"),
                Bytes::from(&b"raw\x00bytes"[..]),
                Bytes::from("bytes"),
            ]
        );
        assert_eq!(cmd.name(), "set");
        assert_eq!(cmd.verb(), b"SET");
    }

    #[test]
    fn build_command_from_iterator() {
        let cmd = Command::new("DEL").args(["a", "b", "c"]);

        assert_eq!(cmd.len(), 4);
        assert_eq!(cmd.to_string(), "DEL a b c");
    }

    #[test]
    fn parse_command_from_bulk_array() {
        let frame = Frame::Array(Some(vec![
            Frame::bulk("GET"),
            Frame::bulk("foo-from-bytes"),
        ]));

        let cmd = Command::try_from(frame).unwrap();

        assert_eq!(cmd, Command::new("GET").arg("foo-from-bytes"));
    }

    #[test]
    fn parse_command_from_mixed_frames() {
        let frame = Frame::Array(Some(vec![
            Frame::simple("SET"),
            Frame::bulk("foo"),
            Frame::Integer(3),
        ]));

        let cmd = Command::try_from(frame).unwrap();

        assert_eq!(cmd, Command::new("SET").arg("foo").arg(3));
    }

    #[test]
    fn parse_command_rejects_non_arrays() {
        assert!(matches!(
            Command::try_from(Frame::simple("PING")),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            Command::try_from(Frame::Array(Some(vec![]))),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            Command::try_from(Frame::Array(Some(vec![Frame::Bulk(None)]))),
            Err(Error::Protocol(_))
        ));
    }
}
