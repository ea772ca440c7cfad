// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::Buf;
use bytes::Bytes;
use std::io::Cursor;
use std::str;
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

/// Deepest array nesting accepted from a peer. Parsing recurses once per level.
pub const MAX_NESTING: usize = 512;

#[derive(Debug, ThisError, PartialEq)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame data type: {0:#04x}")]
    InvalidDataType(u8),
    #[error("invalid frame format; {0}")]
    Invalid(String),
}

/// A single decoded reply.
///
/// Nil bulk strings and nil arrays are kept apart from their empty counterparts: `Bulk(None)` is
/// `$-1`, `Bulk(Some(""))` is `$0`.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(Bytes),
    Error(Bytes),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<Frame>>),
}

// Protocol specification: https://redis.io/docs/reference/protocol-spec/
impl Frame {
    /// Parses one complete frame starting at the cursor position.
    ///
    /// Returns [`Error::Incomplete`] when the buffer ends before the frame does. The cursor position
    /// is meaningless in that case and the caller is expected to retry from the same start once more
    /// bytes are buffered.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        Self::parse_nested(src, 0)
    }

    // `depth` counts the arrays enclosing the frame being parsed.
    fn parse_nested(src: &mut Cursor<&[u8]>, depth: usize) -> Result<Self, Error> {
        // The first byte in an RESP-serialized payload always identifies its type.
        // Subsequent bytes constitute the type's contents.
        let first_byte = get_byte(src)?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::SimpleString => {
                let line = get_line(src)?;
                Ok(Frame::Simple(Bytes::copy_from_slice(line)))
            }
            DataType::SimpleError => {
                let line = get_line(src)?;
                Ok(Frame::Error(Bytes::copy_from_slice(line)))
            }
            DataType::Integer => {
                let integer = parse_integer(get_line(src)?)?;
                Ok(Frame::Integer(integer))
            }
            // $<length>\r\n<data>\r\n
            DataType::BulkString => {
                let length = parse_integer(get_line(src)?)?;

                if length < 0 {
                    return Ok(Frame::Bulk(None));
                }

                let data = get_exact(src, length as usize)?;
                let data = Bytes::copy_from_slice(data);

                Ok(Frame::Bulk(Some(data)))
            }
            // *<number-of-elements>\r\n<element-1>...<element-n>
            DataType::Array => {
                let length = parse_integer(get_line(src)?)?;

                if length < 0 {
                    return Ok(Frame::Array(None));
                }

                if depth >= MAX_NESTING {
                    return Err(Error::Invalid(format!(
                        "arrays nested deeper than {} levels",
                        MAX_NESTING
                    )));
                }

                // Every nested frame takes at least three bytes, a bogus count must not turn into a
                // huge allocation.
                let capacity = (length as usize).min(src.remaining() / 3);
                let mut frames = Vec::with_capacity(capacity);
                for _ in 0..length {
                    let frame = Self::parse_nested(src, depth + 1)?;
                    frames.push(frame);
                }

                Ok(Frame::Array(Some(frames)))
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.serialize_into(&mut bytes);
        bytes
    }

    fn serialize_into(&self, bytes: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => {
                bytes.push(u8::from(DataType::SimpleString));
                bytes.extend_from_slice(s);
                bytes.extend_from_slice(CRLF);
            }
            Frame::Error(s) => {
                bytes.push(u8::from(DataType::SimpleError));
                bytes.extend_from_slice(s);
                bytes.extend_from_slice(CRLF);
            }
            Frame::Integer(i) => {
                bytes.push(u8::from(DataType::Integer));
                bytes.extend_from_slice(i.to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
            }
            Frame::Bulk(None) => {
                bytes.push(u8::from(DataType::BulkString));
                bytes.extend_from_slice(b"-1");
                bytes.extend_from_slice(CRLF);
            }
            Frame::Bulk(Some(data)) => {
                bytes.push(u8::from(DataType::BulkString));
                bytes.extend_from_slice(data.len().to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes.extend_from_slice(data);
                bytes.extend_from_slice(CRLF);
            }
            Frame::Array(None) => {
                bytes.push(u8::from(DataType::Array));
                bytes.extend_from_slice(b"-1");
                bytes.extend_from_slice(CRLF);
            }
            Frame::Array(Some(arr)) => {
                bytes.push(u8::from(DataType::Array));
                bytes.extend_from_slice(arr.len().to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
                for frame in arr {
                    frame.serialize_into(bytes);
                }
            }
        }
    }

    /// Human readable name of the variant, used in binding errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Simple(_) => "simple string",
            Frame::Error(_) => "error",
            Frame::Integer(_) => "integer",
            Frame::Bulk(Some(_)) => "bulk string",
            Frame::Bulk(None) => "nil bulk string",
            Frame::Array(Some(_)) => "array",
            Frame::Array(None) => "nil array",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Frame::Bulk(None) | Frame::Array(None))
    }

    /// Text of a simple string, error or bulk string when it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::Simple(b) | Frame::Error(b) | Frame::Bulk(Some(b)) => str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn bulk(data: impl Into<Bytes>) -> Frame {
        Frame::Bulk(Some(data.into()))
    }

    pub fn simple(s: impl Into<Bytes>) -> Frame {
        Frame::Simple(s.into())
    }

    pub fn error(s: impl Into<Bytes>) -> Frame {
        Frame::Error(s.into())
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "{}", String::from_utf8_lossy(s)),
            Frame::Error(s) => write!(f, "(error) {}", String::from_utf8_lossy(s)),
            Frame::Integer(i) => write!(f, "(integer) {}", i),
            Frame::Bulk(Some(bytes)) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            Frame::Bulk(None) | Frame::Array(None) => write!(f, "(nil)"),
            Frame::Array(Some(arr)) if arr.is_empty() => write!(f, "(empty array)"),
            Frame::Array(Some(arr)) => {
                for (i, frame) in arr.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, frame)?;
                }
                Ok(())
            }
        }
    }
}

fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    let line_end = buf[start..]
        .windows(2)
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(Error::Incomplete)?;

    src.set_position((line_end + CRLF.len()) as u64);

    Ok(&buf[start..line_end])
}

/// Reads exactly `length` payload bytes followed by CRLF. Bulk payloads may themselves contain CRLF,
/// so the terminator is located by length, never by scanning.
fn get_exact<'a>(src: &mut Cursor<&'a [u8]>, length: usize) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    let end = start.checked_add(length).ok_or(Error::Incomplete)?;
    if buf.len() < end + CRLF.len() {
        return Err(Error::Incomplete);
    }

    if &buf[end..end + CRLF.len()] != CRLF {
        return Err(Error::Invalid(format!(
            "bulk string of length {} is not terminated by CRLF",
            length
        )));
    }

    src.set_position((end + CRLF.len()) as u64);

    Ok(&buf[start..end])
}

fn parse_integer(line: &[u8]) -> Result<i64, Error> {
    str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::Invalid(format!(
                "expected an integer, got {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

#[derive(Debug)]
enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    BulkString,   // '$'
    Array,        // '*'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'*' => Ok(Self::Array),
            _ => Err(Error::InvalidDataType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::Array => b'*',
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(data: &[u8]) -> (Result<Frame, Error>, u64) {
        let mut cursor = Cursor::new(data);
        let frame = Frame::parse(&mut cursor);
        (frame, cursor.position())
    }

    #[test]
    fn parse_simple_string_frame() {
        let (frame, _) = parse(b"+OK\r\n");

        assert_eq!(frame, Ok(Frame::simple("OK")));
    }

    #[test]
    fn parse_simple_error_frame() {
        let (frame, _) = parse(b"-Error message\r\n");

        assert_eq!(frame, Ok(Frame::error("Error message")));
    }

    fn parse_integer_frame(data: &[u8], expected: i64) {
        let (frame, _) = parse(data);

        assert_eq!(frame, Ok(Frame::Integer(expected)));
    }

    #[test]
    fn parse_integer_frame_positive() {
        parse_integer_frame(b":1000\r\n", 1000);
    }

    #[test]
    fn parse_integer_frame_negative() {
        parse_integer_frame(b":-1000\r\n", -1000);
    }

    #[test]
    fn parse_integer_frame_zero() {
        parse_integer_frame(b":0\r\n", 0);
    }

    #[test]
    fn parse_integer_frame_positive_signed() {
        parse_integer_frame(b":+1000\r\n", 1000);
    }

    #[test]
    fn parse_integer_frame_not_a_number() {
        let (frame, _) = parse(b":12a\r\n");

        assert!(matches!(frame, Err(Error::Invalid(_))));
    }

    #[test]
    fn parse_bulk_string_frame() {
        let (frame, position) = parse(b"$6\r\nfoobar\r\n");

        assert_eq!(frame, Ok(Frame::bulk("foobar")));
        // Header line plus exactly N + 2 body bytes.
        assert_eq!(position, 4 + 6 + 2);
    }

    #[test]
    fn parse_bulk_string_frame_with_crlf_in_payload() {
        let (frame, _) = parse(b"$8\r\nfoo\r\nbar\r\n");

        assert_eq!(frame, Ok(Frame::bulk("foo\r\nbar")));
    }

    #[test]
    fn parse_bulk_string_frame_empty() {
        let (frame, _) = parse(b"$0\r\n\r\n");

        assert_eq!(frame, Ok(Frame::bulk("")));
    }

    #[test]
    fn parse_bulk_string_frame_null() {
        let (frame, position) = parse(b"$-1\r\n+OK\r\n");

        assert_eq!(frame, Ok(Frame::Bulk(None)));
        // Only the header line is consumed.
        assert_eq!(position, 5);
    }

    #[test]
    fn parse_bulk_string_frame_missing_terminator() {
        let (frame, _) = parse(b"$3\r\nfoobar\r\n");

        assert!(matches!(frame, Err(Error::Invalid(_))));
    }

    #[test]
    fn parse_bulk_string_frame_incomplete() {
        assert_eq!(parse(b"$6\r\nfoo").0, Err(Error::Incomplete));
        assert_eq!(parse(b"$6\r\nfoobar").0, Err(Error::Incomplete));
        assert_eq!(parse(b"$6").0, Err(Error::Incomplete));
        assert_eq!(parse(b"").0, Err(Error::Incomplete));
    }

    #[test]
    fn parse_invalid_data_type() {
        let (frame, _) = parse(b"?what\r\n");

        assert_eq!(frame, Err(Error::InvalidDataType(b'?')));
    }

    #[test]
    fn parse_array_frame_empty() {
        let (frame, _) = parse(b"*0\r\n");

        assert_eq!(frame, Ok(Frame::Array(Some(vec![]))));
    }

    #[test]
    fn parse_array_frame() {
        let (frame, _) = parse(b"*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n");

        assert_eq!(
            frame,
            Ok(Frame::Array(Some(vec![
                Frame::bulk("hello"),
                Frame::bulk("world")
            ])))
        );
    }

    #[test]
    fn parse_array_frame_nested() {
        let (frame, _) = parse(b"*2\r\n*3\r\n:1\r\n:2\r\n:3\r\n*2\r\n+Hello\r\n-World\r\n");

        assert_eq!(
            frame,
            Ok(Frame::Array(Some(vec![
                Frame::Array(Some(vec![
                    Frame::Integer(1),
                    Frame::Integer(2),
                    Frame::Integer(3)
                ])),
                Frame::Array(Some(vec![Frame::simple("Hello"), Frame::error("World")])),
            ])))
        );
    }

    #[test]
    fn parse_array_frame_null() {
        let (frame, position) = parse(b"*-1\r\n");

        assert_eq!(frame, Ok(Frame::Array(None)));
        assert_eq!(position, 5);
    }

    #[test]
    fn parse_array_frame_null_in_the_middle() {
        let (frame, _) = parse(b"*3\r\n$5\r\nhello\r\n$-1\r\n$5\r\nworld\r\n");

        assert_eq!(
            frame,
            Ok(Frame::Array(Some(vec![
                Frame::bulk("hello"),
                Frame::Bulk(None),
                Frame::bulk("world")
            ])))
        );
    }

    #[test]
    fn parse_array_frame_consumes_exactly_its_elements() {
        let data = b"*2\r\n:1\r\n:2\r\n:3\r\n";
        let (frame, position) = parse(data);

        assert_eq!(
            frame,
            Ok(Frame::Array(Some(vec![Frame::Integer(1), Frame::Integer(2)])))
        );
        assert_eq!(position as usize, data.len() - 4);
    }

    fn nested_arrays(levels: usize) -> Vec<u8> {
        let mut data = b"*1\r\n".repeat(levels);
        data.extend_from_slice(b":1\r\n");
        data
    }

    #[test]
    fn parse_array_frame_nested_up_to_the_limit() {
        let (frame, _) = parse(&nested_arrays(MAX_NESTING));

        let mut expected = Frame::Integer(1);
        for _ in 0..MAX_NESTING {
            expected = Frame::Array(Some(vec![expected]));
        }
        assert_eq!(frame, Ok(expected));
    }

    #[test]
    fn parse_array_frame_nested_too_deep() {
        let (frame, _) = parse(&nested_arrays(MAX_NESTING + 1));

        assert!(matches!(frame, Err(Error::Invalid(_))), "got {:?}", frame);
    }

    #[test]
    fn parse_array_frame_incomplete() {
        let (frame, _) = parse(b"*2\r\n$5\r\nhello\r\n");

        assert_eq!(frame, Err(Error::Incomplete));
    }

    #[test]
    fn serialize_matches_wire_format() {
        let frame = Frame::Array(Some(vec![
            Frame::simple("OK"),
            Frame::error("ERR no"),
            Frame::Integer(-3),
            Frame::bulk("hi"),
            Frame::Bulk(None),
            Frame::Array(None),
        ]));

        assert_eq!(
            frame.serialize(),
            b"*6\r\n+OK\r\n-ERR no\r\n:-3\r\n$2\r\nhi\r\n$-1\r\n*-1\r\n".to_vec()
        );
    }

    #[test]
    fn display_nested_array() {
        let frame = Frame::Array(Some(vec![Frame::bulk("a"), Frame::Integer(2), Frame::Bulk(None)]));

        assert_eq!(frame.to_string(), "1) \"a\"\n2) (integer) 2\n3) (nil)");
    }
}
