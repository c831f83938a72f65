//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode outgoing commands and decode replies from a buffer that
//! may hold a partial record, without touching any I/O.
//!
//! ## Design Principles
//! 1. **Exact Sizing**: The encoder computes the final length first and
//!    writes into a single allocation.
//! 2. **Pull-Based Decoding**: `parse` looks at the buffered bytes and either
//!    returns one complete value with its length, or `NotEnoughData` having
//!    consumed nothing.
//! 3. **Binary-Safe**: Bulk strings are sliced out as raw bytes.
//! 4. **Fail Fast**: Framing violations return a typed `ProtocolError`.

use bytes::{BufMut, Bytes, BytesMut};

use rdasync_common::{Command, ProtocolError, Request, Value};

const CRLF: &[u8] = b"\r\n";

/// One decoded top-level reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Value(Value),
    /// `-` error reply. For arrays, the first error element.
    ServerError(String),
}

/// Outcome of a successful `parse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub reply: Reply,
    /// Bytes of the input the reply spans.
    pub consumed: usize,
}

/// Exact encoded size of one command.
pub fn encoded_len(command: &Command) -> usize {
    let args = command.as_args();
    let header = 1 + digit_count(args.len()) + CRLF.len();
    args.iter().fold(header, |total, arg| {
        total + 1 + digit_count(arg.len()) + CRLF.len() + arg.len() + CRLF.len()
    })
}

/// Encodes one command into a RESP array of bulk strings.
pub fn encode_command(command: &Command) -> Bytes {
    let mut out = BytesMut::with_capacity(encoded_len(command));
    write_command(command, &mut out);
    out.freeze()
}

/// Encodes a single command or a batch as one contiguous buffer.
pub fn encode_request(request: &Request) -> Bytes {
    let commands = request.commands();
    let total = commands.iter().map(encoded_len).sum();
    let mut out = BytesMut::with_capacity(total);
    for command in commands {
        write_command(command, &mut out);
    }
    debug_assert_eq!(out.len(), total);
    out.freeze()
}

fn write_command(command: &Command, out: &mut BytesMut) {
    let args = command.as_args();
    out.put_u8(b'*');
    push_usize(out, args.len());
    out.put_slice(CRLF);
    for arg in args {
        out.put_u8(b'$');
        push_usize(out, arg.len());
        out.put_slice(CRLF);
        out.put_slice(arg);
        out.put_slice(CRLF);
    }
}

fn digit_count(mut value: usize) -> usize {
    let mut digits = 1;
    while value >= 10 {
        value /= 10;
        digits += 1;
    }
    digits
}

fn push_usize(out: &mut BytesMut, mut value: usize) {
    let mut buf = [0u8; 20];
    let mut len = 0;
    loop {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
        if value == 0 {
            break;
        }
    }
    buf[..len].reverse();
    out.put_slice(&buf[..len]);
}

/// Decodes one reply from the start of `buf`.
///
/// Never reads past the end of `buf`. On `NotEnoughData` the caller keeps
/// the bytes and retries once more arrive.
pub fn parse(buf: &[u8]) -> Result<Parsed, ProtocolError> {
    let (reply, end) = parse_at(buf, 0)?;
    Ok(Parsed {
        reply,
        consumed: end,
    })
}

fn parse_at(buf: &[u8], pos: usize) -> Result<(Reply, usize), ProtocolError> {
    let intro = *buf.get(pos).ok_or(ProtocolError::NotEnoughData)?;
    match intro {
        b'+' => {
            let (line, end) = read_line(buf, pos + 1)?;
            Ok((Reply::Value(Value::String(Bytes::copy_from_slice(line))), end))
        }
        b'-' => {
            let (line, end) = read_line(buf, pos + 1)?;
            let message = String::from_utf8_lossy(line).into_owned();
            Ok((Reply::ServerError(message), end))
        }
        b':' => {
            let (value, end) = read_integer(buf, pos + 1)?;
            Ok((Reply::Value(Value::Integer(value)), end))
        }
        b'$' => parse_bulk(buf, pos + 1),
        b'*' => parse_array(buf, pos + 1),
        _ => Err(ProtocolError::WrongIntroduction),
    }
}

fn parse_bulk(buf: &[u8], pos: usize) -> Result<(Reply, usize), ProtocolError> {
    let (len, start) = read_integer(buf, pos)?;
    let len = match len {
        -1 => return Ok((Reply::Value(Value::Nil), start)),
        len if len < -1 => return Err(ProtocolError::CountRange),
        len => usize::try_from(len).map_err(|_| ProtocolError::CountRange)?,
    };
    let data_end = start.checked_add(len).ok_or(ProtocolError::CountRange)?;
    let end = data_end.checked_add(CRLF.len()).ok_or(ProtocolError::CountRange)?;
    if buf.len() < end {
        return Err(ProtocolError::NotEnoughData);
    }
    if &buf[data_end..end] != CRLF {
        return Err(ProtocolError::BulkTerminator);
    }
    let data = Bytes::copy_from_slice(&buf[start..data_end]);
    Ok((Reply::Value(Value::String(data)), end))
}

fn parse_array(buf: &[u8], pos: usize) -> Result<(Reply, usize), ProtocolError> {
    let (count, mut cursor) = read_integer(buf, pos)?;
    let count = match count {
        -1 => return Ok((Reply::Value(Value::Nil), cursor)),
        count if count < -1 => return Err(ProtocolError::CountRange),
        count => usize::try_from(count).map_err(|_| ProtocolError::CountRange)?,
    };

    // Each element needs at least 3 bytes, so cap the reservation by what is buffered.
    let mut items = Vec::with_capacity(count.min(buf.len().saturating_sub(cursor) / 3));
    let mut first_error = None;
    for _ in 0..count {
        let (reply, end) = parse_at(buf, cursor)?;
        cursor = end;
        match reply {
            Reply::Value(value) => items.push(value),
            // The whole array is still consumed so the stream stays aligned.
            Reply::ServerError(message) => {
                first_error.get_or_insert(message);
            }
        }
    }

    match first_error {
        Some(message) => Ok((Reply::ServerError(message), cursor)),
        None => Ok((Reply::Value(Value::Array(items)), cursor)),
    }
}

/// Returns the line body starting at `pos` and the index just past its CRLF.
fn read_line(buf: &[u8], pos: usize) -> Result<(&[u8], usize), ProtocolError> {
    let rest = buf.get(pos..).ok_or(ProtocolError::NotEnoughData)?;
    let len = rest
        .windows(2)
        .position(|window| window == CRLF)
        .ok_or(ProtocolError::NotEnoughData)?;
    Ok((&rest[..len], pos + len + CRLF.len()))
}

fn read_integer(buf: &[u8], pos: usize) -> Result<(i64, usize), ProtocolError> {
    let (line, end) = read_line(buf, pos)?;
    Ok((parse_i64(line)?, end))
}

fn parse_i64(data: &[u8]) -> Result<i64, ProtocolError> {
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some((b'+', rest)) => (false, rest),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(ProtocolError::CountConversion);
    }

    // Accumulate toward the sign so i64::MIN parses without overflow.
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::CountConversion);
        }
        let digit = (b - b'0') as i64;
        value = value
            .checked_mul(10)
            .and_then(|v| if negative { v.checked_sub(digit) } else { v.checked_add(digit) })
            .ok_or(ProtocolError::CountConversion)?;
    }
    Ok(value)
}
