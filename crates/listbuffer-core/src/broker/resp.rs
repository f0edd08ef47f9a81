//! RESP2 codec: command encoding and incremental reply parsing.

use crate::Item;
use crate::error::BrokerError;

/// Nesting limit for arrays in a reply.
const MAX_DEPTH: usize = 32;

/// Largest bulk string accepted (matches Redis' `proto-max-bulk-len`).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// A decoded reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string
    Bulk(Option<Vec<u8>>),
    /// `None` is the null array
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Convert an error reply into `BrokerError::Server`.
    pub fn into_result(self) -> Result<Self, BrokerError> {
        match self {
            Self::Error(msg) => Err(BrokerError::Server(msg)),
            other => Ok(other),
        }
    }

    pub fn into_integer(self) -> Result<i64, BrokerError> {
        match self.into_result()? {
            Self::Integer(n) => Ok(n),
            other => Err(unexpected("integer", &other)),
        }
    }

    /// Expect a simple `OK`-style status.
    pub fn into_status(self) -> Result<String, BrokerError> {
        match self.into_result()? {
            Self::Simple(status) => Ok(status),
            other => Err(unexpected("status", &other)),
        }
    }

    /// Array of bulk strings, as returned by `LRANGE`. A null array is empty.
    /// Item bytes are passed through untouched.
    pub fn into_items(self) -> Result<Vec<Item>, BrokerError> {
        match self.into_result()? {
            Self::Array(None) => Ok(Vec::new()),
            Self::Array(Some(values)) => values
                .into_iter()
                .map(|value| match value {
                    Self::Bulk(Some(bytes)) => Ok(bytes),
                    other => Err(unexpected("bulk string", &other)),
                })
                .collect(),
            other => Err(unexpected("array", &other)),
        }
    }

    /// Elements of a (non-null) array reply.
    pub fn into_array(self) -> Result<Vec<Self>, BrokerError> {
        match self.into_result()? {
            Self::Array(Some(values)) => Ok(values),
            other => Err(unexpected("array", &other)),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Simple(_) => "status",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::Bulk(_) => "bulk string",
            Self::Array(_) => "array",
        }
    }
}

fn unexpected(expected: &str, got: &RespValue) -> BrokerError {
    BrokerError::Protocol(format!("expected {expected} reply, got {}", got.kind()))
}

/// Encode a command as an array of bulk strings.
#[must_use]
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let payload: usize = args.iter().map(|a| a.len() + 16).sum();
    let mut out = Vec::with_capacity(payload + 16);
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Parse one reply from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the value and
/// the number of bytes it occupied.
pub fn parse(buf: &[u8]) -> Result<Option<(RespValue, usize)>, BrokerError> {
    Decoder::default().decode(buf)
}

/// Resumable reply parser.
///
/// Keeps the arrays of a partially received reply, so each call only looks
/// at bytes it has not parsed before. The caller must keep the buffer
/// prefix intact until a reply is returned, then drop the consumed bytes;
/// the decoder starts over at offset 0.
#[derive(Debug, Default)]
pub struct Decoder {
    pos: usize,
    open: Vec<OpenArray>,
}

#[derive(Debug)]
struct OpenArray {
    remaining: usize,
    values: Vec<RespValue>,
}

enum Frame {
    Value(RespValue),
    ArrayHeader(usize),
}

impl Decoder {
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(RespValue, usize)>, BrokerError> {
        let result = self.advance(buf);
        if result.is_err() {
            self.reset();
        }
        result
    }

    /// Forget any partially parsed reply.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.open.clear();
    }

    fn advance(&mut self, buf: &[u8]) -> Result<Option<(RespValue, usize)>, BrokerError> {
        loop {
            if self.open.len() > MAX_DEPTH {
                return Err(BrokerError::Protocol("reply nested too deeply".to_string()));
            }
            let Some((frame, next)) = parse_frame(buf, self.pos)? else {
                return Ok(None);
            };
            self.pos = next;

            let mut value = match frame {
                Frame::Value(value) => value,
                Frame::ArrayHeader(len) => {
                    // Every element needs at least three bytes; cap the allocation.
                    let hint = buf.len().saturating_sub(next) / 3;
                    self.open.push(OpenArray {
                        remaining: len,
                        values: Vec::with_capacity(len.min(hint)),
                    });
                    continue;
                }
            };

            // Fold the finished value into its parents.
            loop {
                let Some(mut parent) = self.open.pop() else {
                    let used = self.pos;
                    self.pos = 0;
                    return Ok(Some((value, used)));
                };
                parent.values.push(value);
                parent.remaining -= 1;
                if parent.remaining > 0 {
                    self.open.push(parent);
                    break;
                }
                value = RespValue::Array(Some(parent.values));
            }
        }
    }
}

/// One scalar, or the header of a non-empty array, starting at `pos`.
fn parse_frame(buf: &[u8], pos: usize) -> Result<Option<(Frame, usize)>, BrokerError> {
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1)? else {
        return Ok(None);
    };

    let value = match tag {
        b'+' => RespValue::Simple(text(line)),
        b'-' => RespValue::Error(text(line)),
        b':' => RespValue::Integer(number(line)?),
        b'$' => {
            let len = number(line)?;
            if len < 0 {
                return Ok(Some((Frame::Value(RespValue::Bulk(None)), next)));
            }
            if len > MAX_BULK_LEN {
                return Err(BrokerError::Protocol(format!("bulk length {len} too large")));
            }
            let end = next + len as usize;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(BrokerError::Protocol(
                    "bulk string not terminated by CRLF".to_string(),
                ));
            }
            let bytes = buf[next..end].to_vec();
            return Ok(Some((Frame::Value(RespValue::Bulk(Some(bytes))), end + 2)));
        }
        b'*' => match number(line)? {
            len if len < 0 => RespValue::Array(None),
            0 => RespValue::Array(Some(Vec::new())),
            len => return Ok(Some((Frame::ArrayHeader(len as usize), next))),
        },
        other => {
            return Err(BrokerError::Protocol(format!(
                "unknown reply type byte 0x{other:02x}"
            )));
        }
    };
    Ok(Some((Frame::Value(value), next)))
}

/// Line starting at `start`, without the CRLF, plus the offset after it.
fn read_line(buf: &[u8], start: usize) -> Result<Option<(&[u8], usize)>, BrokerError> {
    let Some(rest) = buf.get(start..) else {
        return Ok(None);
    };
    match rest.iter().position(|&b| b == b'\n') {
        None => Ok(None),
        Some(0) => Err(BrokerError::Protocol("bare LF in reply".to_string())),
        Some(lf) if rest[lf - 1] != b'\r' => {
            Err(BrokerError::Protocol("line not terminated by CRLF".to_string()))
        }
        Some(lf) => Ok(Some((&rest[..lf - 1], start + lf + 1))),
    }
}

fn text(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

fn number(line: &[u8]) -> Result<i64, BrokerError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| BrokerError::Protocol(format!("invalid integer {:?}", text(line))))
}
