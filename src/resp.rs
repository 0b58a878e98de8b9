use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;

/// Every request header is exactly four bytes: tag, one length digit, CRLF.
const FRAME_HEADER_LEN: usize = 4;

const MAX_RECORD_LINE_LEN: usize = 32;
const MAX_RECORD_ARGS: usize = 1024;

/// The single output type of every handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `None` encodes as the null bulk string, never as an empty payload.
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    pub(crate) fn ok() -> Self {
        Reply::Simple("OK".to_owned())
    }

    pub(crate) fn error(msg: impl Into<String>) -> Self {
        Reply::Error(msg.into())
    }

    pub(crate) fn null() -> Self {
        Reply::Bulk(None)
    }

    pub(crate) fn bulk(value: impl Into<Vec<u8>>) -> Self {
        Reply::Bulk(Some(value.into()))
    }

    pub(crate) fn count(n: usize) -> Self {
        Reply::Integer(i64::try_from(n).unwrap_or(i64::MAX))
    }

    pub(crate) fn bulks(items: Vec<Vec<u8>>) -> Self {
        Reply::Array(Some(items.into_iter().map(Reply::bulk).collect()))
    }

    pub(crate) fn wrong_args(cmd: &str) -> Self {
        Reply::Error(format!("ERR invalid number of arguments for '{cmd}' command"))
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Simple(s) => append_line(out, b'+', s.as_bytes()),
            Reply::Error(s) => append_line(out, b'-', s.as_bytes()),
            Reply::Integer(n) => append_int(out, *n),
            Reply::Bulk(Some(data)) => append_bulk(out, data),
            Reply::Bulk(None) => append_null(out),
            Reply::Array(None) => out.extend_from_slice(b"*-1\r\n"),
            Reply::Array(Some(items)) => {
                append_array_header(out, items.len());
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        self.encode(&mut out);
        out
    }
}

// ── Reply builders ────────────────────────────────────────────────────────────

fn append_line(out: &mut Vec<u8>, tag: u8, text: &[u8]) {
    out.push(tag);
    out.extend_from_slice(text);
    out.extend_from_slice(b"\r\n");
}

fn append_array_header(out: &mut Vec<u8>, len: usize) {
    out.push(b'*');
    out.extend_from_slice(len.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn append_int(out: &mut Vec<u8>, n: i64) {
    out.push(b':');
    out.extend_from_slice(n.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn append_null(out: &mut Vec<u8>) {
    out.extend_from_slice(b"$-1\r\n");
}

fn append_bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.push(b'$');
    out.extend_from_slice(data.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

// ── Request decoding ──────────────────────────────────────────────────────────

async fn read_frame_header<R: AsyncRead + Unpin>(
    reader: &mut R,
    tag: u8,
) -> Result<usize, ProtocolError> {
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    reader
        .read_exact(&mut hdr)
        .await
        .map_err(ProtocolError::from_read)?;
    if hdr[0] != tag {
        return Err(ProtocolError::Malformed(format!(
            "expected '{}' header, got 0x{:02x}",
            tag as char, hdr[0]
        )));
    }
    match hdr[1] {
        d @ b'0'..=b'9' => Ok(usize::from(d - b'0')),
        other => Err(ProtocolError::Malformed(format!(
            "length byte 0x{other:02x} is not a decimal digit"
        ))),
    }
}

/// Decode one request: `*N\r\n` followed by `N` frames of `$L\r\n<L bytes>\r\n`.
///
/// Lengths are a single ASCII digit, so at most nine arguments of at most nine
/// bytes each can be carried. Payloads are arbitrary bytes; the trailing
/// delimiters are consumed unchecked.
pub(crate) async fn read_command<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let count = read_frame_header(reader, b'*').await?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_frame_header(reader, b'$').await?;
        let mut buf = vec![0u8; len + 2];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(ProtocolError::from_read)?;
        buf.truncate(len);
        args.push(buf);
    }
    Ok(args)
}

// ── Append-log records ────────────────────────────────────────────────────────

/// Encode an invocation as a log record. Lengths are written in full decimal,
/// which matches request framing byte-for-byte whenever they fit in one digit.
pub(crate) fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.as_ref().len() + 8).sum::<usize>());
    append_array_header(&mut out, args.len());
    for arg in args {
        append_bulk(&mut out, arg.as_ref());
    }
    out
}

/// One decoded log record and the number of bytes it occupied on disk.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Record {
    pub(crate) args: Vec<Vec<u8>>,
    pub(crate) len: u64,
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn unexpected_eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "truncated record")
}

fn parse_len(line: &[u8], tag: u8, err_msg: &'static str) -> io::Result<usize> {
    let body = line.strip_prefix(&[tag]).ok_or_else(|| invalid_data(err_msg))?;
    std::str::from_utf8(body)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| invalid_data(err_msg))
}

/// Read one header line into `buf` without its line ending. Returns the number
/// of bytes consumed, or `None` at a clean end of input.
async fn read_record_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> io::Result<Option<usize>> {
    buf.clear();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(unexpected_eof());
        }
        if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            let take = pos + 1;
            if buf.len().saturating_add(take) > MAX_RECORD_LINE_LEN + 2 {
                return Err(invalid_data("record header too long"));
            }
            buf.extend_from_slice(&chunk[..take]);
            reader.consume(take);
            break;
        }
        if buf.len().saturating_add(chunk.len()) > MAX_RECORD_LINE_LEN + 2 {
            return Err(invalid_data("record header too long"));
        }
        let take = chunk.len();
        buf.extend_from_slice(chunk);
        reader.consume(take);
    }
    let consumed = buf.len();
    buf.pop();
    if buf.ends_with(b"\r") {
        buf.pop();
    }
    Ok(Some(consumed))
}

/// Read the next log record. `limit` is how many bytes remain in the log; a
/// record declaring more than that is cut short and reported as
/// `UnexpectedEof` before anything is allocated for it.
///
/// `Ok(None)` marks a clean end of log.
pub(crate) async fn read_record<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    limit: u64,
) -> io::Result<Option<Record>> {
    let mut line = Vec::new();
    let Some(header_len) = read_record_line(reader, &mut line).await? else {
        return Ok(None);
    };
    let mut consumed = header_len as u64;
    let count = parse_len(&line, b'*', "bad record header")?;
    if count > MAX_RECORD_ARGS {
        return Err(invalid_data("too many record arguments"));
    }
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let Some(line_len) = read_record_line(reader, &mut line).await? else {
            return Err(unexpected_eof());
        };
        consumed += line_len as u64;
        let len = parse_len(&line, b'$', "bad bulk header")?;
        let framed = (len as u64).saturating_add(2);
        if consumed.saturating_add(framed) > limit {
            return Err(unexpected_eof());
        }
        let mut buf = vec![0u8; len + 2];
        reader.read_exact(&mut buf).await?;
        if !buf.ends_with(b"\r\n") {
            return Err(invalid_data("record argument not followed by CRLF"));
        }
        buf.truncate(len);
        consumed += framed;
        args.push(buf);
    }
    Ok(Some(Record { args, len: consumed }))
}
