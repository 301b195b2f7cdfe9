//! Blocking RESP client used to drive the target server.
//!
//! Requests are framed as multi-bulk arrays built from the whitespace-separated
//! words of a command line. Replies are decoded one at a time in the order the
//! server sends them, which on a single connection is the order the requests
//! were written.

use crate::config::{ProtocolVersion, TargetAddr};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Upper bound for a single bulk string or aggregate length announced by the server.
const MAX_FRAME_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound for a simple reply line, type byte and CRLF included.
const MAX_LINE_LEN: u64 = 64 * 1024;

/// Deepest aggregate nesting accepted in one reply.
const MAX_NESTING_DEPTH: usize = 128;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to resolve {target}: {source}")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Protocol handshake failed: {0}")]
    Handshake(String),

    #[error("Connection I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed by server")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// A decoded server reply. Contents are kept so tests and handshakes can inspect them;
/// the fuzz loop only counts them.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Array(Vec<Reply>),
    Null,
    Double(String),
    Boolean(bool),
    BigNumber(String),
    Verbatim { format: String, text: Vec<u8> },
    Map(Vec<(Reply, Reply)>),
    Set(Vec<Reply>),
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

/// The operations the executor needs from a connection: one pipelined write of a whole
/// batch, then replies read back one at a time in FIFO order.
pub trait PipelineConnection {
    /// Enqueues every command and flushes them before returning.
    fn send_pipelined(&mut self, commands: &[String]) -> Result<(), ConnectionError>;

    /// Reads the next reply in send order.
    fn read_reply(&mut self) -> Result<Reply, ConnectionError>;
}

/// Frames a command line as a RESP multi-bulk request.
pub fn encode_command(command: &str) -> Vec<u8> {
    let args: Vec<&str> = command.split_ascii_whitespace().collect();
    let mut buf = Vec::with_capacity(command.len() + 16 * (args.len() + 1));
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Incremental RESP2/RESP3 reply decoder over any buffered reader.
pub struct RespReader<R: BufRead> {
    inner: R,
}

impl<R: BufRead> RespReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads one complete reply. Push frames are skipped and attribute frames are
    /// consumed along with the reply they annotate.
    pub fn read_reply(&mut self) -> Result<Reply, ConnectionError> {
        loop {
            let line = self.read_line()?;
            let (kind, rest) = split_type(&line)?;
            match kind {
                b'>' => {
                    let len = parse_len(rest)?;
                    let frame = self.read_elements(len, 1)?;
                    trace!(elements = frame.len(), "Skipping push frame");
                }
                b'|' => {
                    let len = parse_len(rest)?;
                    self.read_pairs(len, 1)?;
                }
                _ => return self.read_typed(kind, rest, 0),
            }
        }
    }

    fn read_value(&mut self, depth: usize) -> Result<Reply, ConnectionError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(ConnectionError::Protocol(format!(
                "reply nesting deeper than {MAX_NESTING_DEPTH} levels"
            )));
        }
        let line = self.read_line()?;
        let (kind, rest) = split_type(&line)?;
        self.read_typed(kind, rest, depth)
    }

    /// Decodes a value whose header line is already read. `depth` is the number of
    /// aggregates enclosing it.
    fn read_typed(
        &mut self,
        kind: u8,
        rest: &str,
        depth: usize,
    ) -> Result<Reply, ConnectionError> {
        let reply = match kind {
            b'+' => Reply::Status(rest.to_string()),
            b'-' => Reply::Error(rest.to_string()),
            b':' => Reply::Integer(parse_int(rest)?),
            b'$' => match parse_optional_len(rest)? {
                Some(len) => Reply::Bulk(self.read_blob(len)?),
                None => Reply::Null,
            },
            b'*' => match parse_optional_len(rest)? {
                Some(len) => Reply::Array(self.read_elements(len, depth + 1)?),
                None => Reply::Null,
            },
            b'_' => Reply::Null,
            b',' => Reply::Double(rest.to_string()),
            b'#' => match rest {
                "t" => Reply::Boolean(true),
                "f" => Reply::Boolean(false),
                other => {
                    return Err(ConnectionError::Protocol(format!(
                        "invalid boolean '{other}'"
                    )));
                }
            },
            b'(' => Reply::BigNumber(rest.to_string()),
            b'!' => {
                let blob = self.read_blob(parse_len(rest)?)?;
                Reply::Error(String::from_utf8_lossy(&blob).into_owned())
            }
            b'=' => {
                let blob = self.read_blob(parse_len(rest)?)?;
                if blob.len() < 4 || blob[3] != b':' {
                    return Err(ConnectionError::Protocol(
                        "verbatim string without format prefix".to_string(),
                    ));
                }
                Reply::Verbatim {
                    format: String::from_utf8_lossy(&blob[..3]).into_owned(),
                    text: blob[4..].to_vec(),
                }
            }
            b'%' => Reply::Map(self.read_pairs(parse_len(rest)?, depth + 1)?),
            b'~' => Reply::Set(self.read_elements(parse_len(rest)?, depth + 1)?),
            other => {
                return Err(ConnectionError::Protocol(format!(
                    "unknown reply type byte 0x{other:02x}"
                )));
            }
        };
        Ok(reply)
    }

    fn read_elements(&mut self, len: usize, depth: usize) -> Result<Vec<Reply>, ConnectionError> {
        let mut elements = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            elements.push(self.read_value(depth)?);
        }
        Ok(elements)
    }

    fn read_pairs(
        &mut self,
        len: usize,
        depth: usize,
    ) -> Result<Vec<(Reply, Reply)>, ConnectionError> {
        let mut pairs = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            let key = self.read_value(depth)?;
            let value = self.read_value(depth)?;
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    fn read_line(&mut self) -> Result<String, ConnectionError> {
        let mut raw = Vec::new();
        let read = (&mut self.inner)
            .take(MAX_LINE_LEN)
            .read_until(b'\n', &mut raw)?;
        if !raw.ends_with(b"\n") {
            if read as u64 == MAX_LINE_LEN {
                return Err(ConnectionError::Protocol(format!(
                    "reply line longer than {MAX_LINE_LEN} bytes"
                )));
            }
            return Err(ConnectionError::Closed);
        }
        if !raw.ends_with(b"\r\n") {
            return Err(ConnectionError::Protocol(
                "reply line not terminated by CRLF".to_string(),
            ));
        }
        raw.truncate(raw.len() - 2);
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Reads `len` payload bytes plus CRLF. The buffer grows with the bytes that
    /// actually arrive, not with the announced length.
    fn read_blob(&mut self, len: usize) -> Result<Vec<u8>, ConnectionError> {
        let expected = len + 2;
        let mut blob = Vec::with_capacity(expected.min(8 * 1024));
        let read = (&mut self.inner)
            .take(expected as u64)
            .read_to_end(&mut blob)?;
        if read < expected {
            return Err(ConnectionError::Closed);
        }
        if &blob[len..] != b"\r\n" {
            return Err(ConnectionError::Protocol(
                "bulk payload not terminated by CRLF".to_string(),
            ));
        }
        blob.truncate(len);
        Ok(blob)
    }
}

fn split_type(line: &str) -> Result<(u8, &str), ConnectionError> {
    let kind = *line
        .as_bytes()
        .first()
        .ok_or_else(|| ConnectionError::Protocol("empty reply line".to_string()))?;
    if !kind.is_ascii() {
        return Err(ConnectionError::Protocol(format!(
            "unknown reply type byte 0x{kind:02x}"
        )));
    }
    Ok((kind, &line[1..]))
}

fn parse_int(s: &str) -> Result<i64, ConnectionError> {
    s.parse()
        .map_err(|_| ConnectionError::Protocol(format!("invalid integer '{s}'")))
}

fn parse_optional_len(s: &str) -> Result<Option<usize>, ConnectionError> {
    let len = parse_int(s)?;
    if len == -1 {
        return Ok(None);
    }
    if !(0..=MAX_FRAME_LEN).contains(&len) {
        return Err(ConnectionError::Protocol(format!("invalid length {len}")));
    }
    Ok(Some(len as usize))
}

fn parse_len(s: &str) -> Result<usize, ConnectionError> {
    parse_optional_len(s)?
        .ok_or_else(|| ConnectionError::Protocol("unexpected null length".to_string()))
}

/// A single blocking TCP session with the target server.
pub struct RespConnection {
    reader: RespReader<BufReader<TcpStream>>,
    writer: BufWriter<TcpStream>,
}

impl RespConnection {
    /// Connects to `target`, applies `timeout` to the connect and to every later read
    /// and write, and negotiates RESP3 when asked to.
    pub fn connect(
        target: &TargetAddr,
        timeout: Duration,
        protocol: ProtocolVersion,
    ) -> Result<Self, ConnectionError> {
        let target_str = target.to_string();
        let addrs: Vec<SocketAddr> = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|source| ConnectionError::Resolve {
                target: target_str.clone(),
                source,
            })?
            .collect();

        let mut last_err =
            io::Error::new(io::ErrorKind::NotFound, "address resolved to no candidates");
        let mut stream = None;
        for addr in addrs {
            debug!(%addr, "Attempting connection");
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = e,
            }
        }
        let stream = stream.ok_or_else(|| ConnectionError::Connect {
            target: target_str.clone(),
            source: last_err,
        })?;

        let configure = |stream: &TcpStream| -> io::Result<()> {
            stream.set_read_timeout(Some(timeout))?;
            stream.set_write_timeout(Some(timeout))?;
            stream.set_nodelay(true)
        };
        configure(&stream).map_err(|source| ConnectionError::Connect {
            target: target_str.clone(),
            source,
        })?;

        let peer = stream.peer_addr()?;
        let read_half = stream.try_clone()?;
        let mut connection = Self {
            reader: RespReader::new(BufReader::new(read_half)),
            writer: BufWriter::new(stream),
        };
        info!(%peer, ?protocol, "Connected to target");

        if protocol == ProtocolVersion::Resp3 {
            connection.hello3()?;
        }
        Ok(connection)
    }

    fn hello3(&mut self) -> Result<(), ConnectionError> {
        self.send_pipelined(&["HELLO 3".to_string()])
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        match self.read_reply() {
            Ok(Reply::Error(message)) => Err(ConnectionError::Handshake(message)),
            Ok(_) => {
                debug!("RESP3 negotiated");
                Ok(())
            }
            Err(e) => Err(ConnectionError::Handshake(e.to_string())),
        }
    }
}

impl PipelineConnection for RespConnection {
    fn send_pipelined(&mut self, commands: &[String]) -> Result<(), ConnectionError> {
        let mut buf = Vec::new();
        for command in commands {
            buf.extend_from_slice(&encode_command(command));
        }
        self.writer.write_all(&buf)?;
        self.writer.flush()?;
        Ok(())
    }

    fn read_reply(&mut self) -> Result<Reply, ConnectionError> {
        self.reader.read_reply()
    }
}
