//! Blocking client for the memcached text protocol
//!
//! Each [`TextConnection`] owns one TCP socket plus the buffers used to
//! frame requests and read replies, so steady-state calls do not allocate
//! for request framing.

use super::{CasResult, Connection, Connector, Item, ProtocolError, StoreMode};
use crate::lb::Address;
use bytes::Bytes;
use socket2::{Domain, Protocol as SocketProtocol, Socket, Type};
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Longest key the protocol accepts
pub const MAX_KEY_LENGTH: usize = 250;

/// Default item size limit, matching memcached's default slab page
pub const DEFAULT_MAX_ITEM_SIZE: usize = 1024 * 1024;

/// Creates [`TextConnection`]s with shared socket settings
#[derive(Debug, Clone)]
pub struct TextConnector {
    /// Read/write timeout applied to every socket
    pub io_timeout: Option<Duration>,

    /// Values larger than this are rejected before being sent
    pub max_item_size: usize,
}

impl Default for TextConnector {
    fn default() -> Self {
        Self {
            io_timeout: Some(Duration::from_secs(4)),
            max_item_size: DEFAULT_MAX_ITEM_SIZE,
        }
    }
}

impl Connector for TextConnector {
    type Conn = TextConnection;

    fn client(&self, addr: &Address) -> TextConnection {
        TextConnection::new(addr.clone(), self.io_timeout, self.max_item_size)
    }
}

/// A single memcached text protocol connection
pub struct TextConnection {
    addr: Address,
    io_timeout: Option<Duration>,
    max_item_size: usize,
    reader: Option<BufReader<TcpStream>>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl TextConnection {
    /// Create an unconnected client for `addr`
    pub fn new(addr: Address, io_timeout: Option<Duration>, max_item_size: usize) -> Self {
        Self {
            addr,
            io_timeout,
            max_item_size,
            reader: None,
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
        }
    }

    fn open_stream(&self, timeout: Duration) -> Result<TcpStream, ProtocolError> {
        let targets: Vec<SocketAddr> = self
            .addr
            .as_str()
            .to_socket_addrs()
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("cannot resolve {}: {}", self.addr, e),
                )
            })?
            .collect();

        let mut last_err = None;
        for target in targets {
            match connect_socket(&target, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                    return Err(ProtocolError::InvalidState);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{} resolved to no addresses", self.addr),
                )
            })
            .into())
    }

    fn send(&mut self) -> Result<(), ProtocolError> {
        let reader = self.reader.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        let stream = reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        Ok(())
    }

    /// Send a single-line command and read the single-line reply
    fn command(&mut self, line: &str) -> Result<String, ProtocolError> {
        self.write_buf.clear();
        self.write_buf.extend_from_slice(line.as_bytes());
        self.write_buf.extend_from_slice(b"\r\n");
        self.send()?;
        self.read_line()
    }

    fn read_line(&mut self) -> Result<String, ProtocolError> {
        self.line_buf.clear();
        let reader = self.reader.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        let n = reader.read_until(b'\n', &mut self.line_buf)?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        if !self.line_buf.ends_with(b"\r\n") {
            return Err(ProtocolError::Protocol("unterminated response line".to_string()));
        }

        let line = String::from_utf8_lossy(&self.line_buf[..n - 2]).into_owned();
        check_error_reply(line)
    }

    fn retrieve(
        &mut self,
        command: &str,
        keys: &[&str],
    ) -> Result<HashMap<String, Item>, ProtocolError> {
        for key in keys {
            check_key(key)?;
        }

        self.write_buf.clear();
        self.write_buf.extend_from_slice(command.as_bytes());
        for key in keys {
            self.write_buf.push(b' ');
            self.write_buf.extend_from_slice(key.as_bytes());
        }
        self.write_buf.extend_from_slice(b"\r\n");
        self.send()?;

        let mut items = HashMap::with_capacity(keys.len());
        loop {
            let line = self.read_line()?;
            if line == "END" {
                return Ok(items);
            }
            let (key, item) = self.read_value(&line)?;
            items.insert(key, item);
        }
    }

    /// Read the data block following a `VALUE <key> <flags> <bytes> [<cas>]` header
    fn read_value(&mut self, header: &str) -> Result<(String, Item), ProtocolError> {
        let mut parts = header.split(' ');
        if parts.next() != Some("VALUE") {
            return Err(unexpected(header));
        }

        let key = parts.next().ok_or_else(|| unexpected(header))?.to_string();
        let flags: u32 = parse_field(parts.next(), header)?;
        let len: usize = parse_field(parts.next(), header)?;
        let cas = match parts.next() {
            Some(token) => Some(parse_field::<u64>(Some(token), header)?),
            None => None,
        };

        if len > self.max_item_size {
            return Err(ProtocolError::Protocol(format!(
                "value for {} claims {} bytes, limit is {}",
                key, len, self.max_item_size
            )));
        }

        let mut data = vec![0u8; len + 2];
        self.reader
            .as_mut()
            .ok_or(ProtocolError::ConnectionClosed)?
            .read_exact(&mut data)?;
        if !data.ends_with(b"\r\n") {
            return Err(ProtocolError::Protocol(format!(
                "data block for {} not terminated",
                key
            )));
        }
        data.truncate(len);

        Ok((
            key,
            Item {
                value: Bytes::from(data),
                flags,
                cas,
            },
        ))
    }

    fn check_item(&self, key: &str, value: &[u8]) -> Result<(), ProtocolError> {
        check_key(key)?;
        if value.len() > self.max_item_size {
            return Err(ProtocolError::ItemTooLarge {
                size: value.len(),
                max: self.max_item_size,
            });
        }
        Ok(())
    }

    fn send_storage(&mut self, header: &str, value: &[u8]) -> Result<String, ProtocolError> {
        self.write_buf.clear();
        self.write_buf.extend_from_slice(header.as_bytes());
        self.write_buf.extend_from_slice(b"\r\n");
        self.write_buf.extend_from_slice(value);
        self.write_buf.extend_from_slice(b"\r\n");
        self.send()?;
        self.read_line()
    }

    fn arithmetic(&mut self, op: &str, key: &str, delta: u64) -> Result<Option<u64>, ProtocolError> {
        check_key(key)?;
        let reply = self.command(&format!("{} {} {}", op, key, delta))?;
        if reply == "NOT_FOUND" {
            return Ok(None);
        }
        reply
            .trim_end()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| unexpected(&reply))
    }
}

impl Connection for TextConnection {
    fn address(&self) -> &Address {
        &self.addr
    }

    fn connect(&mut self, timeout: Duration) -> Result<(), ProtocolError> {
        if self.reader.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }

        let stream = self.open_stream(timeout)?;
        stream.set_read_timeout(self.io_timeout)?;
        stream.set_write_timeout(self.io_timeout)?;

        debug!(addr = %self.addr, "Connected to cache server");
        self.reader = Some(BufReader::new(stream));
        Ok(())
    }

    fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            // The peer may already be gone; nothing useful to do on error
            let _ = reader.get_ref().shutdown(Shutdown::Both);
            debug!(addr = %self.addr, "Closed cache server connection");
        }
        self.line_buf.clear();
        self.write_buf.clear();
    }

    fn is_connected(&self) -> bool {
        self.reader.is_some()
    }

    fn get(&mut self, key: &str) -> Result<Option<Item>, ProtocolError> {
        Ok(self.retrieve("get", &[key])?.remove(key))
    }

    fn gets(&mut self, key: &str) -> Result<Option<Item>, ProtocolError> {
        Ok(self.retrieve("gets", &[key])?.remove(key))
    }

    fn get_multi(&mut self, keys: &[&str]) -> Result<HashMap<String, Item>, ProtocolError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        self.retrieve("get", keys)
    }

    fn store(
        &mut self,
        mode: StoreMode,
        key: &str,
        value: &[u8],
        flags: u32,
        exptime: u32,
    ) -> Result<bool, ProtocolError> {
        self.check_item(key, value)?;
        let header = format!(
            "{} {} {} {} {}",
            mode.command(),
            key,
            flags,
            exptime,
            value.len()
        );
        match self.send_storage(&header, value)?.as_str() {
            "STORED" => Ok(true),
            "NOT_STORED" => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    fn cas(
        &mut self,
        key: &str,
        value: &[u8],
        flags: u32,
        exptime: u32,
        cas: u64,
    ) -> Result<CasResult, ProtocolError> {
        self.check_item(key, value)?;
        let header = format!("cas {} {} {} {} {}", key, flags, exptime, value.len(), cas);
        match self.send_storage(&header, value)?.as_str() {
            "STORED" => Ok(CasResult::Stored),
            "EXISTS" => Ok(CasResult::Exists),
            "NOT_FOUND" => Ok(CasResult::NotFound),
            other => Err(unexpected(other)),
        }
    }

    fn delete(&mut self, key: &str) -> Result<bool, ProtocolError> {
        check_key(key)?;
        match self.command(&format!("delete {}", key))?.as_str() {
            "DELETED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    fn incr(&mut self, key: &str, delta: u64) -> Result<Option<u64>, ProtocolError> {
        self.arithmetic("incr", key, delta)
    }

    fn decr(&mut self, key: &str, delta: u64) -> Result<Option<u64>, ProtocolError> {
        self.arithmetic("decr", key, delta)
    }

    fn touch(&mut self, key: &str, exptime: u32) -> Result<bool, ProtocolError> {
        check_key(key)?;
        match self.command(&format!("touch {} {}", key, exptime))?.as_str() {
            "TOUCHED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    fn stats(&mut self) -> Result<HashMap<String, String>, ProtocolError> {
        let mut line = self.command("stats")?;
        let mut stats = HashMap::new();
        while line != "END" {
            let mut parts = line.splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("STAT"), Some(name), Some(value)) => {
                    stats.insert(name.to_string(), value.to_string());
                }
                _ => return Err(unexpected(&line)),
            }
            line = self.read_line()?;
        }
        Ok(stats)
    }

    fn flush_all(&mut self) -> Result<(), ProtocolError> {
        match self.command("flush_all")?.as_str() {
            "OK" => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn version(&mut self) -> Result<String, ProtocolError> {
        let reply = self.command("version")?;
        reply
            .strip_prefix("VERSION ")
            .map(str::to_string)
            .ok_or_else(|| unexpected(&reply))
    }

    fn verbosity(&mut self, level: u32) -> Result<(), ProtocolError> {
        match self.command(&format!("verbosity {}", level))?.as_str() {
            "OK" => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

impl Drop for TextConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect_socket(target: &SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let socket = Socket::new(
        Domain::for_address(*target),
        Type::STREAM,
        Some(SocketProtocol::TCP),
    )?;
    socket.set_keepalive(true)?;
    // Requests are small; do not let Nagle hold them back
    socket.set_nodelay(true)?;
    socket.connect_timeout(&(*target).into(), timeout)?;
    Ok(socket.into())
}

fn check_error_reply(line: String) -> Result<String, ProtocolError> {
    if line == "ERROR" {
        return Err(ProtocolError::UnknownCommand);
    }
    if let Some(msg) = line.strip_prefix("CLIENT_ERROR ") {
        return Err(ProtocolError::Client(msg.to_string()));
    }
    if let Some(msg) = line.strip_prefix("SERVER_ERROR ") {
        return Err(ProtocolError::Server(msg.to_string()));
    }
    Ok(line)
}

fn check_key(key: &str) -> Result<(), ProtocolError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LENGTH
        && !key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control());
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidKey(key.to_string()))
    }
}

fn parse_field<T: FromStr>(token: Option<&str>, line: &str) -> Result<T, ProtocolError> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| unexpected(line))
}

fn unexpected(line: &str) -> ProtocolError {
    ProtocolError::Protocol(format!("unexpected response: {}", line))
}
