//! Shared fixtures for the integration tests
//!
//! - [`MockConnector`]: in-memory connections with scripted failures
//! - [`FakeServer`]: a memcached text protocol server on a local port

#![allow(dead_code)]

use bytes::Bytes;
use memcpool::lb::Address;
use memcpool::protocol::{CasResult, Connection, Connector, Item, ProtocolError, StoreMode};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Scripted result of one connection attempt, consumed in order
#[derive(Debug, Clone, Copy)]
pub enum ConnectOutcome {
    /// Fails with an I/O error that says nothing about reachability
    PermissionDenied,
    /// The client object is unusable and must not be connected again
    InvalidState,
    /// The socket comes up but the client reports it was already connected
    AlreadyConnected,
}

/// State shared by a [`MockConnector`] and every connection it built
#[derive(Default)]
pub struct MockState {
    refused: Mutex<HashSet<Address>>,
    connects: Mutex<Vec<Address>>,
    connect_script: Mutex<VecDeque<ConnectOutcome>>,
    clients_built: AtomicUsize,
    data: Mutex<HashMap<String, Item>>,
    fail_ops: AtomicUsize,
    server_error_ops: AtomicUsize,
    raise_not_found: AtomicBool,
    op_calls: AtomicUsize,
}

impl MockState {
    /// Make connection attempts to `addr` fail with `ConnectionRefused`
    pub fn refuse(&self, addr: &Address) {
        self.refused.lock().unwrap().insert(addr.clone());
    }

    pub fn accept(&self, addr: &Address) {
        self.refused.lock().unwrap().remove(addr);
    }

    /// Every connection attempt so far, refused ones included
    pub fn connect_attempts(&self) -> Vec<Address> {
        self.connects.lock().unwrap().clone()
    }

    pub fn attempts_to(&self, addr: &Address) -> usize {
        self.connects.lock().unwrap().iter().filter(|a| *a == addr).count()
    }

    /// Queue outcomes for the next connection attempts, whatever the address
    pub fn script_connects(&self, outcomes: &[ConnectOutcome]) {
        self.connect_script.lock().unwrap().extend(outcomes.iter().copied());
    }

    /// Client objects created by the connector so far
    pub fn clients_built(&self) -> usize {
        self.clients_built.load(Ordering::SeqCst)
    }

    /// Report missing counters as `KeyNotFound` errors instead of `None`
    pub fn raise_not_found(&self, raise: bool) {
        self.raise_not_found.store(raise, Ordering::SeqCst);
    }

    /// The next `n` operations drop the connection with a reset
    pub fn fail_next_ops(&self, n: usize) {
        self.fail_ops.store(n, Ordering::SeqCst);
    }

    /// The next `n` operations get a `SERVER_ERROR` reply
    pub fn server_error_next_ops(&self, n: usize) {
        self.server_error_ops.store(n, Ordering::SeqCst);
    }

    /// Operations that reached a connected client
    pub fn op_calls(&self) -> usize {
        self.op_calls.load(Ordering::SeqCst)
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), Item::new(value.as_bytes().to_vec(), 0));
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Clone, Default)]
pub struct MockConnector {
    pub state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connector for MockConnector {
    type Conn = MockConnection;

    fn client(&self, addr: &Address) -> MockConnection {
        self.state.clients_built.fetch_add(1, Ordering::SeqCst);
        MockConnection {
            addr: addr.clone(),
            state: Arc::clone(&self.state),
            connected: false,
            invalid: false,
        }
    }
}

pub struct MockConnection {
    addr: Address,
    state: Arc<MockState>,
    connected: bool,
    invalid: bool,
}

impl MockConnection {
    fn begin(&mut self) -> Result<(), ProtocolError> {
        if !self.connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.state.op_calls.fetch_add(1, Ordering::SeqCst);

        if take_one(&self.state.fail_ops) {
            self.connected = false;
            return Err(io::Error::from(io::ErrorKind::ConnectionReset).into());
        }
        if take_one(&self.state.server_error_ops) {
            return Err(ProtocolError::Server("out of memory".to_string()));
        }
        Ok(())
    }

    fn data(&self) -> std::sync::MutexGuard<'_, HashMap<String, Item>> {
        self.state.data.lock().unwrap()
    }

    fn arithmetic(&mut self, key: &str, apply: impl Fn(u64) -> u64) -> Result<Option<u64>, ProtocolError> {
        self.begin()?;
        let mut data = self.data();
        let Some(item) = data.get_mut(key) else {
            if self.state.raise_not_found.load(Ordering::SeqCst) {
                return Err(ProtocolError::KeyNotFound(key.to_string()));
            }
            return Ok(None);
        };
        let current: u64 = std::str::from_utf8(&item.value)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ProtocolError::Client("non-numeric value".to_string()))?;
        let next = apply(current);
        item.value = Bytes::from(next.to_string());
        Ok(Some(next))
    }
}

impl Connection for MockConnection {
    fn address(&self) -> &Address {
        &self.addr
    }

    fn connect(&mut self, _timeout: Duration) -> Result<(), ProtocolError> {
        if self.connected {
            return Err(ProtocolError::AlreadyConnected);
        }
        // A client that reported an invalid state must be replaced, never reused
        assert!(!self.invalid, "connect called on a client left in an invalid state");

        self.state.connects.lock().unwrap().push(self.addr.clone());
        if self.state.refused.lock().unwrap().contains(&self.addr) {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }

        let scripted = self.state.connect_script.lock().unwrap().pop_front();
        match scripted {
            Some(ConnectOutcome::PermissionDenied) => {
                Err(io::Error::from(io::ErrorKind::PermissionDenied).into())
            }
            Some(ConnectOutcome::InvalidState) => {
                self.invalid = true;
                Err(ProtocolError::InvalidState)
            }
            Some(ConnectOutcome::AlreadyConnected) => {
                self.connected = true;
                Err(ProtocolError::AlreadyConnected)
            }
            None => {
                self.connected = true;
                Ok(())
            }
        }
    }

    fn close(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn get(&mut self, key: &str) -> Result<Option<Item>, ProtocolError> {
        self.begin()?;
        Ok(self.data().get(key).cloned())
    }

    fn gets(&mut self, key: &str) -> Result<Option<Item>, ProtocolError> {
        self.begin()?;
        Ok(self.data().get(key).cloned().map(|item| Item {
            cas: Some(1),
            ..item
        }))
    }

    fn get_multi(&mut self, keys: &[&str]) -> Result<HashMap<String, Item>, ProtocolError> {
        self.begin()?;
        let data = self.data();
        Ok(keys
            .iter()
            .filter_map(|key| data.get(*key).map(|item| (key.to_string(), item.clone())))
            .collect())
    }

    fn store(
        &mut self,
        mode: StoreMode,
        key: &str,
        value: &[u8],
        flags: u32,
        _exptime: u32,
    ) -> Result<bool, ProtocolError> {
        self.begin()?;
        let mut data = self.data();
        let exists = data.contains_key(key);
        match mode {
            StoreMode::Add if exists => return Ok(false),
            StoreMode::Replace | StoreMode::Append | StoreMode::Prepend if !exists => {
                return Ok(false)
            }
            _ => {}
        }

        let value = match (mode, data.get(key)) {
            (StoreMode::Append, Some(old)) => [old.value.as_ref(), value].concat(),
            (StoreMode::Prepend, Some(old)) => [value, old.value.as_ref()].concat(),
            _ => value.to_vec(),
        };
        data.insert(key.to_string(), Item::new(value, flags));
        Ok(true)
    }

    fn cas(
        &mut self,
        key: &str,
        value: &[u8],
        flags: u32,
        _exptime: u32,
        cas: u64,
    ) -> Result<CasResult, ProtocolError> {
        self.begin()?;
        let mut data = self.data();
        if !data.contains_key(key) {
            return Ok(CasResult::NotFound);
        }
        if cas != 1 {
            return Ok(CasResult::Exists);
        }
        data.insert(key.to_string(), Item::new(value.to_vec(), flags));
        Ok(CasResult::Stored)
    }

    fn delete(&mut self, key: &str) -> Result<bool, ProtocolError> {
        self.begin()?;
        Ok(self.data().remove(key).is_some())
    }

    fn incr(&mut self, key: &str, delta: u64) -> Result<Option<u64>, ProtocolError> {
        self.arithmetic(key, |n| n.wrapping_add(delta))
    }

    fn decr(&mut self, key: &str, delta: u64) -> Result<Option<u64>, ProtocolError> {
        self.arithmetic(key, |n| n.saturating_sub(delta))
    }

    fn touch(&mut self, key: &str, _exptime: u32) -> Result<bool, ProtocolError> {
        self.begin()?;
        Ok(self.data().contains_key(key))
    }

    fn stats(&mut self) -> Result<HashMap<String, String>, ProtocolError> {
        self.begin()?;
        let items = self.data().len().to_string();
        Ok(HashMap::from([("curr_items".to_string(), items)]))
    }

    fn flush_all(&mut self) -> Result<(), ProtocolError> {
        self.begin()?;
        self.data().clear();
        Ok(())
    }

    fn version(&mut self) -> Result<String, ProtocolError> {
        self.begin()?;
        Ok("mock".to_string())
    }

    fn verbosity(&mut self, _level: u32) -> Result<(), ProtocolError> {
        self.begin()
    }
}

/// Address on which nothing is listening
pub fn closed_port() -> Address {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Address::new("127.0.0.1", port)
}

struct StoredValue {
    data: Vec<u8>,
    flags: u32,
    cas: u64,
}

type Store = Arc<Mutex<HashMap<String, StoredValue>>>;

static NEXT_CAS: AtomicU64 = AtomicU64::new(1);

/// In-process memcached speaking the text protocol
///
/// Expiry times are accepted but ignored.
pub struct FakeServer {
    addr: Address,
    streams: Arc<Mutex<Vec<TcpStream>>>,
    accepted: Arc<AtomicUsize>,
}

impl FakeServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let store: Store = Arc::default();
        let streams: Arc<Mutex<Vec<TcpStream>>> = Arc::default();
        let accepted = Arc::new(AtomicUsize::new(0));

        {
            let streams = Arc::clone(&streams);
            let accepted = Arc::clone(&accepted);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { continue };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    if let Ok(clone) = stream.try_clone() {
                        streams.lock().unwrap().push(clone);
                    }
                    let store = Arc::clone(&store);
                    thread::spawn(move || {
                        let _ = serve(stream, store);
                    });
                }
            });
        }

        Self {
            addr: Address::new("127.0.0.1", port),
            streams,
            accepted,
        }
    }

    pub fn address(&self) -> Address {
        self.addr.clone()
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Close every open client connection from the server side
    pub fn sever_all(&self) {
        for stream in self.streams.lock().unwrap().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn serve(stream: TcpStream, store: Store) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let parts: Vec<&str> = line.trim_end().split(' ').collect();
        let reply = match parts[0] {
            "get" | "gets" => retrieve(&store, &parts[1..], parts[0] == "gets"),
            "set" | "add" | "replace" | "append" | "prepend" | "cas" => {
                let len: usize = parts.get(4).and_then(|s| s.parse().ok()).unwrap_or(0);
                let mut data = vec![0u8; len + 2];
                reader.read_exact(&mut data)?;
                data.truncate(len);
                storage(&store, &parts, data)
            }
            "delete" => match store.lock().unwrap().remove(parts[1]) {
                Some(_) => b"DELETED\r\n".to_vec(),
                None => b"NOT_FOUND\r\n".to_vec(),
            },
            "incr" | "decr" => arithmetic(&store, &parts),
            "touch" => match store.lock().unwrap().contains_key(parts[1]) {
                true => b"TOUCHED\r\n".to_vec(),
                false => b"NOT_FOUND\r\n".to_vec(),
            },
            "stats" => {
                let items = store.lock().unwrap().len();
                format!("STAT pid 1\r\nSTAT curr_items {}\r\nSTAT limit_maxbytes 67108864\r\nEND\r\n", items)
                    .into_bytes()
            }
            "flush_all" => {
                store.lock().unwrap().clear();
                b"OK\r\n".to_vec()
            }
            "version" => b"VERSION 1.6.21\r\n".to_vec(),
            "verbosity" => b"OK\r\n".to_vec(),
            _ => b"ERROR\r\n".to_vec(),
        };
        writer.write_all(&reply)?;
    }
}

fn retrieve(store: &Store, keys: &[&str], with_cas: bool) -> Vec<u8> {
    let store = store.lock().unwrap();
    let mut out = Vec::new();
    for key in keys {
        if let Some(value) = store.get(*key) {
            let header = if with_cas {
                format!("VALUE {} {} {} {}\r\n", key, value.flags, value.data.len(), value.cas)
            } else {
                format!("VALUE {} {} {}\r\n", key, value.flags, value.data.len())
            };
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(&value.data);
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b"END\r\n");
    out
}

fn storage(store: &Store, parts: &[&str], data: Vec<u8>) -> Vec<u8> {
    let (command, key) = (parts[0], parts[1].to_string());
    let flags: u32 = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
    let mut store = store.lock().unwrap();
    let cas = NEXT_CAS.fetch_add(1, Ordering::SeqCst);

    let data = match (command, store.get(&key)) {
        ("add", Some(_)) => return b"NOT_STORED\r\n".to_vec(),
        ("replace" | "append" | "prepend", None) => return b"NOT_STORED\r\n".to_vec(),
        ("cas", None) => return b"NOT_FOUND\r\n".to_vec(),
        ("cas", Some(old)) if parts.get(5).and_then(|s| s.parse().ok()) != Some(old.cas) => {
            return b"EXISTS\r\n".to_vec()
        }
        ("append", Some(old)) => [old.data.as_slice(), data.as_slice()].concat(),
        ("prepend", Some(old)) => [data.as_slice(), old.data.as_slice()].concat(),
        _ => data,
    };

    store.insert(key, StoredValue { data, flags, cas });
    b"STORED\r\n".to_vec()
}

fn arithmetic(store: &Store, parts: &[&str]) -> Vec<u8> {
    let delta: u64 = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
    let mut store = store.lock().unwrap();
    let Some(value) = store.get_mut(parts[1]) else {
        return b"NOT_FOUND\r\n".to_vec();
    };
    let Some(current) = std::str::from_utf8(&value.data).ok().and_then(|s| s.parse::<u64>().ok()) else {
        return b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec();
    };

    let next = if parts[0] == "incr" {
        current.wrapping_add(delta)
    } else {
        current.saturating_sub(delta)
    };
    value.data = next.to_string().into_bytes();
    format!("{}\r\n", next).into_bytes()
}
