use std::fmt;

/// Operations a cache connection understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Gets,
    GetMulti,
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Delete,
    Cas,
    Incr,
    Decr,
    Touch,
    Stats,
    FlushAll,
    Version,
    Verbosity,
}

/// Verbs re-issued automatically after a transport failure and reconnect.
///
/// `Incr`, `Decr`, `Append` and `Prepend` are not idempotent. If the first
/// request reached the server before the connection dropped, the retry
/// applies the mutation a second time.
const RETRYABLE: &[Verb] = &[
    Verb::Get,
    Verb::Gets,
    Verb::GetMulti,
    Verb::Set,
    Verb::Add,
    Verb::Replace,
    Verb::Append,
    Verb::Prepend,
    Verb::Delete,
    Verb::Cas,
    Verb::Incr,
    Verb::Decr,
    Verb::Stats,
    Verb::FlushAll,
    Verb::Version,
];

impl Verb {
    /// Whether a failed call may be retried on a rebuilt connection
    pub fn is_retryable(self) -> bool {
        RETRYABLE.contains(&self)
    }

    /// Operation name, as used in logs
    pub fn name(self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Gets => "gets",
            Verb::GetMulti => "get_multi",
            Verb::Set => "set",
            Verb::Add => "add",
            Verb::Replace => "replace",
            Verb::Append => "append",
            Verb::Prepend => "prepend",
            Verb::Delete => "delete",
            Verb::Cas => "cas",
            Verb::Incr => "incr",
            Verb::Decr => "decr",
            Verb::Touch => "touch",
            Verb::Stats => "stats",
            Verb::FlushAll => "flush_all",
            Verb::Version => "version",
            Verb::Verbosity => "verbosity",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The storage commands, which share one request shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl StoreMode {
    /// Command keyword on the wire
    pub fn command(self) -> &'static str {
        match self {
            StoreMode::Set => "set",
            StoreMode::Add => "add",
            StoreMode::Replace => "replace",
            StoreMode::Append => "append",
            StoreMode::Prepend => "prepend",
        }
    }

    pub fn verb(self) -> Verb {
        match self {
            StoreMode::Set => Verb::Set,
            StoreMode::Add => Verb::Add,
            StoreMode::Replace => Verb::Replace,
            StoreMode::Append => Verb::Append,
            StoreMode::Prepend => Verb::Prepend,
        }
    }
}
