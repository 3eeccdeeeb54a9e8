use std::fmt;
use std::str::FromStr;

/// Port memcached listens on when an address omits one
pub const DEFAULT_PORT: u16 = 11211;

/// Identifier of a single cache server (e.g., "cache-1.internal:11211")
///
/// Addresses are compared and hashed by their textual value; no DNS lookup
/// happens until a connection is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

/// Error returned when an address string cannot be used
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Server address is empty")]
    Empty,

    #[error("Invalid port in server address: {0}")]
    InvalidPort(String),
}

impl Address {
    /// Create an address from a host and port
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", host, port))
    }

    /// The `host:port` form of this address
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        // Bracketed IPv6 literals carry colons of their own
        let port_sep = if s.starts_with('[') {
            s.rfind("]:").map(|idx| idx + 1)
        } else if s.matches(':').count() == 1 {
            s.rfind(':')
        } else {
            None
        };

        match port_sep {
            Some(idx) => {
                let port = &s[idx + 1..];
                port.parse::<u16>()
                    .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
                if idx == 0 {
                    return Err(AddressError::Empty);
                }
                Ok(Self(s.to_string()))
            }
            None => Ok(Self(format!("{}:{}", s, DEFAULT_PORT))),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Parse a list of server strings, failing on the first bad entry
pub fn parse_addresses<I, S>(servers: I) -> Result<Vec<Address>, AddressError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    servers
        .into_iter()
        .map(|s| s.as_ref().parse())
        .collect()
}
