//! Crate-local error type, bridged into Pingora's boxed error.
//!
//! Internal helpers return `RouterResult<T>`; the `ProxyHttp` hooks need
//! `Result<_, Box<pingora::Error>>`. Orphan rules forbid `From` impls in
//! the pingora direction for foreign sources, so conversion goes through
//! the explicit `into_pg()` helper.

use std::{error::Error as StdError, fmt, io, sync::Arc};

use pingora_core::{Error as PgError, ErrorType};

#[derive(Debug)]
pub enum RouterError {
    Io(Arc<io::Error>),
    Config(String),
    Http(String),
    Other(String),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::Io(e) => write!(f, "I/O: {e}"),
            RouterError::Config(s) => write!(f, "config: {s}"),
            RouterError::Http(s) => write!(f, "http: {s}"),
            RouterError::Other(s) => write!(f, "{s}"),
        }
    }
}

impl StdError for RouterError {}

impl From<io::Error> for RouterError {
    fn from(e: io::Error) -> Self {
        RouterError::Io(Arc::new(e))
    }
}

impl From<String> for RouterError {
    fn from(s: String) -> Self {
        RouterError::Other(s)
    }
}

impl From<&str> for RouterError {
    fn from(s: &str) -> Self {
        RouterError::Other(s.to_owned())
    }
}

impl RouterError {
    /// Convert into Pingora's boxed error, tagged internal with the full
    /// display string attached as context.
    pub fn into_pg(self) -> Box<PgError> {
        PgError::because(ErrorType::InternalError, self.to_string(), self)
    }
}

pub type RouterResult<T> = std::result::Result<T, RouterError>;
