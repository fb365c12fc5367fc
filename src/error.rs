use std::io;

use ldap3::LdapError;
use thiserror::Error;

use crate::directory::{DirectoryEntry, FlatEntry, ResultCode};


/// The connection provider could not hand out a bound connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {uri}")]
    Connect {
        uri: String,
        #[source]
        source: LdapError,
    },

    #[error("bind as {bind_dn:?} failed with code {code}: {message}")]
    Bind {
        bind_dn: String,
        code: ResultCode,
        message: String,
    },

    #[error("LDAP error: {0}")]
    Ldap(#[from] LdapError),

    #[error("directory unavailable: {0}")]
    Unavailable(String),
}


/// A single operation on an established connection failed.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("LDAP error: {0}")]
    Ldap(#[from] LdapError),

    #[error("server answered with code {code}: {message}")]
    ResultCode {
        code: ResultCode,
        message: String,
    },

    #[error("invalid paging state: {0}")]
    InvalidState(String),

    #[error("invalid filter {filter:?}: {reason}")]
    InvalidFilter {
        filter: String,
        reason: String,
    },

    #[error("connection already closed")]
    Closed,
}


#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}


/// What a caller of the search engine can observe.
///
/// Strategy-local faults never show up here; they are absorbed by falling
/// back to the next strategy.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("no connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error("invalid search request: {0}")]
    InvalidRequest(String),

    #[error("initial search failed: {0}")]
    Probe(#[source] DirectoryError),

    /// Something went wrong after entries had already been collected. The
    /// entries are handed back instead of being dropped.
    #[error("incomplete result ({} entries collected): {reason}", .entries.len())]
    PartialResult {
        reason: String,
        entries: Vec<DirectoryEntry>,
    },

    #[error("all search strategies failed: {reason}")]
    ExhaustedFallback {
        reason: String,
    },
}
impl SearchError {
    pub fn entries(&self) -> &[DirectoryEntry] {
        match self {
            Self::PartialResult { entries, .. } => entries,
            _ => &[],
        }
    }

    pub fn into_entries(self) -> Vec<DirectoryEntry> {
        match self {
            Self::PartialResult { entries, .. } => entries,
            _ => Vec::new(),
        }
    }

    /// The salvaged entries, flattened like [`DirectoryEntry::to_flat_map`].
    pub fn flat_entries(&self) -> Vec<FlatEntry> {
        self.entries()
            .iter()
            .map(|entry| entry.to_flat_map())
            .collect()
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Self::PartialResult { .. })
    }
}
