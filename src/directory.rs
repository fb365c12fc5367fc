use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use tracing::debug;
use unicase::UniCase;

use crate::error::{ConnectionError, DirectoryError};
use crate::request::{SearchRequest, SearchScope};


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirectoryEntry {
    pub dn: UniCase<String>,
    pub attributes: BTreeMap<UniCase<String>, Vec<Vec<u8>>>,
}
impl DirectoryEntry {
    pub fn new<D: Into<String>>(dn: D) -> Self {
        Self {
            dn: UniCase::new(dn.into()),
            attributes: BTreeMap::new(),
        }
    }

    /// Appends a value, keeping the order in which values were added.
    pub fn push_value<K: Into<String>, V: Into<Vec<u8>>>(&mut self, key: K, value: V) {
        self.attributes
            .entry(UniCase::new(key.into()))
            .or_insert_with(|| Vec::new())
            .push(value.into());
    }

    pub fn with_value<K: Into<String>, V: Into<Vec<u8>>>(mut self, key: K, value: V) -> Self {
        self.push_value(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&[Vec<u8>]> {
        self.attributes
            .get(&UniCase::new(key.to_owned()))
            .map(|values| values.as_slice())
    }

    pub fn first_string(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(key)?
            .first()
            .map(|value| String::from_utf8_lossy(value))
    }

    /// Flattens the entry into plain strings: `dn` plus one key per
    /// attribute. Binary values come out as base64.
    pub fn to_flat_map(&self) -> FlatEntry {
        let mut flat = FlatEntry::new();
        flat.insert("dn".to_owned(), FlatValue::Single(self.dn.to_string()));
        for (key, values) in &self.attributes {
            let mut strings: Vec<String> = values.iter()
                .map(|v| value_to_text(v))
                .collect();
            let flat_value = if strings.len() == 1 {
                FlatValue::Single(strings.remove(0))
            } else {
                FlatValue::Multiple(strings)
            };
            flat.insert(key.to_string(), flat_value);
        }
        flat
    }
}

fn value_to_text(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(s) => s.to_owned(),
        Err(_) => base64::engine::general_purpose::STANDARD.encode(value),
    }
}


#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FlatValue {
    Single(String),
    Multiple(Vec<String>),
}

pub type FlatEntry = BTreeMap<String, FlatValue>;


/// The LDAP result codes this crate distinguishes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResultCode {
    Success,
    SizeLimitExceeded,
    UnwillingToPerform,
    Other(u32),
}
impl From<u32> for ResultCode {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Success,
            4 => Self::SizeLimitExceeded,
            53 => Self::UnwillingToPerform,
            other => Self::Other(other),
        }
    }
}
impl From<ResultCode> for u32 {
    fn from(value: ResultCode) -> Self {
        match value {
            ResultCode::Success => 0,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::Other(other) => other,
        }
    }
}
impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success (0)"),
            Self::SizeLimitExceeded => write!(f, "sizeLimitExceeded (4)"),
            Self::UnwillingToPerform => write!(f, "unwillingToPerform (53)"),
            Self::Other(code) => write!(f, "{}", code),
        }
    }
}


/// Request half of the simple paged results control.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageControl {
    pub size: usize,
    pub cookie: Vec<u8>,
}

/// Response half of the simple paged results control.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PagingResponse {
    pub cookie: Vec<u8>,
    pub estimated_size: Option<usize>,
}


/// One search operation exactly as it goes out on the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchOperation {
    pub base_dn: String,
    pub scope: SearchScope,
    pub filter: String,
    pub attributes: Vec<String>,
    pub size_limit: Option<usize>,
    pub paging: Option<PageControl>,
}
impl SearchOperation {
    pub fn from_request(request: &SearchRequest) -> Self {
        Self {
            base_dn: request.base_dn.clone(),
            scope: request.scope,
            filter: request.filter.clone(),
            attributes: request.attributes.to_wire(),
            size_limit: request.size_limit,
            paging: None,
        }
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_attributes(mut self, attributes: Vec<String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_size_limit(mut self, size_limit: Option<usize>) -> Self {
        self.size_limit = size_limit;
        self
    }

    pub fn with_paging(mut self, size: usize, cookie: Vec<u8>) -> Self {
        self.paging = Some(PageControl { size, cookie });
        self
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchPage {
    pub entries: Vec<DirectoryEntry>,
    pub result_code: ResultCode,
    pub message: String,
    pub paging: Option<PagingResponse>,
}
impl SearchPage {
    /// The cookie for the next page; empty when paging is done or the
    /// server sent no paging control at all.
    pub fn next_cookie(&self) -> &[u8] {
        self.paging
            .as_ref()
            .map(|p| p.cookie.as_slice())
            .unwrap_or(&[])
    }
}


/// A bound connection to a directory server.
#[async_trait]
pub trait Directory: Send {
    /// Runs a single search operation and reports the result code instead of
    /// failing on it; only transport-level problems are errors.
    async fn search(&mut self, operation: &SearchOperation) -> Result<SearchPage, DirectoryError>;

    /// Fetches every page of `operation` using the paged results control.
    ///
    /// Any result code other than success is an error.
    async fn paged_search(&mut self, operation: &SearchOperation, page_size: usize) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let mut entries = Vec::new();
        let mut cookie = Vec::new();
        loop {
            let paged_operation = operation.clone().with_paging(page_size, cookie);
            let page = self.search(&paged_operation).await?;
            if page.result_code != ResultCode::Success {
                return Err(DirectoryError::ResultCode {
                    code: page.result_code,
                    message: page.message,
                });
            }
            let next_cookie = page.next_cookie().to_vec();
            entries.extend(page.entries);
            if next_cookie.is_empty() {
                break;
            }
            cookie = next_cookie;
        }
        Ok(entries)
    }

    async fn unbind(&mut self) -> Result<(), DirectoryError>;
}


/// Hands out freshly bound connections. Authentication lives here.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    type Connection: Directory;

    async fn connect(&self) -> Result<Self::Connection, ConnectionError>;
}


/// One unit of work run against a single scoped connection.
#[async_trait]
pub trait Attempt: Send {
    type Output: Send;

    async fn run<D: Directory>(self, connection: &mut D) -> Self::Output;
}


/// Acquires a connection, runs `attempt` on it and releases it again.
///
/// The connection is unbound whatever the attempt returns; if the attempt
/// panics, dropping the connection closes it.
pub async fn with_connection<P, A>(provider: &P, attempt: A) -> Result<A::Output, ConnectionError>
where
    P: ConnectionProvider + ?Sized,
    A: Attempt,
{
    let mut connection = provider.connect().await?;
    let output = attempt.run(&mut connection).await;
    if let Err(e) = connection.unbind().await {
        debug!(error = %e, "unbind failed; dropping connection anyway");
    }
    Ok(output)
}


#[cfg(test)]
mod tests {
    use super::{DirectoryEntry, FlatValue, ResultCode};

    #[test]
    fn test_case_insensitive_lookup() {
        let entry = DirectoryEntry::new("uid=jdoe,ou=people,dc=example,dc=com")
            .with_value("mail", "jdoe@example.com")
            .with_value("objectClass", "top")
            .with_value("objectClass", "person");
        assert_eq!(entry.first_string("MAIL").unwrap(), "jdoe@example.com");
        assert_eq!(entry.get("objectclass").unwrap().len(), 2);
        assert!(entry.get("cn").is_none());
    }

    #[test]
    fn test_flat_map() {
        let entry = DirectoryEntry::new("uid=jdoe,dc=example,dc=com")
            .with_value("cn", "John Doe")
            .with_value("objectClass", "top")
            .with_value("objectClass", "person")
            .with_value("jpegPhoto", vec![0xFFu8, 0xD8, 0xFF]);
        let flat = entry.to_flat_map();
        assert_eq!(flat["dn"], FlatValue::Single("uid=jdoe,dc=example,dc=com".to_owned()));
        assert_eq!(flat["cn"], FlatValue::Single("John Doe".to_owned()));
        assert_eq!(flat["objectClass"], FlatValue::Multiple(vec!["top".to_owned(), "person".to_owned()]));
        assert_eq!(flat["jpegPhoto"], FlatValue::Single("/9j/".to_owned()));
    }

    #[test]
    fn test_result_codes() {
        assert_eq!(ResultCode::from(0), ResultCode::Success);
        assert_eq!(ResultCode::from(4), ResultCode::SizeLimitExceeded);
        assert_eq!(ResultCode::from(53), ResultCode::UnwillingToPerform);
        assert_eq!(ResultCode::from(32), ResultCode::Other(32));
        assert_eq!(u32::from(ResultCode::Other(32)), 32);
    }
}
