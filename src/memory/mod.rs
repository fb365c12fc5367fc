//! A directory server held in memory.
//!
//! Serves the engine's tests and the offline CLI mode. Besides plain
//! searching it can imitate the size-limit behavior of real servers.

pub mod dn;
pub mod matcher;


use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::directory::{
    ConnectionProvider, Directory, DirectoryEntry, PagingResponse, ResultCode, SearchOperation,
    SearchPage,
};
use crate::error::{ConnectionError, DirectoryError};
use crate::memory::dn::{dn_key, in_scope, Rdn};
use crate::memory::matcher::Filter;


/// Server behaviors to imitate.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerQuirks {
    /// Most entries one unpaged search returns before answering
    /// sizeLimitExceeded.
    pub size_limit: Option<usize>,

    /// Most entries one search operation hands out in total, across all of
    /// its pages.
    pub cumulative_limit: Option<usize>,

    /// Once a paged operation has served this many entries, further pages
    /// are answered with unwillingToPerform.
    pub unwilling_after: Option<usize>,

    /// Paged requests (1-based, counted over the server's lifetime) that
    /// fail with an invalid-state error.
    pub fail_paged_requests: BTreeSet<usize>,

    /// Pretend not to know the paged results control.
    pub ignore_paging: bool,

    /// Serve this page (1-based) of every paged operation a second time,
    /// in answer to the request for the page after it.
    pub resend_page: Option<usize>,

    /// Refuse new connections once this many have been handed out.
    pub connection_limit: Option<usize>,
}


/// What the server has been asked to do so far.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub searches: usize,
    pub paged_searches: usize,
    pub connections_opened: usize,
    pub connections_released: usize,
    pub filters: Vec<String>,
}


#[derive(Debug)]
struct StoredEntry {
    key: Vec<Rdn>,
    entry: DirectoryEntry,
}

/// Paged operations kept open at once; opening another one drops the
/// oldest.
const MAX_OPEN_OPERATIONS: usize = 32;


#[derive(Debug)]
struct PagedOperation {
    matches: Vec<usize>,
    position: usize,
    served: usize,
    pages: usize,
    last_page_start: usize,
    resent: bool,
}

#[derive(Debug, Default)]
struct ServerState {
    stats: Stats,
    operations: BTreeMap<u64, PagedOperation>,
    next_operation: u64,
}


#[derive(Debug)]
pub struct MemoryDirectory {
    entries: Vec<StoredEntry>,
    quirks: ServerQuirks,
    state: Mutex<ServerState>,
}
impl MemoryDirectory {
    /// Entries are served in the order given. Entries with unparseable DNs
    /// are dropped.
    pub fn new(entries: Vec<DirectoryEntry>, quirks: ServerQuirks) -> Self {
        let entries = entries.into_iter()
            .filter_map(|entry| {
                let key = dn_key(&entry.dn)?;
                Some(StoredEntry { key, entry })
            })
            .collect();
        Self {
            entries,
            quirks,
            state: Mutex::new(ServerState::default()),
        }
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn stats(&self) -> Stats {
        self.lock().stats.clone()
    }

    /// Paged operations that were started and neither finished nor
    /// abandoned yet.
    pub fn open_operations(&self) -> usize {
        self.lock().operations.len()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn matching(&self, operation: &SearchOperation) -> Result<Vec<usize>, DirectoryError> {
        let filter = Filter::parse(&operation.filter)
            .map_err(|reason| DirectoryError::InvalidFilter { filter: operation.filter.clone(), reason })?;
        let base = dn_key(&operation.base_dn)
            .ok_or_else(|| DirectoryError::ResultCode {
                code: ResultCode::Other(34),
                message: format!("invalid DN syntax: {:?}", operation.base_dn),
            })?;

        Ok(self.entries.iter()
            .enumerate()
            .filter(|(_, stored)| in_scope(&stored.key, &base, operation.scope))
            .filter(|(_, stored)| filter.matches(&stored.entry))
            .map(|(i, _)| i)
            .collect())
    }

    /// Copies an entry, keeping only the requested attributes.
    fn project(&self, index: usize, attributes: &[String]) -> DirectoryEntry {
        let source = &self.entries[index].entry;
        let all_user = attributes.iter().any(|a| a == "*");
        let none = attributes.iter().all(|a| a == "1.1");
        let mut entry = DirectoryEntry::new(source.dn.to_string());
        if none {
            return entry;
        }
        for (key, values) in &source.attributes {
            if all_user || attributes.iter().any(|a| key.eq_ignore_ascii_case(a)) {
                entry.attributes.insert(key.clone(), values.clone());
            }
        }
        entry
    }

    pub fn search(&self, operation: &SearchOperation) -> Result<SearchPage, DirectoryError> {
        let matches = self.matching(operation)?;
        let mut state = self.lock();
        state.stats.searches += 1;
        state.stats.filters.push(operation.filter.clone());

        match &operation.paging {
            Some(paging) if !self.quirks.ignore_paging => {
                state.stats.paged_searches += 1;
                let request_number = state.stats.paged_searches;
                if self.quirks.fail_paged_requests.contains(&request_number) {
                    debug!(request_number, "injecting paging fault");
                    return Err(DirectoryError::InvalidState("operation state lost".to_owned()));
                }
                self.serve_page(&mut state, operation, paging.size, &paging.cookie, matches)
            },
            _ => Ok(self.serve_unpaged(operation, matches)),
        }
    }

    fn serve_unpaged(&self, operation: &SearchOperation, matches: Vec<usize>) -> SearchPage {
        let limit = [operation.size_limit, self.quirks.size_limit, self.quirks.cumulative_limit]
            .into_iter()
            .flatten()
            .filter(|l| *l > 0)
            .min();
        let (served, result_code) = match limit {
            Some(limit) if matches.len() > limit => (&matches[..limit], ResultCode::SizeLimitExceeded),
            _ => (&matches[..], ResultCode::Success),
        };
        SearchPage {
            entries: served.iter().map(|i| self.project(*i, &operation.attributes)).collect(),
            result_code,
            message: String::new(),
            paging: None,
        }
    }

    fn serve_page(&self, state: &mut ServerState, operation: &SearchOperation, page_size: usize, cookie: &[u8], matches: Vec<usize>) -> Result<SearchPage, DirectoryError> {
        let id = if cookie.is_empty() {
            while state.operations.len() >= MAX_OPEN_OPERATIONS {
                if let Some((evicted, _)) = state.operations.pop_first() {
                    debug!(operation = evicted, "dropping oldest open paged operation");
                }
            }
            let id = state.next_operation;
            state.next_operation += 1;
            state.operations.insert(id, PagedOperation {
                matches,
                position: 0,
                served: 0,
                pages: 0,
                last_page_start: 0,
                resent: false,
            });
            id
        } else {
            let id_bytes: [u8; 8] = cookie.try_into()
                .map_err(|_| DirectoryError::InvalidState("malformed cookie".to_owned()))?;
            let id = u64::from_be_bytes(id_bytes);
            if !state.operations.contains_key(&id) {
                return Err(DirectoryError::InvalidState("unknown cookie".to_owned()));
            }
            id
        };

        // a page size of zero abandons the operation
        if page_size == 0 {
            state.operations.remove(&id);
            return Ok(SearchPage {
                entries: Vec::new(),
                result_code: ResultCode::Success,
                message: String::new(),
                paging: Some(PagingResponse::default()),
            });
        }

        let Some(paged) = state.operations.get_mut(&id) else {
            return Err(DirectoryError::InvalidState("unknown cookie".to_owned()));
        };
        if !paged.resent && paged.pages > 0 && self.quirks.resend_page == Some(paged.pages) {
            debug!(operation = id, page = paged.pages, "resending page");
            paged.resent = true;
            paged.served -= paged.position - paged.last_page_start;
            paged.position = paged.last_page_start;
        }
        let remaining = paged.matches.len() - paged.position;
        let mut count = page_size.min(remaining);
        let mut result_code = ResultCode::Success;
        if let Some(limit) = self.quirks.cumulative_limit {
            let allowance = limit.saturating_sub(paged.served);
            if count > allowance {
                count = allowance;
                result_code = ResultCode::SizeLimitExceeded;
            }
        }
        if let Some(ceiling) = self.quirks.unwilling_after {
            if paged.served >= ceiling {
                count = 0;
                result_code = ResultCode::UnwillingToPerform;
            }
        }

        let indices = paged.matches[paged.position..paged.position+count].to_vec();
        paged.last_page_start = paged.position;
        paged.pages += 1;
        paged.position += count;
        paged.served += count;
        let estimated_size = paged.matches.len();
        let finished = result_code != ResultCode::Success || paged.position >= paged.matches.len();
        if finished {
            state.operations.remove(&id);
        }

        Ok(SearchPage {
            entries: indices.into_iter().map(|i| self.project(i, &operation.attributes)).collect(),
            result_code,
            message: String::new(),
            paging: Some(PagingResponse {
                cookie: if finished { Vec::new() } else { id.to_be_bytes().to_vec() },
                estimated_size: Some(estimated_size),
            }),
        })
    }
}


/// A connection to a [`MemoryDirectory`].
#[derive(Debug)]
pub struct MemoryConnection {
    directory: Arc<MemoryDirectory>,
    open: bool,
}
#[async_trait]
impl Directory for MemoryConnection {
    async fn search(&mut self, operation: &SearchOperation) -> Result<SearchPage, DirectoryError> {
        if !self.open {
            return Err(DirectoryError::Closed);
        }
        self.directory.search(operation)
    }

    async fn unbind(&mut self) -> Result<(), DirectoryError> {
        if !self.open {
            return Err(DirectoryError::Closed);
        }
        self.open = false;
        self.directory.lock().stats.connections_released += 1;
        Ok(())
    }
}


/// Hands out connections to a shared [`MemoryDirectory`].
#[derive(Clone, Debug)]
pub struct MemoryProvider {
    directory: Arc<MemoryDirectory>,
}
impl MemoryProvider {
    pub fn new(directory: MemoryDirectory) -> Self {
        Self { directory: Arc::new(directory) }
    }

    pub fn directory(&self) -> &MemoryDirectory { &self.directory }
}
#[async_trait]
impl ConnectionProvider for MemoryProvider {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<Self::Connection, ConnectionError> {
        let mut state = self.directory.lock();
        if let Some(limit) = self.directory.quirks.connection_limit {
            if state.stats.connections_opened >= limit {
                return Err(ConnectionError::Unavailable(format!("connection limit of {} reached", limit)));
            }
        }
        state.stats.connections_opened += 1;
        Ok(MemoryConnection {
            directory: Arc::clone(&self.directory),
            open: true,
        })
    }
}
