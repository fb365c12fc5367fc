//! The search dispatcher.
//!
//! A search starts with a plain probe. If the probe looks cut off by a
//! server size limit, the engine pages through the result instead, falling
//! back from the paged-search helper to hand-driven cookie paging and
//! finally to filter-based range chunking.

pub mod chunking;
pub mod paging;



use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::dedup::{merge, Deduplicator};
use crate::directory::{
    with_connection, Attempt, ConnectionProvider, Directory, DirectoryEntry, FlatEntry, ResultCode,
    SearchOperation, SearchPage,
};
use crate::engine::chunking::RangeChunking;
use crate::engine::paging::{CookiePaging, StandardPaging};
use crate::error::{ConnectionError, DirectoryError, SearchError};
use crate::filter::detect_sort_attribute;
use crate::request::SearchRequest;
use crate::truncation::looks_truncated;


/// How a single pagination strategy ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Everything the server holds was collected.
    Success,

    /// The strategy could not continue; the next one may.
    RecoverableFault(String),

    /// An iteration ceiling or a stuck boundary ended the strategy.
    SafetyLimitHit(String),

    /// The server refused to go further in a way no strategy gets around.
    HardStop(String),
}


struct Probe<'a> {
    operation: &'a SearchOperation,
}
#[async_trait]
impl<'a> Attempt for Probe<'a> {
    type Output = Result<SearchPage, DirectoryError>;

    async fn run<D: Directory>(self, connection: &mut D) -> Self::Output {
        connection.search(self.operation).await
    }
}


pub struct SearchEngine<P> {
    provider: P,
    config: EngineConfig,
}
impl<P: ConnectionProvider> SearchEngine<P> {
    pub fn new(provider: P, config: EngineConfig) -> Self {
        Self { provider, config }
    }

    pub fn provider(&self) -> &P { &self.provider }

    pub fn config(&self) -> &EngineConfig { &self.config }

    /// Runs `request` and returns every matching entry, each DN once.
    ///
    /// When a search had to stop early, the entries collected until then are
    /// returned inside [`SearchError::PartialResult`].
    #[instrument(skip(self, request), fields(base = %request.base_dn, filter = %request.filter))]
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>, SearchError> {
        request.validate()?;

        let forced = request.use_pagination && request.page_size.is_some();
        let probe_entries = if forced {
            info!("page size given; paging without probing");
            Vec::new()
        } else {
            let operation = SearchOperation::from_request(request);
            let page = with_connection(&self.provider, Probe { operation: &operation })
                .await?
                .map_err(SearchError::Probe)?;

            let count = page.entries.len();
            let truncated = match page.result_code {
                ResultCode::Success => looks_truncated(count, &self.config),
                ResultCode::SizeLimitExceeded => request.size_limit.is_none() || looks_truncated(count, &self.config),
                code => {
                    let reason = format!("initial search answered with {}: {}", code, page.message);
                    if page.entries.is_empty() {
                        return Err(SearchError::Probe(DirectoryError::ResultCode { code, message: page.message }));
                    }
                    warn!(count, %reason, "returning partial result");
                    return Err(SearchError::PartialResult { reason, entries: page.entries });
                },
            };

            if !request.use_pagination || request.size_limit.is_some() || !truncated {
                info!(count, "probe result is complete");
                return Ok(apply_size_limit(page.entries, request.size_limit));
            }
            info!(count, code = %page.result_code, "probe result looks truncated; paging");
            page.entries
        };

        let mut collected = Deduplicator::new();
        let result = self.paginate(request, &mut collected).await;
        self.finish(request, collected, result, probe_entries)
    }

    /// Like [`search`](Self::search), with every entry flattened to plain
    /// key/value pairs. Salvaged entries of a partial result stay available
    /// through [`SearchError::flat_entries`].
    pub async fn search_as_maps(&self, request: &SearchRequest) -> Result<Vec<FlatEntry>, SearchError> {
        let entries = self.search(request).await?;
        Ok(entries.iter().map(|entry| entry.to_flat_map()).collect())
    }

    /// Runs the strategies in order until one of them does not ask for a
    /// fallback. Each strategy gets a fresh connection.
    async fn paginate(&self, request: &SearchRequest, collected: &mut Deduplicator) -> Result<Outcome, ConnectionError> {
        let page_size = request.page_size.unwrap_or(self.config.default_page_size);
        let operation = SearchOperation::from_request(request).with_size_limit(None);

        info!(strategy = "standard", page_size, "starting paged search");
        let outcome = with_connection(&self.provider, StandardPaging {
            operation: &operation,
            page_size,
            collected: &mut *collected,
        }).await?;
        let reason = match outcome {
            Outcome::RecoverableFault(reason) => reason,
            other => return Ok(other),
        };

        warn!(%reason, collected = collected.len(), "falling back to cookie paging");
        let outcome = with_connection(&self.provider, CookiePaging {
            operation: &operation,
            page_size,
            max_pages: self.config.max_pages,
            chunking_threshold: self.config.chunking_threshold,
            size_limit: request.size_limit,
            collected: &mut *collected,
        }).await?;
        let reason = match outcome {
            Outcome::RecoverableFault(reason) => reason,
            other => return Ok(other),
        };

        let sort_attribute = detect_sort_attribute(&request.filter, &self.config);
        warn!(%reason, %sort_attribute, collected = collected.len(), "falling back to range chunking");
        with_connection(&self.provider, RangeChunking {
            request,
            sort_attribute: &sort_attribute,
            chunk_size: self.config.chunk_size,
            max_chunks: self.config.max_chunks,
            collected: &mut *collected,
        }).await
    }

    fn finish(
        &self,
        request: &SearchRequest,
        collected: Deduplicator,
        result: Result<Outcome, ConnectionError>,
        probe_entries: Vec<DirectoryEntry>,
    ) -> Result<Vec<DirectoryEntry>, SearchError> {
        let nothing_collected = collected.is_empty() && probe_entries.is_empty();
        let reason = match result {
            Ok(Outcome::Success) => {
                return Ok(apply_size_limit(collected.into_entries(), request.size_limit));
            },
            Ok(Outcome::RecoverableFault(reason)) if nothing_collected => {
                return Err(SearchError::ExhaustedFallback { reason });
            },
            Err(e) if nothing_collected => {
                return Err(SearchError::Connection(e));
            },
            Ok(Outcome::RecoverableFault(reason))
                |Ok(Outcome::SafetyLimitHit(reason))
                |Ok(Outcome::HardStop(reason)) => reason,
            Err(e) => format!("no connection for the next strategy: {}", e),
        };

        if nothing_collected {
            info!(%reason, "search stopped without finding anything");
            return Ok(Vec::new());
        }

        let entries = merge([collected.into_entries(), probe_entries]);
        if request.size_limit.is_some_and(|limit| entries.len() >= limit) {
            info!(%reason, "search stopped early but the size limit is met");
            return Ok(apply_size_limit(entries, request.size_limit));
        }
        warn!(%reason, collected = entries.len(), "returning partial result");
        Err(SearchError::PartialResult { reason, entries })
    }
}


fn apply_size_limit(mut entries: Vec<DirectoryEntry>, size_limit: Option<usize>) -> Vec<DirectoryEntry> {
    if let Some(limit) = size_limit {
        entries.truncate(limit);
    }
    entries
}
