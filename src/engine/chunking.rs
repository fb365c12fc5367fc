use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::dedup::Deduplicator;
use crate::directory::{Attempt, Directory, ResultCode, SearchOperation};
use crate::engine::Outcome;
use crate::filter::add_range_constraint;
use crate::request::SearchRequest;


#[derive(Debug, Default)]
struct ChunkState {
    last_boundary_value: Option<String>,
    chunk_number: usize,
}


/// Independent searches, each narrowed with `sort_attribute >= boundary`
/// where the boundary is the sort value of the previous chunk's last entry.
///
/// For servers whose size limit covers a whole operation, so that paging
/// cannot get past it. Stops early once the request's size limit is met.
pub struct RangeChunking<'a> {
    pub request: &'a SearchRequest,
    pub sort_attribute: &'a str,
    pub chunk_size: usize,
    pub max_chunks: usize,
    pub collected: &'a mut Deduplicator,
}
#[async_trait]
impl<'a> Attempt for RangeChunking<'a> {
    type Output = Outcome;

    async fn run<D: Directory>(self, connection: &mut D) -> Outcome {
        // without the sort attribute there is no boundary to continue from
        let attributes = self.request.attributes.to_wire_including(self.sort_attribute);
        let chunk_operation = SearchOperation::from_request(self.request)
            .with_attributes(attributes)
            .with_size_limit(Some(self.chunk_size));

        let mut state = ChunkState::default();
        loop {
            if state.chunk_number >= self.max_chunks {
                warn!(strategy = "chunking", chunks = state.chunk_number, collected = self.collected.len(), "chunk ceiling reached");
                return Outcome::SafetyLimitHit(format!("gave up after {} chunks", state.chunk_number));
            }
            state.chunk_number += 1;

            let filter = match &state.last_boundary_value {
                None => self.request.filter.clone(),
                Some(boundary) => add_range_constraint(&self.request.filter, self.sort_attribute, boundary, false),
            };
            let operation = chunk_operation.clone().with_filter(filter);
            let page = match connection.search(&operation).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(strategy = "chunking", chunk = state.chunk_number, error = %e, "chunk search failed");
                    return Outcome::RecoverableFault(format!("chunk {} failed: {}", state.chunk_number, e));
                },
            };
            match page.result_code {
                ResultCode::Success|ResultCode::SizeLimitExceeded => {},
                code => {
                    return Outcome::HardStop(format!("server answered chunk {} with {}: {}", state.chunk_number, code, page.message));
                },
            }

            let received = page.entries.len();
            let boundary = page.entries
                .last()
                .and_then(|entry| entry.first_string(self.sort_attribute))
                .map(|value| value.into_owned());
            let added = self.collected.extend(page.entries);
            debug!(
                strategy = "chunking",
                chunk = state.chunk_number,
                boundary = ?state.last_boundary_value,
                received,
                added,
                "received chunk"
            );

            if self.request.size_limit.is_some_and(|limit| self.collected.len() >= limit) {
                info!(strategy = "chunking", chunks = state.chunk_number, collected = self.collected.len(), "size limit reached");
                return Outcome::Success;
            }

            // a short chunk is the last one, unless the server cut it short itself
            if received < self.chunk_size && page.result_code != ResultCode::SizeLimitExceeded {
                info!(strategy = "chunking", chunks = state.chunk_number, collected = self.collected.len(), "chunking complete");
                return Outcome::Success;
            }

            let Some(boundary) = boundary else {
                return Outcome::HardStop(format!(
                    "last entry of chunk {} has no {} value to continue from",
                    state.chunk_number, self.sort_attribute,
                ));
            };
            if state.last_boundary_value.as_deref() == Some(boundary.as_str()) {
                warn!(strategy = "chunking", %boundary, "boundary did not advance");
                return Outcome::SafetyLimitHit(format!(
                    "more than one chunk of entries share {}={:?}; remaining entries may be missing",
                    self.sort_attribute, boundary,
                ));
            }
            state.last_boundary_value = Some(boundary);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::RangeChunking;
    use crate::dedup::Deduplicator;
    use crate::directory::{with_connection, DirectoryEntry};
    use crate::engine::Outcome;
    use crate::engine::tests::{people_directory, PEOPLE_BASE};
    use crate::memory::{MemoryDirectory, MemoryProvider, ServerQuirks};
    use crate::request::SearchRequest;

    #[tokio::test]
    async fn test_chunks_until_short_chunk() {
        let provider = people_directory(20, ServerQuirks::default());
        let request = SearchRequest::new(PEOPLE_BASE, "(objectClass=person)")
            .only_attributes(["cn"]);
        let mut collected = Deduplicator::new();
        let outcome = with_connection(&provider, RangeChunking {
            request: &request,
            sort_attribute: "uid",
            chunk_size: 10,
            max_chunks: 2500,
            collected: &mut collected,
        }).await.unwrap();

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(collected.len(), 20);

        // 10 entries, then 10 starting at the boundary, then the lone boundary entry
        let stats = provider.directory().stats();
        assert_eq!(stats.searches, 3);
        assert_eq!(stats.filters, vec![
            "(objectClass=person)".to_owned(),
            "(&(objectClass=person)(uid>=user00009))".to_owned(),
            "(&(objectClass=person)(uid>=user00018))".to_owned(),
        ]);
        assert_eq!(stats.connections_released, 1);
    }

    #[tokio::test]
    async fn test_server_cap_below_chunk_size() {
        let quirks = ServerQuirks { size_limit: Some(4), ..ServerQuirks::default() };
        let provider = people_directory(10, quirks);
        let request = SearchRequest::new(PEOPLE_BASE, "(objectClass=person)");
        let mut collected = Deduplicator::new();
        let outcome = with_connection(&provider, RangeChunking {
            request: &request,
            sort_attribute: "uid",
            chunk_size: 50,
            max_chunks: 2500,
            collected: &mut collected,
        }).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(collected.len(), 10);
    }

    #[tokio::test]
    async fn test_stuck_boundary() {
        let mut entries = Vec::new();
        for i in 0..10 {
            entries.push(
                DirectoryEntry::new(format!("uid=clone{},ou=people,dc=example,dc=com", i))
                    .with_value("objectClass", "person")
                    .with_value("uid", format!("clone{}", i))
                    .with_value("sn", "Smith")
            );
        }
        let provider = MemoryProvider::new(MemoryDirectory::new(entries, ServerQuirks::default()));
        let request = SearchRequest::new(PEOPLE_BASE, "(sn=Smith)");
        let mut collected = Deduplicator::new();
        let outcome = with_connection(&provider, RangeChunking {
            request: &request,
            sort_attribute: "sn",
            chunk_size: 4,
            max_chunks: 2500,
            collected: &mut collected,
        }).await.unwrap();
        assert!(matches!(outcome, Outcome::SafetyLimitHit(_)));
        assert_eq!(collected.len(), 4);
        assert_eq!(provider.directory().stats().searches, 2);
    }

    #[tokio::test]
    async fn test_chunk_ceiling() {
        let provider = people_directory(50, ServerQuirks::default());
        let request = SearchRequest::new(PEOPLE_BASE, "(objectClass=person)");
        let mut collected = Deduplicator::new();
        let outcome = with_connection(&provider, RangeChunking {
            request: &request,
            sort_attribute: "uid",
            chunk_size: 5,
            max_chunks: 3,
            collected: &mut collected,
        }).await.unwrap();
        assert!(matches!(outcome, Outcome::SafetyLimitHit(_)));
        assert_eq!(collected.len(), 13);
    }

    #[tokio::test]
    async fn test_missing_sort_attribute() {
        let provider = people_directory(10, ServerQuirks::default());
        let request = SearchRequest::new(PEOPLE_BASE, "(objectClass=person)");
        let mut collected = Deduplicator::new();
        let outcome = with_connection(&provider, RangeChunking {
            request: &request,
            sort_attribute: "employeeNumber",
            chunk_size: 5,
            max_chunks: 2500,
            collected: &mut collected,
        }).await.unwrap();
        assert!(matches!(outcome, Outcome::HardStop(_)));
        assert_eq!(collected.len(), 5);
    }

    #[tokio::test]
    async fn test_stops_at_size_limit() {
        let provider = people_directory(100, ServerQuirks::default());
        let request = SearchRequest::new(PEOPLE_BASE, "(objectClass=person)").size_limit(12);
        let mut collected = Deduplicator::new();
        let outcome = with_connection(&provider, RangeChunking {
            request: &request,
            sort_attribute: "uid",
            chunk_size: 5,
            max_chunks: 2500,
            collected: &mut collected,
        }).await.unwrap();
        assert_eq!(outcome, Outcome::Success);

        // 5, then 4 new per chunk: 5, 9, 13
        assert_eq!(collected.len(), 13);
        assert_eq!(provider.directory().stats().searches, 3);
    }
}
