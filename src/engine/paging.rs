use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::dedup::Deduplicator;
use crate::directory::{Attempt, Directory, ResultCode, SearchOperation};
use crate::engine::Outcome;


/// Paging through the connection's own paged-search helper.
pub struct StandardPaging<'a> {
    pub operation: &'a SearchOperation,
    pub page_size: usize,
    pub collected: &'a mut Deduplicator,
}
#[async_trait]
impl<'a> Attempt for StandardPaging<'a> {
    type Output = Outcome;

    async fn run<D: Directory>(self, connection: &mut D) -> Outcome {
        match connection.paged_search(self.operation, self.page_size).await {
            Ok(entries) => {
                let received = entries.len();
                let added = self.collected.extend(entries);
                info!(strategy = "standard", received, added, "paged search complete");
                Outcome::Success
            },
            Err(e) => {
                warn!(strategy = "standard", error = %e, "paged search helper failed");
                Outcome::RecoverableFault(format!("paged search helper failed: {}", e))
            },
        }
    }
}


#[derive(Debug, Default)]
struct CookieState {
    cookie: Vec<u8>,
    page_number: usize,
}


/// Paging that drives the paged results cookie by hand.
///
/// Tolerates servers that resend a page, and tells a cumulative size limit
/// (worth switching to range chunking) apart from a plain stop. Stops early
/// once `size_limit` entries are collected.
pub struct CookiePaging<'a> {
    pub operation: &'a SearchOperation,
    pub page_size: usize,
    pub max_pages: usize,
    pub chunking_threshold: usize,
    pub size_limit: Option<usize>,
    pub collected: &'a mut Deduplicator,
}
#[async_trait]
impl<'a> Attempt for CookiePaging<'a> {
    type Output = Outcome;

    async fn run<D: Directory>(self, connection: &mut D) -> Outcome {
        let mut state = CookieState::default();
        loop {
            if state.page_number >= self.max_pages {
                warn!(strategy = "cookie", pages = state.page_number, collected = self.collected.len(), "page ceiling reached");
                return Outcome::SafetyLimitHit(format!("gave up after {} pages", state.page_number));
            }
            state.page_number += 1;

            let cookie = std::mem::take(&mut state.cookie);
            let paged_operation = self.operation.clone().with_paging(self.page_size, cookie);
            let page = match connection.search(&paged_operation).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(strategy = "cookie", page = state.page_number, error = %e, "paged search failed");
                    return Outcome::RecoverableFault(format!("page {} failed: {}", state.page_number, e));
                },
            };

            let next_cookie = page.next_cookie().to_vec();
            let received = page.entries.len();
            let added = self.collected.extend(page.entries);
            debug!(
                strategy = "cookie",
                page = state.page_number,
                received,
                added,
                cookie_len = next_cookie.len(),
                code = %page.result_code,
                "received page"
            );

            if self.size_limit.is_some_and(|limit| self.collected.len() >= limit) {
                info!(strategy = "cookie", pages = state.page_number, collected = self.collected.len(), "size limit reached");
                if !next_cookie.is_empty() && page.result_code == ResultCode::Success {
                    // a page size of zero tells the server to drop the operation
                    let abandon = self.operation.clone().with_paging(0, next_cookie);
                    if let Err(e) = connection.search(&abandon).await {
                        debug!(strategy = "cookie", error = %e, "abandoning paged search failed");
                    }
                }
                return Outcome::Success;
            }

            match page.result_code {
                ResultCode::Success => {
                    if next_cookie.is_empty() {
                        info!(strategy = "cookie", pages = state.page_number, collected = self.collected.len(), "paging complete");
                        return Outcome::Success;
                    }
                    state.cookie = next_cookie;
                },
                ResultCode::SizeLimitExceeded => {
                    let collected = self.collected.len();
                    if collected >= self.chunking_threshold {
                        return Outcome::RecoverableFault(format!("server size limit hit after {} entries", collected));
                    }
                    return Outcome::HardStop(format!("server size limit hit after {} entries", collected));
                },
                ResultCode::UnwillingToPerform => {
                    return Outcome::HardStop(format!("server unwilling to perform after {} pages: {}", state.page_number, page.message));
                },
                code => {
                    return Outcome::HardStop(format!("server answered page {} with {}: {}", state.page_number, code, page.message));
                },
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{CookiePaging, StandardPaging};
    use crate::dedup::Deduplicator;
    use crate::directory::{Attempt, ConnectionProvider, SearchOperation};
    use crate::engine::Outcome;
    use crate::engine::tests::{people_directory, PEOPLE_BASE};
    use crate::memory::ServerQuirks;
    use crate::request::SearchRequest;

    fn operation() -> SearchOperation {
        SearchOperation::from_request(&SearchRequest::new(PEOPLE_BASE, "(objectClass=person)"))
    }

    #[tokio::test]
    async fn test_standard_collects_everything() {
        let provider = people_directory(25, ServerQuirks::default());
        let mut connection = provider.connect().await.unwrap();
        let mut collected = Deduplicator::new();
        let operation = operation();
        let outcome = StandardPaging { operation: &operation, page_size: 10, collected: &mut collected }
            .run(&mut connection)
            .await;
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(collected.len(), 25);
        assert_eq!(provider.directory().stats().paged_searches, 3);
    }

    #[tokio::test]
    async fn test_cookie_page_ceiling() {
        let provider = people_directory(100, ServerQuirks::default());
        let mut connection = provider.connect().await.unwrap();
        let mut collected = Deduplicator::new();
        let operation = operation();
        let outcome = CookiePaging {
            operation: &operation,
            page_size: 10,
            max_pages: 4,
            chunking_threshold: 300,
            size_limit: None,
            collected: &mut collected,
        }.run(&mut connection).await;
        assert!(matches!(outcome, Outcome::SafetyLimitHit(_)));
        assert_eq!(collected.len(), 40);
    }

    #[tokio::test]
    async fn test_cookie_small_size_limit_stops() {
        let quirks = ServerQuirks { cumulative_limit: Some(25), ..ServerQuirks::default() };
        let provider = people_directory(100, quirks);
        let mut connection = provider.connect().await.unwrap();
        let mut collected = Deduplicator::new();
        let operation = operation();
        let outcome = CookiePaging {
            operation: &operation,
            page_size: 10,
            max_pages: 200,
            chunking_threshold: 300,
            size_limit: None,
            collected: &mut collected,
        }.run(&mut connection).await;
        assert!(matches!(outcome, Outcome::HardStop(_)));
        assert_eq!(collected.len(), 25);
    }

    #[tokio::test]
    async fn test_cookie_unwilling_stops() {
        let quirks = ServerQuirks { unwilling_after: Some(20), ..ServerQuirks::default() };
        let provider = people_directory(100, quirks);
        let mut connection = provider.connect().await.unwrap();
        let mut collected = Deduplicator::new();
        let operation = operation();
        let outcome = CookiePaging {
            operation: &operation,
            page_size: 10,
            max_pages: 200,
            chunking_threshold: 5,
            size_limit: None,
            collected: &mut collected,
        }.run(&mut connection).await;
        assert!(matches!(outcome, Outcome::HardStop(_)));
        assert_eq!(collected.len(), 20);
    }

    #[tokio::test]
    async fn test_cookie_skips_resent_page() {
        let quirks = ServerQuirks { resend_page: Some(2), ..ServerQuirks::default() };
        let provider = people_directory(25, quirks);
        let mut connection = provider.connect().await.unwrap();
        let mut collected = Deduplicator::new();
        let operation = operation();
        let outcome = CookiePaging {
            operation: &operation,
            page_size: 10,
            max_pages: 200,
            chunking_threshold: 300,
            size_limit: None,
            collected: &mut collected,
        }.run(&mut connection).await;
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(collected.len(), 25);

        // pages 1, 2, 2 again, 3
        let stats = provider.directory().stats();
        assert_eq!(stats.paged_searches, 4);
        let entries = collected.into_entries();
        assert_eq!(entries[10].first_string("uid").unwrap(), "user00010");
        assert_eq!(entries[20].first_string("uid").unwrap(), "user00020");
    }

    #[tokio::test]
    async fn test_cookie_stops_at_size_limit() {
        let provider = people_directory(100, ServerQuirks::default());
        let mut connection = provider.connect().await.unwrap();
        let mut collected = Deduplicator::new();
        let operation = operation();
        let outcome = CookiePaging {
            operation: &operation,
            page_size: 10,
            max_pages: 200,
            chunking_threshold: 300,
            size_limit: Some(25),
            collected: &mut collected,
        }.run(&mut connection).await;
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(collected.len(), 30);

        // three pages and the request abandoning the operation
        assert_eq!(provider.directory().stats().paged_searches, 4);
        assert_eq!(provider.directory().open_operations(), 0);
    }

    #[tokio::test]
    async fn test_cookie_against_server_without_paging() {
        let quirks = ServerQuirks { ignore_paging: true, ..ServerQuirks::default() };
        let provider = people_directory(25, quirks);
        let mut connection = provider.connect().await.unwrap();
        let mut collected = Deduplicator::new();
        let operation = operation();
        let outcome = CookiePaging {
            operation: &operation,
            page_size: 10,
            max_pages: 200,
            chunking_threshold: 300,
            size_limit: None,
            collected: &mut collected,
        }.run(&mut connection).await;

        // everything arrives in one answer without a cookie
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(collected.len(), 25);
        let stats = provider.directory().stats();
        assert_eq!(stats.searches, 1);
        assert_eq!(stats.paged_searches, 0);
    }
}
