//! Page orchestration for chunked listing.
//!
//! Each call is independent: everything needed to resume lives in the continuation token.
//! A call walks `FreshStart -> Reading -> {Truncated | Exhausted}`; when a token's anchor
//! has been compacted it takes the single detour `Reading -> Expired -> Reading` at the
//! latest revision and marks the rest of the sequence inconsistent. A fresh listing at any
//! revision takes the same detour but stays consistent, since it has returned nothing yet.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::list::{
    ConsistencyMode, ContinuationCodec, ContinuationToken, ListError, ListPhase, ListRequest,
    ListResponse, ListResult, PageStatus, Selector,
};
use crate::storage::{KeyValue, RangePage, StoreError, VersionedStore};

/// Tuning for the list engine.
#[derive(Clone, Debug)]
pub struct ListConfig {
    /// Upper bound on a single store read while filtering with a selector.
    pub max_chunk_size: usize,

    /// Report `remaining_item_count` when the store can compute it.
    pub remaining_item_count: bool,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 10_000,
            remaining_item_count: true,
        }
    }
}

/// Where a page starts reading.
#[derive(Clone, Debug)]
struct Cursor {
    anchor: i64,
    start_key: Vec<u8>,
    inconsistent: bool,
    /// The cursor came from a token.
    resumed: bool,
}

/// Entries gathered for one page, before token and accounting.
struct PageRead {
    items: Vec<KeyValue>,
    has_more: bool,
}

/// Serves list pages from a [`VersionedStore`].
pub struct ChunkedListService {
    store: Arc<dyn VersionedStore>,
    config: ListConfig,
}

impl ChunkedListService {
    pub fn new(store: Arc<dyn VersionedStore>, config: ListConfig) -> Self {
        Self { store, config }
    }

    /// Serves one page.
    pub async fn list(&self, request: ListRequest) -> ListResult<ListResponse> {
        self.list_with_cancel(request, std::future::pending()).await
    }

    /// Serves one page, aborting when `cancel` completes first.
    ///
    /// Cancellation and `request.timeout` drop the in-flight store read; no token is
    /// returned, so the caller retries the whole page.
    pub async fn list_with_cancel<C>(&self, request: ListRequest, cancel: C) -> ListResult<ListResponse>
    where
        C: Future<Output = ()>,
    {
        let page = async {
            match request.timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.serve_page(&request))
                    .await
                    .unwrap_or(Err(ListError::Timeout(timeout))),
                None => self.serve_page(&request).await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel => {
                debug!("List request cancelled by caller");
                Err(ListError::Cancelled)
            }
            result = page => result,
        }
    }

    async fn serve_page(&self, request: &ListRequest) -> ListResult<ListResponse> {
        let mut phases = vec![ListPhase::FreshStart];

        let limit = validate_limit(request.limit)?;
        let selector = request
            .selector
            .as_deref()
            .filter(|selector| !selector.is_everything());
        let mut cursor = self.resolve_cursor(request)?;
        let mut status = if cursor.inconsistent {
            PageStatus::Inconsistent
        } else {
            PageStatus::Consistent
        };

        // A fresh `Any` listing has promised no revision yet, so it can re-read from the
        // start at the latest revision without losing consistency.
        let recoverable = cursor.resumed || request.consistency == ConsistencyMode::Any;

        phases.push(ListPhase::Reading);
        let page = match self.read_page(&cursor, limit, selector).await {
            Err(ListError::Expired { requested, oldest }) if recoverable => {
                phases.push(ListPhase::Expired);
                let latest = self.store.latest_revision();

                if cursor.resumed {
                    warn!(
                        expired_revision = requested,
                        oldest_revision = oldest,
                        new_anchor = latest,
                        "Continue token anchor was compacted, resuming inconsistently at latest revision"
                    );
                    cursor = Cursor {
                        anchor: latest,
                        inconsistent: true,
                        ..cursor
                    };
                    status = PageStatus::InconsistentResume {
                        expired_revision: requested,
                    };
                } else {
                    debug!(
                        expired_revision = requested,
                        new_anchor = latest,
                        "Anchor compacted before the first page was served, re-reading at latest revision"
                    );
                    cursor = Cursor {
                        anchor: latest,
                        ..cursor
                    };
                }

                phases.push(ListPhase::Reading);
                self.read_page(&cursor, limit, selector).await?
            }
            other => other?,
        };

        let truncated = page.has_more;
        phases.push(if truncated {
            ListPhase::Truncated
        } else {
            ListPhase::Exhausted
        });

        // A zero limit returns no items, so the next page resumes where this one started.
        let resume_key = page
            .items
            .last()
            .map(|kv| kv.key.clone())
            .unwrap_or_else(|| cursor.start_key.clone());

        let continue_token = truncated.then(|| {
            ContinuationCodec::encode(&ContinuationToken {
                start_key: resume_key.clone(),
                revision: cursor.anchor,
                inconsistent: cursor.inconsistent,
            })
        });

        let remaining_item_count = if !self.config.remaining_item_count || selector.is_some() {
            None
        } else if truncated {
            match self.store.count_after(cursor.anchor, &resume_key).await {
                Ok(count) => count,
                // The page itself was read; compaction only costs the count.
                Err(StoreError::RevisionTooOld { requested, oldest }) => {
                    debug!(
                        anchor = requested,
                        oldest_revision = oldest,
                        "Anchor compacted after the page was read, omitting remaining count"
                    );
                    None
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            Some(0)
        };

        debug!(
            anchor = cursor.anchor,
            items = page.items.len(),
            truncated,
            remaining = ?remaining_item_count,
            status = ?status,
            "Served list page"
        );

        Ok(ListResponse {
            items: page.items,
            resource_version: cursor.anchor,
            continue_token,
            remaining_item_count,
            status,
            phases,
        })
    }

    /// Picks the anchor revision and start key from the token or the request.
    fn resolve_cursor(&self, request: &ListRequest) -> ListResult<Cursor> {
        if let Some(encoded) = request.continue_token.as_deref() {
            if request.resource_version.is_some() {
                return Err(ListError::BadRequest(
                    "specifying resource version is not allowed when using continue".to_string(),
                ));
            }
            if request.consistency == ConsistencyMode::ExactRevision {
                return Err(ListError::BadRequest(
                    "exact revision matching is not allowed when using continue".to_string(),
                ));
            }

            let token = ContinuationCodec::decode(encoded)?;
            return Ok(Cursor {
                anchor: token.revision,
                start_key: token.start_key,
                inconsistent: token.inconsistent,
                resumed: true,
            });
        }

        let latest = self.store.latest_revision();
        let anchor = match (request.consistency, request.resource_version) {
            (ConsistencyMode::ExactRevision, Some(revision)) if revision > 0 => revision,
            (ConsistencyMode::ExactRevision, _) => {
                return Err(ListError::BadRequest(
                    "exact revision matching requires a positive resource version".to_string(),
                ))
            }
            (ConsistencyMode::Any, Some(revision)) if revision > latest => {
                return Err(ListError::RevisionNotYetVisible {
                    requested: revision,
                    latest,
                })
            }
            (ConsistencyMode::Any, _) => latest,
        };

        Ok(Cursor {
            anchor,
            start_key: Vec::new(),
            inconsistent: false,
            resumed: false,
        })
    }

    /// Reads one page worth of entries at the cursor's anchor.
    async fn read_page(
        &self,
        cursor: &Cursor,
        limit: Option<usize>,
        selector: Option<&dyn Selector>,
    ) -> ListResult<PageRead> {
        match limit {
            // Lookahead: is there at least one more matching entry?
            Some(0) => {
                let lookahead = self.collect(cursor, Some(1), selector).await?;
                Ok(PageRead {
                    items: Vec::new(),
                    has_more: lookahead.has_more || !lookahead.items.is_empty(),
                })
            }
            limit => self.collect(cursor, limit, selector).await,
        }
    }

    async fn collect(
        &self,
        cursor: &Cursor,
        limit: Option<usize>,
        selector: Option<&dyn Selector>,
    ) -> ListResult<PageRead> {
        let Some(selector) = selector else {
            let page = self.read_checked(cursor.anchor, &cursor.start_key, limit).await?;
            return Ok(PageRead {
                items: page.entries,
                has_more: page.has_more,
            });
        };

        let Some(limit) = limit else {
            let page = self.read_checked(cursor.anchor, &cursor.start_key, None).await?;
            return Ok(PageRead {
                items: page
                    .entries
                    .into_iter()
                    .filter(|kv| selector.matches(kv))
                    .collect(),
                has_more: false,
            });
        };

        // Keep reading until the page is full or the key space is exhausted, doubling the
        // chunk each round since the selector is evidently discarding entries.
        let mut items = Vec::with_capacity(limit);
        let mut scan_from = cursor.start_key.clone();
        let mut chunk = limit.clamp(1, self.config.max_chunk_size.max(1));

        loop {
            let page = self.read_checked(cursor.anchor, &scan_from, Some(chunk)).await?;
            let Some(last_scanned) = page.entries.last().map(|kv| kv.key.clone()) else {
                return Ok(PageRead {
                    items,
                    has_more: false,
                });
            };

            let mut entries = page.entries.into_iter();
            for kv in entries.by_ref() {
                if selector.matches(&kv) {
                    items.push(kv);
                    if items.len() == limit {
                        break;
                    }
                }
            }

            if items.len() == limit {
                return Ok(PageRead {
                    items,
                    has_more: entries.len() > 0 || page.has_more,
                });
            }
            if !page.has_more {
                return Ok(PageRead {
                    items,
                    has_more: false,
                });
            }

            scan_from = last_scanned;
            chunk = (chunk * 2).min(self.config.max_chunk_size.max(1));
        }
    }

    /// One store read with the page ceiling and ordering enforced.
    async fn read_checked(
        &self,
        revision: i64,
        start_after: &[u8],
        limit: Option<usize>,
    ) -> ListResult<RangePage> {
        let mut page = self.store.read_range(revision, start_after, limit).await?;
        check_order(&page.entries, start_after)?;

        if let Some(limit) = limit {
            if page.entries.len() > limit {
                debug!(
                    returned = page.entries.len(),
                    limit, "Store returned more entries than requested, truncating"
                );
                page.entries.truncate(limit);
                page.has_more = true;
            }
        }

        Ok(page)
    }
}

fn validate_limit(limit: Option<i64>) -> ListResult<Option<usize>> {
    match limit {
        None => Ok(None),
        Some(limit) if limit < 0 => Err(ListError::BadRequest(format!(
            "limit must not be negative, got {}",
            limit
        ))),
        Some(limit) => usize::try_from(limit)
            .map(Some)
            .map_err(|_| ListError::BadRequest(format!("limit {} is too large", limit))),
    }
}

/// Entries must be strictly ascending and strictly after the start key.
fn check_order(entries: &[KeyValue], start_after: &[u8]) -> ListResult<()> {
    let mut previous: Option<&[u8]> = (!start_after.is_empty()).then_some(start_after);

    for kv in entries {
        if let Some(prev) = previous {
            if kv.key.as_slice() <= prev {
                let message = format!(
                    "key {:?} returned after {:?}",
                    String::from_utf8_lossy(&kv.key),
                    String::from_utf8_lossy(prev)
                );
                error!("Store returned out-of-order keys: {}", message);
                return Err(ListError::ConsistencyViolation(message));
            }
        }
        previous = Some(&kv.key);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::TokenError;
    use crate::storage::mvcc::tests::setup_store;
    use crate::storage::{MvccStore, StoreResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn kv(key: &str) -> KeyValue {
        KeyValue {
            key: key.as_bytes().to_vec(),
            create_revision: 1,
            mod_revision: 1,
            version: 1,
            value: b"v".to_vec(),
        }
    }

    /// Store that ignores the requested window and replays a fixed answer.
    struct FixedStore {
        entries: Vec<KeyValue>,
        delay: Option<Duration>,
        unavailable: bool,
    }

    impl FixedStore {
        fn new(entries: Vec<KeyValue>) -> Self {
            Self {
                entries,
                delay: None,
                unavailable: false,
            }
        }
    }

    #[async_trait]
    impl VersionedStore for FixedStore {
        fn oldest_revision(&self) -> i64 {
            1
        }

        fn latest_revision(&self) -> i64 {
            10
        }

        async fn read_range(
            &self,
            _revision: i64,
            _start_after: &[u8],
            _limit: Option<usize>,
        ) -> StoreResult<RangePage> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.unavailable {
                return Err(StoreError::Unavailable("disk offline".to_string()));
            }
            Ok(RangePage {
                entries: self.entries.clone(),
                has_more: false,
            })
        }
    }

    /// Store that compacts past every revision right after its next `compactions` reads.
    struct CompactingStore {
        inner: Arc<MvccStore>,
        compactions: AtomicUsize,
    }

    impl CompactingStore {
        fn new(inner: Arc<MvccStore>, compactions: usize) -> Self {
            Self {
                inner,
                compactions: AtomicUsize::new(compactions),
            }
        }
    }

    #[async_trait]
    impl VersionedStore for CompactingStore {
        fn oldest_revision(&self) -> i64 {
            self.inner.oldest_revision()
        }

        fn latest_revision(&self) -> i64 {
            self.inner.latest_revision()
        }

        async fn read_range(
            &self,
            revision: i64,
            start_after: &[u8],
            limit: Option<usize>,
        ) -> StoreResult<RangePage> {
            let page = self.inner.read_range(revision, start_after, limit).await?;

            let pending = self.compactions.load(Ordering::SeqCst);
            if pending > 0 {
                self.compactions.store(pending - 1, Ordering::SeqCst);
                self.inner.put(b"zz", b"v").unwrap();
                self.inner.compact(self.inner.current_revision()).unwrap();
            }
            Ok(page)
        }

        async fn count_after(&self, revision: i64, start_after: &[u8]) -> StoreResult<Option<i64>> {
            VersionedStore::count_after(self.inner.as_ref(), revision, start_after).await
        }
    }

    fn service_for(store: Arc<MvccStore>) -> ChunkedListService {
        ChunkedListService::new(store, ListConfig::default())
    }

    fn seed(store: &MvccStore, count: usize) {
        for i in 0..count {
            store.put(format!("key-{:02}", i).as_bytes(), b"v1").unwrap();
        }
    }

    fn keys(items: &[KeyValue]) -> Vec<String> {
        items
            .iter()
            .map(|kv| String::from_utf8_lossy(&kv.key).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_pages_share_anchor_and_hide_later_writes() {
        let (store, _dir) = setup_store();
        seed(&store, 10);
        let service = service_for(store.clone());

        let first = service.list(ListRequest::new().with_limit(3)).await.unwrap();
        let anchor = first.resource_version;
        assert_eq!(keys(&first.items), ["key-00", "key-01", "key-02"]);
        assert_eq!(first.remaining_item_count, Some(7));
        assert_eq!(
            first.phases,
            [ListPhase::FreshStart, ListPhase::Reading, ListPhase::Truncated]
        );

        store.put(b"key-05", b"v2").unwrap();
        store.put(b"key-99", b"v1").unwrap();

        let mut items = first.items;
        let mut token = first.continue_token;
        let mut remaining = Vec::new();
        while let Some(next) = token {
            let page = service
                .list(ListRequest::new().with_limit(3).with_continue(next))
                .await
                .unwrap();
            assert_eq!(page.resource_version, anchor);
            assert_eq!(page.status, PageStatus::Consistent);
            remaining.push(page.remaining_item_count);
            items.extend(page.items);
            token = page.continue_token;
        }

        assert_eq!(remaining, [Some(4), Some(1), Some(0)]);
        assert_eq!(items.len(), 10);
        assert!(items.iter().all(|kv| kv.value == b"v1"));
        assert!(!keys(&items).contains(&"key-99".to_string()));
    }

    #[tokio::test]
    async fn test_unlimited_list_is_one_page() {
        let (store, _dir) = setup_store();
        seed(&store, 5);

        let page = service_for(store).list(ListRequest::new()).await.unwrap();
        assert_eq!(page.items.len(), 5);
        assert!(page.continue_token.is_none());
        assert_eq!(page.remaining_item_count, Some(0));
        assert_eq!(page.phases.last(), Some(&ListPhase::Exhausted));
    }

    #[tokio::test]
    async fn test_zero_limit_peeks_without_moving() {
        let (store, _dir) = setup_store();
        seed(&store, 4);
        let service = service_for(store);

        let lookahead = service.list(ListRequest::new().with_limit(0)).await.unwrap();
        assert!(lookahead.items.is_empty());
        assert_eq!(lookahead.remaining_item_count, Some(4));
        let token = lookahead.continue_token.unwrap();

        let page = service
            .list(ListRequest::new().with_limit(2).with_continue(token))
            .await
            .unwrap();
        assert_eq!(keys(&page.items), ["key-00", "key-01"]);
        assert_eq!(page.resource_version, lookahead.resource_version);
    }

    #[tokio::test]
    async fn test_zero_limit_on_empty_store() {
        let (store, _dir) = setup_store();

        let lookahead = service_for(store).list(ListRequest::new().with_limit(0)).await.unwrap();
        assert!(lookahead.items.is_empty());
        assert!(lookahead.continue_token.is_none());
        assert_eq!(lookahead.remaining_item_count, Some(0));
    }

    #[tokio::test]
    async fn test_selector_fills_pages_across_chunks() {
        let (store, _dir) = setup_store();
        for i in 0..10 {
            let value: &[u8] = if i % 2 == 0 { b"even" } else { b"odd" };
            store.put(format!("key-{:02}", i).as_bytes(), value).unwrap();
        }
        let service = ChunkedListService::new(
            store,
            ListConfig {
                max_chunk_size: 2,
                remaining_item_count: true,
            },
        );
        let request = || {
            ListRequest::new()
                .with_limit(2)
                .with_selector(|kv: &KeyValue| kv.value == b"even")
        };

        let mut pages = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut next = request();
            if let Some(t) = token.take() {
                next = next.with_continue(t);
            }
            let page = service.list(next).await.unwrap();
            assert_eq!(page.remaining_item_count, None);
            pages.push(keys(&page.items));
            match page.continue_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }

        assert_eq!(
            pages,
            [
                vec!["key-00", "key-02"],
                vec!["key-04", "key-06"],
                vec!["key-08"]
            ]
        );
    }

    #[tokio::test]
    async fn test_compacted_token_resumes_inconsistently() {
        let (store, _dir) = setup_store();
        for key in ["k0", "k1", "k2", "k3", "k4", "k5"] {
            store.put(key.as_bytes(), b"v").unwrap();
        }
        let service = service_for(store.clone());

        let first = service.list(ListRequest::new().with_limit(2)).await.unwrap();
        let anchor = first.resource_version;
        let token = first.continue_token.unwrap();

        store.put(b"k9", b"v").unwrap();
        store.delete_range(b"k3", b"k4").unwrap();
        store.compact(store.current_revision()).unwrap();
        let latest = store.current_revision();

        let resumed = service
            .list(ListRequest::new().with_limit(2).with_continue(token))
            .await
            .unwrap();
        assert_eq!(keys(&resumed.items), ["k2", "k4"]);
        assert_eq!(resumed.resource_version, latest);
        assert_eq!(
            resumed.status,
            PageStatus::InconsistentResume {
                expired_revision: anchor
            }
        );
        assert_eq!(
            resumed.phases,
            [
                ListPhase::FreshStart,
                ListPhase::Reading,
                ListPhase::Expired,
                ListPhase::Reading,
                ListPhase::Truncated
            ]
        );
        let status = resumed.api_status().unwrap();
        assert_eq!(status.code, 410);
        assert_eq!(status.continue_token, resumed.continue_token);

        let decoded = ContinuationCodec::decode(resumed.continue_token.as_deref().unwrap()).unwrap();
        assert!(decoded.inconsistent);
        assert_eq!(decoded.revision, latest);

        let last = service
            .list(ListRequest::new().with_limit(2).with_continue(resumed.continue_token.unwrap()))
            .await
            .unwrap();
        assert_eq!(keys(&last.items), ["k5", "k9"]);
        assert_eq!(last.status, PageStatus::Inconsistent);
        assert_eq!(last.resource_version, latest);
        assert!(last.continue_token.is_none());
        assert!(last.api_status().is_none());
    }

    #[tokio::test]
    async fn test_exact_revision_below_compaction_is_expired() {
        let (store, _dir) = setup_store();
        seed(&store, 3);
        let old = store.current_revision() - 1;
        store.compact(store.current_revision()).unwrap();

        let err = service_for(store)
            .list(ListRequest::new().with_resource_version(old, ConsistencyMode::ExactRevision))
            .await
            .unwrap_err();
        assert!(matches!(err, ListError::Expired { requested, .. } if requested == old));
        assert_eq!(err.status().code, 410);
    }

    #[tokio::test]
    async fn test_exact_revision_reads_history() {
        let (store, _dir) = setup_store();
        store.put(b"a", b"old").unwrap();
        let pinned = store.current_revision();
        store.put(b"a", b"new").unwrap();
        store.put(b"b", b"new").unwrap();

        let page = service_for(store)
            .list(ListRequest::new().with_resource_version(pinned, ConsistencyMode::ExactRevision))
            .await
            .unwrap();
        assert_eq!(page.resource_version, pinned);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].value, b"old");
    }

    #[tokio::test]
    async fn test_future_resource_version_is_not_yet_visible() {
        let (store, _dir) = setup_store();
        seed(&store, 2);
        let latest = store.current_revision();
        let service = service_for(store);

        let err = service
            .list(ListRequest::new().with_resource_version(latest + 10, ConsistencyMode::Any))
            .await
            .unwrap_err();
        assert!(matches!(err, ListError::RevisionNotYetVisible { latest: l, .. } if l == latest));

        let err = service
            .list(
                ListRequest::new()
                    .with_resource_version(latest + 10, ConsistencyMode::ExactRevision),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status().code, 504);
    }

    #[tokio::test]
    async fn test_request_validation() {
        let (store, _dir) = setup_store();
        seed(&store, 2);
        let service = service_for(store);

        let err = service.list(ListRequest::new().with_limit(-1)).await.unwrap_err();
        assert!(matches!(err, ListError::BadRequest(_)));

        let err = service
            .list(ListRequest::new().with_continue("%%%"))
            .await
            .unwrap_err();
        assert!(matches!(err, ListError::InvalidContinueToken(TokenError::Malformed(_))));
        assert_eq!(err.status().code, 400);

        let token = service
            .list(ListRequest::new().with_limit(1))
            .await
            .unwrap()
            .continue_token
            .unwrap();
        let err = service
            .list(
                ListRequest::new()
                    .with_continue(token.clone())
                    .with_resource_version(1, ConsistencyMode::Any),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ListError::BadRequest(_)));

        let err = service
            .list(ListRequest::new().with_resource_version(0, ConsistencyMode::ExactRevision))
            .await
            .unwrap_err();
        assert!(matches!(err, ListError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_retrying_a_token_is_idempotent() {
        let (store, _dir) = setup_store();
        seed(&store, 6);
        let service = service_for(store.clone());

        let token = service
            .list(ListRequest::new().with_limit(2))
            .await
            .unwrap()
            .continue_token
            .unwrap();
        let once = service
            .list(ListRequest::new().with_limit(2).with_continue(token.clone()))
            .await
            .unwrap();
        store.put(b"key-03", b"changed").unwrap();
        let twice = service
            .list(ListRequest::new().with_limit(2).with_continue(token))
            .await
            .unwrap();

        assert_eq!(once.items, twice.items);
        assert_eq!(once.continue_token, twice.continue_token);
    }

    #[tokio::test]
    async fn test_out_of_order_store_is_a_violation() {
        let store = Arc::new(FixedStore::new(vec![kv("b"), kv("a")]));
        let service = ChunkedListService::new(store, ListConfig::default());

        let err = service.list(ListRequest::new().with_limit(5)).await.unwrap_err();
        assert!(matches!(err, ListError::ConsistencyViolation(_)));
        assert_eq!(err.status().code, 500);
    }

    #[tokio::test]
    async fn test_store_overshoot_is_truncated() {
        let store = Arc::new(FixedStore::new(vec![kv("a"), kv("b"), kv("c"), kv("d")]));
        let service = ChunkedListService::new(store, ListConfig::default());

        let page = service.list(ListRequest::new().with_limit(2)).await.unwrap();
        assert_eq!(keys(&page.items), ["a", "b"]);
        let token = ContinuationCodec::decode(page.continue_token.as_deref().unwrap()).unwrap();
        assert_eq!(token.start_key, b"b");
        assert_eq!(page.remaining_item_count, None);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = Arc::new(FixedStore {
            unavailable: true,
            ..FixedStore::new(Vec::new())
        });
        let service = ChunkedListService::new(store, ListConfig::default());

        let err = service.list(ListRequest::new()).await.unwrap_err();
        assert!(matches!(err, ListError::Storage(StoreError::Unavailable(_))));
        assert_eq!(err.status().code, 503);
    }

    #[tokio::test]
    async fn test_cancel_drops_slow_read() {
        let store = Arc::new(FixedStore {
            delay: Some(Duration::from_secs(5)),
            ..FixedStore::new(vec![kv("a")])
        });
        let service = ChunkedListService::new(store, ListConfig::default());

        let err = service
            .list_with_cancel(
                ListRequest::new(),
                tokio::time::sleep(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ListError::Cancelled));
        assert_eq!(err.status().code, 499);
    }

    #[tokio::test]
    async fn test_timeout_drops_slow_read() {
        let store = Arc::new(FixedStore {
            delay: Some(Duration::from_secs(5)),
            ..FixedStore::new(vec![kv("a")])
        });
        let service = ChunkedListService::new(store, ListConfig::default());

        let err = service
            .list(ListRequest::new().with_timeout(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, ListError::Timeout(_)));
        assert_eq!(err.status().code, 504);
    }

    #[tokio::test]
    async fn test_compaction_after_read_keeps_page() {
        let (store, _dir) = setup_store();
        seed(&store, 4);

        let token = service_for(store.clone())
            .list(ListRequest::new().with_limit(1))
            .await
            .unwrap()
            .continue_token
            .unwrap();
        let anchor = ContinuationCodec::decode(&token).unwrap().revision;

        let service = ChunkedListService::new(
            Arc::new(CompactingStore::new(store.clone(), 1)),
            ListConfig::default(),
        );
        let page = service
            .list(ListRequest::new().with_limit(1).with_continue(token))
            .await
            .unwrap();

        assert!(store.compact_revision() > anchor);
        assert_eq!(keys(&page.items), ["key-01"]);
        assert_eq!(page.resource_version, anchor);
        assert_eq!(page.status, PageStatus::Consistent);
        assert_eq!(page.remaining_item_count, None);
        assert!(page.continue_token.is_some());
    }

    #[tokio::test]
    async fn test_fresh_listing_recovers_from_compaction_mid_page() {
        let (store, _dir) = setup_store();
        for i in 0..6 {
            let value: &[u8] = if i % 2 == 0 { b"even" } else { b"odd" };
            store.put(format!("key-{:02}", i).as_bytes(), value).unwrap();
        }
        let first_anchor = store.current_revision();

        let service = ChunkedListService::new(
            Arc::new(CompactingStore::new(store.clone(), 1)),
            ListConfig::default(),
        );
        let page = service
            .list(
                ListRequest::new()
                    .with_limit(2)
                    .with_selector(|kv: &KeyValue| kv.value == b"even"),
            )
            .await
            .unwrap();

        assert_eq!(keys(&page.items), ["key-00", "key-02"]);
        assert_eq!(page.status, PageStatus::Consistent);
        assert!(page.resource_version > first_anchor);
        assert_eq!(page.resource_version, store.current_revision());
        assert_eq!(
            page.phases,
            [
                ListPhase::FreshStart,
                ListPhase::Reading,
                ListPhase::Expired,
                ListPhase::Reading,
                ListPhase::Truncated
            ]
        );

        let token = ContinuationCodec::decode(page.continue_token.as_deref().unwrap()).unwrap();
        assert!(!token.inconsistent);
        assert!(page.api_status().is_none());
    }
}
