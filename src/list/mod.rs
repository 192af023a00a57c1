//! Chunked listing over a [`VersionedStore`](crate::storage::VersionedStore).
//!
//! A list call returns at most `limit` entries plus an opaque continuation token. Pages that
//! share a token chain are read at one anchor revision, so concurrent writes never show up
//! mid-listing. If compaction removes the anchor before the next page is requested, the
//! listing continues from the same key at the latest revision and every page from then on
//! is flagged inconsistent.

pub mod service;
pub mod token;

pub use service::{ChunkedListService, ListConfig};
pub use token::{ContinuationCodec, ContinuationToken, TokenError};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::storage::{KeyValue, StoreError};

/// Opaque predicate deciding whether an entry belongs in the listing.
///
/// Selector evaluation (labels, fields) lives outside the engine; any closure over a
/// [`KeyValue`] works.
pub trait Selector: Send + Sync {
    fn matches(&self, kv: &KeyValue) -> bool;

    /// True when the selector accepts everything, letting the engine skip filtering.
    fn is_everything(&self) -> bool {
        false
    }
}

impl<F> Selector for F
where
    F: Fn(&KeyValue) -> bool + Send + Sync,
{
    fn matches(&self, kv: &KeyValue) -> bool {
        self(kv)
    }
}

/// Selector that matches every entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct Everything;

impl Selector for Everything {
    fn matches(&self, _kv: &KeyValue) -> bool {
        true
    }

    fn is_everything(&self) -> bool {
        true
    }
}

/// How a fresh listing picks its anchor revision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConsistencyMode {
    /// Latest revision; a requested resource version is only a lower bound.
    #[default]
    Any,
    /// Exactly the requested resource version.
    ExactRevision,
}

/// One list call.
#[derive(Clone, Default)]
pub struct ListRequest {
    /// Page size. `None` lists everything; `Some(0)` returns only the revision.
    pub limit: Option<i64>,
    pub continue_token: Option<String>,
    pub selector: Option<Arc<dyn Selector>>,
    pub resource_version: Option<i64>,
    pub consistency: ConsistencyMode,
    /// Deadline for the whole call, including the store read.
    pub timeout: Option<Duration>,
}

impl ListRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_continue(mut self, token: impl Into<String>) -> Self {
        self.continue_token = Some(token.into());
        self
    }

    pub fn with_selector(mut self, selector: impl Selector + 'static) -> Self {
        self.selector = Some(Arc::new(selector));
        self
    }

    pub fn with_resource_version(mut self, revision: i64, consistency: ConsistencyMode) -> Self {
        self.resource_version = Some(revision);
        self.consistency = consistency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for ListRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListRequest")
            .field("limit", &self.limit)
            .field("continue_token", &self.continue_token)
            .field("selector", &self.selector.as_ref().map(|_| "<selector>"))
            .field("resource_version", &self.resource_version)
            .field("consistency", &self.consistency)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Whether a page belongs to a snapshot-consistent enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageStatus {
    /// Served from the sequence's original anchor revision.
    Consistent,
    /// The token's anchor was compacted; this page was re-anchored at a newer revision.
    InconsistentResume { expired_revision: i64 },
    /// A later page of a sequence that was re-anchored earlier.
    Inconsistent,
}

impl PageStatus {
    pub fn is_consistent(&self) -> bool {
        matches!(self, PageStatus::Consistent)
    }
}

/// States a list call passes through, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListPhase {
    FreshStart,
    Reading,
    Expired,
    Truncated,
    Exhausted,
}

/// One page of results.
#[derive(Clone, Debug)]
pub struct ListResponse {
    pub items: Vec<KeyValue>,
    /// Revision the page was read at.
    pub resource_version: i64,
    pub continue_token: Option<String>,
    /// Entries after this page at `resource_version`, when known.
    pub remaining_item_count: Option<i64>,
    pub status: PageStatus,
    /// State transitions of this call.
    pub phases: Vec<ListPhase>,
}

impl ListResponse {
    /// Error-shaped status for the transitional page after an expired token, carrying the
    /// new inconsistent token. `None` for ordinary pages.
    pub fn api_status(&self) -> Option<ApiStatus> {
        match self.status {
            PageStatus::InconsistentResume { expired_revision } => Some(ApiStatus {
                code: 410,
                reason: StatusReason::Expired,
                message: format!(
                    "The provided continue parameter is too old to display a consistent list \
                     result (revision {} has been compacted). The list continued from the \
                     last returned key at revision {}; objects created, modified, or deleted \
                     in between may be missing or duplicated. Use the continue token in this \
                     response to retrieve the remainder of the results, or start a new list \
                     without the continue parameter.",
                    expired_revision, self.resource_version
                ),
                continue_token: self.continue_token.clone(),
            }),
            _ => None,
        }
    }
}

/// Machine-readable status reason, mirroring the reasons a list caller can act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StatusReason {
    BadRequest,
    Expired,
    Timeout,
    Cancelled,
    InternalError,
    ServiceUnavailable,
}

/// Wire-level status for a failed call or an inconsistent resume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApiStatus {
    pub code: u16,
    pub reason: StatusReason,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_token: Option<String>,
}

/// List errors.
#[derive(Error, Debug)]
pub enum ListError {
    #[error("invalid continue token: {0}")]
    InvalidContinueToken(#[from] TokenError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("too large resource version: {requested}, current: {latest}")]
    RevisionNotYetVisible { requested: i64, latest: i64 },

    /// A fresh read pinned to a compacted revision; there is no resume point to recover.
    #[error("too old resource version: {requested} (oldest available: {oldest})")]
    Expired { requested: i64, oldest: i64 },

    #[error("list request cancelled")]
    Cancelled,

    #[error("list request timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage error: {0}")]
    Storage(StoreError),

    #[error("store returned inconsistent data: {0}")]
    ConsistencyViolation(String),
}

impl From<StoreError> for ListError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RevisionTooOld { requested, oldest } => {
                ListError::Expired { requested, oldest }
            }
            StoreError::RevisionNotYetVisible { requested, latest } => {
                ListError::RevisionNotYetVisible { requested, latest }
            }
            other => ListError::Storage(other),
        }
    }
}

impl ListError {
    /// True for errors caused by the request itself; retrying unchanged will not help.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ListError::InvalidContinueToken(_)
                | ListError::BadRequest(_)
                | ListError::RevisionNotYetVisible { .. }
                | ListError::Expired { .. }
        )
    }

    /// Maps the error to the status a caller sees.
    pub fn status(&self) -> ApiStatus {
        let (code, reason) = match self {
            ListError::InvalidContinueToken(_) | ListError::BadRequest(_) => {
                (400, StatusReason::BadRequest)
            }
            ListError::RevisionNotYetVisible { .. } | ListError::Timeout(_) => {
                (504, StatusReason::Timeout)
            }
            ListError::Expired { .. } => (410, StatusReason::Expired),
            ListError::Cancelled => (499, StatusReason::Cancelled),
            ListError::Storage(StoreError::Unavailable(_)) => {
                (503, StatusReason::ServiceUnavailable)
            }
            ListError::Storage(_) | ListError::ConsistencyViolation(_) => {
                (500, StatusReason::InternalError)
            }
        };

        ApiStatus {
            code,
            reason,
            message: self.to_string(),
            continue_token: None,
        }
    }
}

pub type ListResult<T> = Result<T, ListError>;
