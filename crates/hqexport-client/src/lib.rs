//! Authenticated, paginated access to the CommCare HQ list API.
//!
//! [`CommCareHqClient::iterate`] yields records one at a time,
//! fetching pages on demand through a pluggable [`Paginator`] and
//! reporting progress to a checkpoint callback between pages.

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod client;
pub mod error;
pub mod fetch;
pub mod paginator;
pub mod resource;

pub use client::{
    CheckpointCallback, CommCareHqClient, RecordIter, RetryPolicy, REPEAT_REQUEST_LIMIT,
};
pub use error::ClientError;
pub use fetch::{Auth, FetchResponse, Fetcher, ReqwestFetcher, ScriptedFetcher};
pub use paginator::{CursorPaginator, DatePaginator, Page, PageMeta, Paginator, SimplePaginator};
pub use resource::{
    date_field, default_page_size, default_pagination_mode, DateField, DEFAULT_PAGE_SIZE,
    UCR_PAGE_SIZE,
};

use hqexport_types::checkpoint::PaginationMode;

/// Build the paginator for (resource, mode) with optional resume
/// state from a checkpoint.
#[must_use]
pub fn paginator_for(
    resource: &str,
    mode: PaginationMode,
    since: Option<String>,
    cursor: Option<String>,
    page_size: Option<u64>,
) -> Box<dyn Paginator> {
    let limit = page_size.unwrap_or_else(|| default_page_size(resource));
    match mode {
        PaginationMode::DateIndexed | PaginationMode::DateModified => {
            match date_field(resource, mode) {
                Some(field) => Box::new(DatePaginator::new(field, mode, since, limit)),
                // resources with no date field fall back to offsets
                None => Box::new(SimplePaginator::new(limit)),
            }
        }
        PaginationMode::Cursor => Box::new(CursorPaginator::new(cursor, limit)),
        PaginationMode::Offset => Box::new(SimplePaginator::new(limit)),
    }
}
