//! Pagination strategies.
//!
//! A paginator turns response metadata into the next request's
//! parameters and carries the progress snapshot used for
//! checkpointing. The date-windowed strategy also filters boundary
//! duplicates client-side.

use crate::error::ClientError;
use crate::resource::DateField;
use hqexport_types::checkpoint::{format_since, parse_timestamp, PaginationMode, PaginationState};
use serde::Deserialize;
use std::collections::HashSet;

/// Response metadata, as returned by the list endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub total_count: Option<u64>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// One parsed page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub meta: PageMeta,
    #[serde(default)]
    pub objects: Vec<serde_json::Value>,
}

impl Page {
    pub fn parse(url: &str, body: &str) -> Result<Self, ClientError> {
        serde_json::from_str(body).map_err(|e| ClientError::BadResponse {
            url: url.to_owned(),
            detail: e.to_string(),
        })
    }
}

pub trait Paginator {
    /// Parameters for the first request.
    fn initial_params(&self) -> Vec<(String, String)>;

    /// Parameters for the page after `page`; `None` terminates.
    fn next_params(&mut self, page: &Page) -> Option<Vec<(String, String)>>;

    /// Client-side filter applied before a record is yielded.
    fn accept(&mut self, _record: &serde_json::Value) -> bool {
        true
    }

    /// Called for every accepted record, in delivery order.
    fn observe(&mut self, record: &serde_json::Value);

    /// Progress snapshot for the checkpoint written after this page.
    fn state(&self) -> PaginationState;

    fn mode(&self) -> PaginationMode;
}

fn record_id(record: &serde_json::Value) -> Option<String> {
    match record.get("id") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Offset/limit paging driven by `meta.next`.
pub struct SimplePaginator {
    limit: u64,
    offset: u64,
    last_doc_id: Option<String>,
}

impl SimplePaginator {
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            offset: 0,
            last_doc_id: None,
        }
    }
}

impl Paginator for SimplePaginator {
    fn initial_params(&self) -> Vec<(String, String)> {
        vec![
            ("limit".to_owned(), self.limit.to_string()),
            ("offset".to_owned(), self.offset.to_string()),
        ]
    }

    fn next_params(&mut self, page: &Page) -> Option<Vec<(String, String)>> {
        let next = page.meta.next.as_deref()?;
        if next.is_empty() {
            return None;
        }
        // meta.next is a URL-encoded query string; fall back to
        // advancing the offset ourselves if it carries no offset.
        let mut params = parse_query_string(next);
        if !params.iter().any(|(k, _)| k == "offset") {
            self.offset += self.limit;
            params.push(("offset".to_owned(), self.offset.to_string()));
        } else if let Some((_, v)) = params.iter().find(|(k, _)| k == "offset") {
            self.offset = v.parse().unwrap_or(self.offset + self.limit);
        }
        if !params.iter().any(|(k, _)| k == "limit") {
            params.push(("limit".to_owned(), self.limit.to_string()));
        }
        Some(params)
    }

    fn observe(&mut self, record: &serde_json::Value) {
        if let Some(id) = record_id(record) {
            self.last_doc_id = Some(id);
        }
    }

    fn state(&self) -> PaginationState {
        PaginationState {
            since: None,
            cursor: None,
            last_doc_id: self.last_doc_id.clone(),
        }
    }

    fn mode(&self) -> PaginationMode {
        PaginationMode::Offset
    }
}

/// Date-windowed paging, ascending on one timestamp field.
///
/// Each page's request carries `<field>_start` set to the maximum
/// timestamp of the previous page. Records at exactly that boundary
/// timestamp reappear on the next page, so their ids are filtered.
pub struct DatePaginator {
    date: DateField,
    limit: u64,
    mode: PaginationMode,
    since: Option<String>,
    boundary_ids: HashSet<String>,
    page_max: Option<String>,
    page_ids_at_max: HashSet<String>,
    last_doc_id: Option<String>,
}

impl DatePaginator {
    #[must_use]
    pub fn new(date: DateField, mode: PaginationMode, since: Option<String>, limit: u64) -> Self {
        Self {
            date,
            limit,
            mode,
            since,
            boundary_ids: HashSet::new(),
            page_max: None,
            page_ids_at_max: HashSet::new(),
            last_doc_id: None,
        }
    }

    fn window_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("limit".to_owned(), self.limit.to_string()),
            ("order_by".to_owned(), self.date.field.clone()),
        ];
        if let Some(since) = &self.since {
            params.push((self.date.start_param.clone(), since.clone()));
        }
        params
    }

    fn record_timestamp(&self, record: &serde_json::Value) -> Option<String> {
        record
            .get(&self.date.field)
            .and_then(serde_json::Value::as_str)
            .and_then(parse_timestamp)
            .map(format_since)
    }
}

impl Paginator for DatePaginator {
    fn initial_params(&self) -> Vec<(String, String)> {
        self.window_params()
    }

    fn next_params(&mut self, page: &Page) -> Option<Vec<(String, String)>> {
        if page.objects.is_empty() || (page.objects.len() as u64) < self.limit {
            return None;
        }
        // the window start never moves backwards, even if the server
        // hands back something stale
        if let Some(max) = self.page_max.take() {
            if self.since.as_ref().map_or(true, |s| max >= *s) {
                self.since = Some(max);
                self.boundary_ids = std::mem::take(&mut self.page_ids_at_max);
            } else {
                self.page_ids_at_max.clear();
            }
        }
        Some(self.window_params())
    }

    fn accept(&mut self, record: &serde_json::Value) -> bool {
        match record_id(record) {
            Some(id) => !self.boundary_ids.contains(&id),
            None => true,
        }
    }

    fn observe(&mut self, record: &serde_json::Value) {
        let id = record_id(record);
        if let Some(ts) = self.record_timestamp(record) {
            match &self.page_max {
                Some(max) if ts < *max => {}
                Some(max) if ts == *max => {
                    if let Some(id) = &id {
                        self.page_ids_at_max.insert(id.clone());
                    }
                }
                _ => {
                    self.page_max = Some(ts);
                    self.page_ids_at_max.clear();
                    if let Some(id) = &id {
                        self.page_ids_at_max.insert(id.clone());
                    }
                }
            }
        }
        if let Some(id) = id {
            self.last_doc_id = Some(id);
        }
    }

    fn state(&self) -> PaginationState {
        let since = match (&self.page_max, &self.since) {
            (Some(max), Some(since)) => Some(max.clone().max(since.clone())),
            (Some(only), None) | (None, Some(only)) => Some(only.clone()),
            (None, None) => None,
        };
        PaginationState {
            since,
            cursor: None,
            last_doc_id: self.last_doc_id.clone(),
        }
    }

    fn mode(&self) -> PaginationMode {
        self.mode
    }
}

/// Opaque-cursor paging (messaging-event).
pub struct CursorPaginator {
    limit: u64,
    cursor: Option<String>,
    last_doc_id: Option<String>,
}

impl CursorPaginator {
    #[must_use]
    pub fn new(cursor: Option<String>, limit: u64) -> Self {
        Self {
            limit,
            cursor,
            last_doc_id: None,
        }
    }

    fn cursor_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("limit".to_owned(), self.limit.to_string())];
        if let Some(cursor) = &self.cursor {
            params.push(("cursor".to_owned(), cursor.clone()));
        }
        params
    }
}

impl Paginator for CursorPaginator {
    fn initial_params(&self) -> Vec<(String, String)> {
        self.cursor_params()
    }

    fn next_params(&mut self, page: &Page) -> Option<Vec<(String, String)>> {
        if page.objects.is_empty() {
            return None;
        }
        let next_cursor = page.meta.cursor.clone().or_else(|| {
            page.meta
                .next
                .as_deref()
                .and_then(|next| {
                    parse_query_string(next)
                        .into_iter()
                        .find(|(k, _)| k == "cursor")
                })
                .map(|(_, v)| v)
        })?;
        self.cursor = Some(next_cursor);
        Some(self.cursor_params())
    }

    fn observe(&mut self, record: &serde_json::Value) {
        if let Some(id) = record_id(record) {
            self.last_doc_id = Some(id);
        }
    }

    fn state(&self) -> PaginationState {
        PaginationState {
            since: None,
            cursor: self.cursor.clone(),
            last_doc_id: self.last_doc_id.clone(),
        }
    }

    fn mode(&self) -> PaginationMode {
        PaginationMode::Cursor
    }
}

/// Parse a `?key=value&...` query string (a `meta.next` value).
fn parse_query_string(s: &str) -> Vec<(String, String)> {
    let qs = s
        .rsplit_once('?')
        .map_or(s, |(_, q)| q)
        .trim_start_matches('?');
    url::form_urlencoded::parse(qs.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
