//! The resource client: authenticated paginated iteration over list
//! endpoints, with retry, rate-limit handling, and a guard against
//! servers that never make progress.

use crate::error::ClientError;
use crate::fetch::{FetchResponse, Fetcher};
use crate::paginator::{Page, Paginator};
use hqexport_types::checkpoint::PaginationState;
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

/// Retry policy for 5xx responses and transport failures. 429s are
/// retried indefinitely after honoring `Retry-After`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=250);
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Consecutive identical requests tolerated before giving up.
pub const REPEAT_REQUEST_LIMIT: u32 = 10;

/// Callback invoked between pages with the paginator's progress.
pub type CheckpointCallback = Box<dyn FnMut(&PaginationState) -> anyhow::Result<()>>;

pub struct CommCareHqClient {
    fetcher: Rc<dyn Fetcher>,
    base_url: String,
    project: String,
    api_version: String,
    retry: RetryPolicy,
    repeat_limit: u32,
}

impl CommCareHqClient {
    pub fn new(fetcher: Rc<dyn Fetcher>, base_url: &str, project: &str) -> Self {
        Self {
            fetcher,
            base_url: base_url.trim_end_matches('/').to_owned(),
            project: project.to_owned(),
            api_version: "v0.5".to_owned(),
            retry: RetryPolicy::default(),
            repeat_limit: REPEAT_REQUEST_LIMIT,
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_repeat_limit(mut self, limit: u32) -> Self {
        self.repeat_limit = limit;
        self
    }

    fn resource_url(&self, resource: &str) -> String {
        format!(
            "{}/a/{}/api/{}/{}/",
            self.base_url, self.project, self.api_version, resource
        )
    }

    /// Iterate every record of `resource`, fetching pages on demand.
    ///
    /// `checkpoint` is called once per page that yielded records,
    /// after the page is fully buffered.
    pub fn iterate(
        &self,
        resource: &str,
        paginator: Box<dyn Paginator>,
        extra_params: Vec<(String, String)>,
        checkpoint: CheckpointCallback,
    ) -> RecordIter {
        let params = merge_params(paginator.initial_params(), &extra_params);
        RecordIter {
            fetcher: self.fetcher.clone(),
            url: self.resource_url(resource),
            retry: self.retry.clone(),
            repeat_limit: self.repeat_limit,
            paginator,
            extra_params,
            checkpoint,
            pending_params: Some(params),
            buffer: VecDeque::new(),
            previous_ids: HashSet::new(),
            last_signature: None,
            stalled_requests: 0,
            done: false,
        }
    }
}

fn merge_params(
    mut params: Vec<(String, String)>,
    extra: &[(String, String)],
) -> Vec<(String, String)> {
    for (k, v) in extra {
        if !params.iter().any(|(pk, _)| pk == k) {
            params.push((k.clone(), v.clone()));
        }
    }
    params
}

/// Lazy record stream over a paginated resource.
pub struct RecordIter {
    fetcher: Rc<dyn Fetcher>,
    url: String,
    retry: RetryPolicy,
    repeat_limit: u32,
    paginator: Box<dyn Paginator>,
    extra_params: Vec<(String, String)>,
    checkpoint: CheckpointCallback,
    pending_params: Option<Vec<(String, String)>>,
    buffer: VecDeque<serde_json::Value>,
    previous_ids: HashSet<String>,
    last_signature: Option<String>,
    stalled_requests: u32,
    done: bool,
}

impl RecordIter {
    fn fetch_with_retry(&self, params: &[(String, String)]) -> Result<FetchResponse, ClientError> {
        let mut attempt: u32 = 1;
        loop {
            let result = self.fetcher.get(&self.url, params);
            match result {
                Ok(response) if response.status == 200 => return Ok(response),
                Ok(response) if response.status == 429 => {
                    // rate limiting, not failure: wait and go again
                    let wait = response.retry_after.unwrap_or(1);
                    tracing::info!(url = %self.url, wait_secs = wait, "rate limited, waiting");
                    std::thread::sleep(Duration::from_secs(wait));
                }
                Ok(response) if response.status >= 500 => {
                    if attempt >= self.retry.max_attempts {
                        return Err(ClientError::RetriesExhausted {
                            url: self.url.clone(),
                            attempts: attempt,
                            detail: format!("status {}", response.status),
                        });
                    }
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        url = %self.url,
                        status = response.status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "server error, backing off"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Ok(response) => {
                    return Err(ClientError::Status {
                        status: response.status,
                        url: self.url.clone(),
                        body: response.body,
                    });
                }
                Err(e @ ClientError::Transport { .. }) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(ClientError::RetriesExhausted {
                            url: self.url.clone(),
                            attempts: attempt,
                            detail: e.to_string(),
                        });
                    }
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(url = %self.url, error = %e, attempt, "transport error, backing off");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch and buffer the next page. Returns `Ok(false)` when
    /// pagination has terminated.
    fn advance(&mut self) -> Result<bool, ClientError> {
        let Some(params) = self.pending_params.take() else {
            return Ok(false);
        };

        let signature = serde_json::to_string(&params).unwrap_or_default();
        if self.last_signature.as_deref() == Some(signature.as_str())
            && self.stalled_requests >= self.repeat_limit
        {
            return Err(ClientError::ResourceRepeat {
                url: self.url.clone(),
                attempts: self.stalled_requests,
            });
        }

        let response = self.fetch_with_retry(&params)?;
        let page = Page::parse(&self.url, &response.body)?;

        let mut page_ids = HashSet::new();
        let mut accepted = 0usize;
        for record in &page.objects {
            if let Some(id) = record.get("id").and_then(serde_json::Value::as_str) {
                page_ids.insert(id.to_owned());
            }
            if self.paginator.accept(record) {
                self.paginator.observe(record);
                self.buffer.push_back(record.clone());
                accepted += 1;
            }
        }

        let progressed = page_ids.is_empty() || !page_ids.is_subset(&self.previous_ids);
        if self.last_signature.as_deref() == Some(signature.as_str()) && !progressed {
            self.stalled_requests += 1;
        } else {
            self.stalled_requests = 1;
        }
        self.last_signature = Some(signature);
        self.previous_ids = page_ids;

        if accepted > 0 {
            let state = self.paginator.state();
            (self.checkpoint)(&state).map_err(|e| ClientError::Checkpoint(e.to_string()))?;
        }

        self.pending_params = self
            .paginator
            .next_params(&page)
            .map(|p| merge_params(p, &self.extra_params));
        Ok(true)
    }

    /// Final progress snapshot, for the run's closing checkpoint.
    #[must_use]
    pub fn state(&self) -> PaginationState {
        self.paginator.state()
    }
}

impl Iterator for RecordIter {
    type Item = Result<serde_json::Value, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            if self.done {
                return None;
            }
            match self.advance() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ScriptedFetcher;
    use crate::paginator::{CursorPaginator, DatePaginator, SimplePaginator};
    use crate::resource::DateField;
    use hqexport_types::checkpoint::PaginationMode;
    use serde_json::json;
    use std::cell::RefCell;

    fn no_checkpoint() -> CheckpointCallback {
        Box::new(|_| Ok(()))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn client(fetcher: Rc<ScriptedFetcher>) -> CommCareHqClient {
        CommCareHqClient::new(fetcher, "https://www.commcarehq.org", "demo")
            .with_retry_policy(fast_retry())
    }

    fn collect_ids(iter: RecordIter) -> Vec<serde_json::Value> {
        iter.map(|r| r.unwrap()["id"].clone()).collect()
    }

    #[test]
    fn resource_urls_are_project_scoped() {
        let fetcher = Rc::new(ScriptedFetcher::new());
        fetcher.push(200, r#"{"meta": {"next": null}, "objects": []}"#);
        let c = client(fetcher.clone());
        let iter = c.iterate("case", Box::new(SimplePaginator::new(20)), vec![], no_checkpoint());
        assert_eq!(iter.count(), 0);
        assert_eq!(
            fetcher.requests()[0].0,
            "https://www.commcarehq.org/a/demo/api/v0.5/case/"
        );
    }

    #[test]
    fn offset_pagination_walks_both_pages() {
        let fetcher = Rc::new(ScriptedFetcher::new());
        fetcher.push(
            200,
            r#"{"meta": {"next": "?offset=1&limit=1"}, "objects": [{"id": 1, "foo": 1}]}"#,
        );
        fetcher.push(200, r#"{"meta": {"next": null}, "objects": [{"id": 2, "foo": 2}]}"#);
        let c = client(fetcher.clone());
        let iter = c.iterate("user", Box::new(SimplePaginator::new(1)), vec![], no_checkpoint());
        assert_eq!(collect_ids(iter), vec![json!(1), json!(2)]);

        let requests = fetcher.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].1.contains(&("offset".into(), "1".into())));
    }

    #[test]
    fn date_pagination_drops_boundary_duplicates() {
        let ts = "2017-01-01T15:36:22Z";
        let fetcher = Rc::new(ScriptedFetcher::new());
        fetcher.push(
            200,
            &json!({
                "meta": {},
                "objects": [
                    {"id": "1", "indexed_on": ts},
                    {"id": "2", "indexed_on": ts}
                ]
            })
            .to_string(),
        );
        fetcher.push(
            200,
            &json!({
                "meta": {},
                "objects": [
                    {"id": "1", "indexed_on": ts},
                    {"id": "2", "indexed_on": ts},
                    {"id": "3", "indexed_on": "2017-01-02T00:00:00Z"},
                    {"id": "4", "indexed_on": "2017-01-03T00:00:00Z"}
                ]
            })
            .to_string(),
        );
        fetcher.push(200, r#"{"meta": {}, "objects": []}"#);

        let paginator = DatePaginator::new(
            DateField {
                field: "indexed_on".into(),
                start_param: "indexed_on_start".into(),
            },
            PaginationMode::DateIndexed,
            None,
            2,
        );
        let c = client(fetcher.clone());
        let iter = c.iterate("form", Box::new(paginator), vec![], no_checkpoint());
        assert_eq!(
            collect_ids(iter),
            vec![json!("1"), json!("2"), json!("3"), json!("4")]
        );
        assert!(fetcher.requests()[1]
            .1
            .contains(&("indexed_on_start".into(), "2017-01-01T15:36:22".into())));
    }

    #[test]
    fn checkpoint_callback_runs_once_per_productive_page() {
        let fetcher = Rc::new(ScriptedFetcher::new());
        fetcher.push(
            200,
            r#"{"meta": {"next": "?offset=1"}, "objects": [{"id": "doc 1"}]}"#,
        );
        fetcher.push(200, r#"{"meta": {"next": null}, "objects": [{"id": "doc 2"}]}"#);
        let states: Rc<RefCell<Vec<PaginationState>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = states.clone();
        let cb: CheckpointCallback = Box::new(move |state| {
            sink.borrow_mut().push(state.clone());
            Ok(())
        });
        let c = client(fetcher);
        let iter = c.iterate("user", Box::new(SimplePaginator::new(1)), vec![], cb);
        assert_eq!(iter.count(), 2);
        let states = states.borrow();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].last_doc_id.as_deref(), Some("doc 1"));
        assert_eq!(states[1].last_doc_id.as_deref(), Some("doc 2"));
    }

    #[test]
    fn rate_limit_with_zero_wait_retries_immediately() {
        let fetcher = Rc::new(ScriptedFetcher::new());
        fetcher.push_response(FetchResponse {
            status: 429,
            retry_after: Some(0),
            body: String::new(),
        });
        fetcher.push(200, r#"{"meta": {"next": null}, "objects": [{"id": 1}]}"#);
        let c = client(fetcher);
        let iter = c.iterate("case", Box::new(SimplePaginator::new(20)), vec![], no_checkpoint());
        assert_eq!(collect_ids(iter), vec![json!(1)]);
    }

    #[test]
    fn server_errors_retry_then_succeed() {
        let fetcher = Rc::new(ScriptedFetcher::new());
        fetcher.push(500, "oops");
        fetcher.push(502, "oops");
        fetcher.push(200, r#"{"meta": {"next": null}, "objects": [{"id": 1}]}"#);
        let c = client(fetcher);
        let iter = c.iterate("case", Box::new(SimplePaginator::new(20)), vec![], no_checkpoint());
        assert_eq!(collect_ids(iter), vec![json!(1)]);
    }

    #[test]
    fn server_errors_exhaust_the_retry_budget() {
        let fetcher = Rc::new(ScriptedFetcher::new());
        for _ in 0..3 {
            fetcher.push(500, "oops");
        }
        let c = client(fetcher);
        let mut iter =
            c.iterate("case", Box::new(SimplePaginator::new(20)), vec![], no_checkpoint());
        match iter.next() {
            Some(Err(ClientError::RetriesExhausted { attempts, .. })) => assert_eq!(attempts, 3),
            other => panic!("expected retries exhausted, got {other:?}"),
        }
    }

    #[test]
    fn auth_failure_is_fatal_immediately() {
        let fetcher = Rc::new(ScriptedFetcher::new());
        fetcher.push(401, "unauthorized");
        let c = client(fetcher.clone());
        let mut iter =
            c.iterate("case", Box::new(SimplePaginator::new(20)), vec![], no_checkpoint());
        match iter.next() {
            Some(Err(ClientError::Status { status, .. })) => assert_eq!(status, 401),
            other => panic!("expected status error, got {other:?}"),
        }
        assert_eq!(fetcher.requests().len(), 1);
    }

    #[test]
    fn repeat_guard_raises_after_the_limit() {
        let fetcher = Rc::new(ScriptedFetcher::new());
        // same params, same single record, forever
        for _ in 0..12 {
            fetcher.push(
                200,
                r#"{"meta": {"next": "?offset=0&limit=1"}, "objects": [{"id": "stuck"}]}"#,
            );
        }
        let c = client(fetcher).with_repeat_limit(3);
        let iter = c.iterate("case", Box::new(SimplePaginator::new(1)), vec![], no_checkpoint());
        let results: Vec<_> = iter.collect();
        match results.last() {
            Some(Err(ClientError::ResourceRepeat { attempts, .. })) => assert_eq!(*attempts, 3),
            other => panic!("expected repeat guard to fire, got {other:?}"),
        }
    }

    #[test]
    fn extra_params_ride_along_every_request() {
        let fetcher = Rc::new(ScriptedFetcher::new());
        fetcher.push(
            200,
            r#"{"meta": {"next": "?offset=1&limit=1"}, "objects": [{"id": 1}]}"#,
        );
        fetcher.push(200, r#"{"meta": {"next": null}, "objects": []}"#);
        let c = client(fetcher.clone());
        let extra = vec![("app_id".to_owned(), "abc123".to_owned())];
        let iter = c.iterate("form", Box::new(SimplePaginator::new(1)), extra, no_checkpoint());
        assert_eq!(iter.count(), 1);
        for (_, params) in fetcher.requests() {
            assert!(params.contains(&("app_id".into(), "abc123".into())));
        }
    }
}
