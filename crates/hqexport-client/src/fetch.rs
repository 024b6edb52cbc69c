//! HTTP transport.
//!
//! The [`Fetcher`] trait isolates the wire so pagination and retry
//! logic can run against scripted responses in tests.

use crate::error::ClientError;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;

/// One raw response, before retry policy is applied.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    /// Seconds from a `Retry-After` header, when present.
    pub retry_after: Option<u64>,
    pub body: String,
}

pub trait Fetcher {
    fn get(&self, url: &str, params: &[(String, String)]) -> Result<FetchResponse, ClientError>;
}

/// Authentication mode, fixed per client instance.
#[derive(Debug, Clone)]
pub enum Auth {
    Basic { username: String, password: String },
    ApiKey { username: String, key: String },
    Bearer { token: String },
    SessionCookie { cookie: String },
}

/// Real transport over a blocking HTTP client.
pub struct ReqwestFetcher {
    client: reqwest::blocking::Client,
    auth: Auth,
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

impl ReqwestFetcher {
    pub fn new(auth: Auth, user_agent: &str) -> Result<Self, ClientError> {
        Self::with_timeout(auth, user_agent, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        auth: Auth,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Transport {
                url: String::new(),
                detail: format!("could not build HTTP client: {e}"),
            })?;
        Ok(Self { client, auth })
    }
}

impl Fetcher for ReqwestFetcher {
    fn get(&self, url: &str, params: &[(String, String)]) -> Result<FetchResponse, ClientError> {
        let mut request = self.client.get(url).query(params);
        request = match &self.auth {
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
            Auth::ApiKey { username, key } => {
                request.header(reqwest::header::AUTHORIZATION, format!("ApiKey {username}:{key}"))
            }
            Auth::Bearer { token } => request.bearer_auth(token),
            Auth::SessionCookie { cookie } => {
                request.header(reqwest::header::COOKIE, cookie.clone())
            }
        };

        let response = request.send().map_err(|e| ClientError::Transport {
            url: url.to_owned(),
            detail: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let body = response.text().map_err(|e| ClientError::Transport {
            url: url.to_owned(),
            detail: e.to_string(),
        })?;

        Ok(FetchResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// Canned transport for tests: pops one response per request and
/// records what was asked for.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: RefCell<VecDeque<FetchResponse>>,
    requests: RefCell<Vec<(String, Vec<(String, String)>)>>,
}

impl ScriptedFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, status: u16, body: &str) {
        self.responses.borrow_mut().push_back(FetchResponse {
            status,
            retry_after: None,
            body: body.to_owned(),
        });
    }

    pub fn push_response(&self, response: FetchResponse) {
        self.responses.borrow_mut().push_back(response);
    }

    /// Everything requested so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.requests.borrow().clone()
    }
}

impl Fetcher for ScriptedFetcher {
    fn get(&self, url: &str, params: &[(String, String)]) -> Result<FetchResponse, ClientError> {
        self.requests
            .borrow_mut()
            .push((url.to_owned(), params.to_vec()));
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| ClientError::BadResponse {
                url: url.to_owned(),
                detail: "script exhausted".to_owned(),
            })
    }
}
