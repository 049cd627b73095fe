//! Request transport
//!
//! The storage layer only builds requests; executing them (connection,
//! authentication header, JSON parsing) is the job of a [`Transport`].
//! [`HttpTransport`] is the production implementation on top of a blocking
//! reqwest client.

use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::storage::{StorageError, StorageResult};

/// User agent sent with every request
const USER_AGENT: &str = concat!("tabstore/", env!("CARGO_PKG_VERSION"));

/// HTTP method used by the action API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A request against the DataStore action API
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub url: String,
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub body: Option<Json>,
}

impl Request {
    /// GET request without parameters
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            query: Vec::new(),
            body: None,
        }
    }

    /// POST request carrying a JSON body
    pub fn post(url: impl Into<String>, body: Json) -> Self {
        Self {
            url: url.into(),
            method: Method::Post,
            query: Vec::new(),
            body: Some(body),
        }
    }

    /// Append a query parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Look up a query parameter
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Executes requests and returns the parsed JSON response
///
/// Implementations fail only on transport problems; logical DataStore
/// errors come back as a normal JSON envelope.
pub trait Transport {
    fn request(&self, request: &Request) -> StorageResult<Json>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn request(&self, request: &Request) -> StorageResult<Json> {
        (**self).request(request)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn request(&self, request: &Request) -> StorageResult<Json> {
        (**self).request(request)
    }
}

/// API key, given literally or as `env:NAME`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Literal(String),
    Env(String),
}

impl Credential {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix("env:") {
            Some(name) => Credential::Env(name.to_string()),
            None => Credential::Literal(raw.to_string()),
        }
    }

    /// Resolve the key; an unset environment variable yields `None`
    pub fn resolve(&self) -> Option<String> {
        match self {
            Credential::Literal(key) => Some(key.clone()),
            Credential::Env(name) => match std::env::var(name) {
                Ok(key) => Some(key),
                Err(_) => {
                    warn!("API key variable {} is not set; sending unauthenticated request", name);
                    None
                }
            },
        }
    }
}

/// Blocking HTTP transport
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    credential: Option<Credential>,
}

impl HttpTransport {
    pub fn new(credential: Option<Credential>, timeout: Duration) -> StorageResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client, credential })
    }
}

impl Transport for HttpTransport {
    fn request(&self, request: &Request) -> StorageResult<Json> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }
        if let Some(key) = self.credential.as_ref().and_then(Credential::resolve) {
            builder = builder.header(AUTHORIZATION, key);
        }

        debug!("{:?} {} {:?}", request.method, request.url, request.query);
        let response = builder.send()?;
        let status = response.status();
        let text = response.text()?;

        // Action API errors come with 4xx codes but still carry a JSON envelope
        match serde_json::from_str::<Json>(&text) {
            Ok(value) => Ok(value),
            Err(e) if status.is_success() => Err(e.into()),
            Err(_) => Err(StorageError::Http {
                status: status.as_u16(),
                body: text,
            }),
        }
    }
}

/// In-memory transport for tests, also available to dependent crates
/// through the `test-util` feature
#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;

    /// Replays canned responses in order and records every request
    #[derive(Default)]
    pub struct MockTransport {
        responses: RefCell<VecDeque<Json>>,
        requests: RefCell<Vec<Request>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, response: Json) -> &Self {
            self.responses.borrow_mut().push_back(response);
            self
        }

        pub fn requests(&self) -> Vec<Request> {
            self.requests.borrow().clone()
        }

        pub fn request_count(&self) -> usize {
            self.requests.borrow().len()
        }
    }

    impl Transport for MockTransport {
        fn request(&self, request: &Request) -> StorageResult<Json> {
            self.requests.borrow_mut().push(request.clone());
            self.responses
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| StorageError::Http {
                    status: 404,
                    body: format!("no canned response for {}", request.url),
                })
        }
    }
}
