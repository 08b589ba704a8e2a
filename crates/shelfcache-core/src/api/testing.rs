//! Scripted transport for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::error::ApiError;
use super::request::HttpRequest;
use super::transport::HttpTransport;

type ErrorFactory = Box<dyn Fn() -> ApiError + Send + Sync>;

enum Script {
    Respond(Value),
    Fail(ErrorFactory),
}

/// Answers by URL. Unscripted URLs return `null`; `set_down(true)` fails
/// every call with a network error.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<HttpRequest>>,
    down: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, body: Value) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), Script::Respond(body));
    }

    pub fn fail<F>(&self, url: &str, error: F)
    where
        F: Fn() -> ApiError + Send + Sync + 'static,
    {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), Script::Fail(Box::new(error)));
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn call(&self, request: &HttpRequest) -> Result<Value, ApiError> {
        self.calls.lock().unwrap().push(request.clone());

        if self.down.load(Ordering::SeqCst) {
            return Err(ApiError::Network("connection refused".into()));
        }
        match self.scripts.lock().unwrap().get(&request.url) {
            Some(Script::Respond(body)) => Ok(body.clone()),
            Some(Script::Fail(error)) => Err(error()),
            None => Ok(Value::Null),
        }
    }
}
