//! # Mock Link & Testing Guide
//!
//! `MockLink` implements [`Link`] entirely in memory. It lets you script the server's
//! answers and then assert on what the client sent, so client logic (the
//! [`SubscriptionManager`](crate::client::SubscriptionManager) in particular) can be
//! tested without sockets or a running server.
//!
//! ## When to use the mock vs a real server
//!
//! | Feature | MockLink | ChannelServer + NetClient |
//! |---------|----------|---------------------------|
//! | **Speed** | Instant (in-memory) | Fast, but binds a socket |
//! | **Determinism** | Fully scripted | Subject to the scheduler |
//! | **Use case** | Client-side bookkeeping | Channel behavior, end-to-end flows |
//! | **Error injection** | `return_err` | Needs real failing state |
//!
//! ## Example
//!
//! ```rust
//! use channel_fabric::client::SubscriptionManager;
//! use channel_fabric::mock::MockLink;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let link = Arc::new(MockLink::new());
//!     link.expect_request("subscribe").return_ok(json!(null));
//!
//!     let manager = SubscriptionManager::new(link.clone());
//!     manager.handle_connect("u1").await;
//!     manager.subscribe("room.lobby").await.unwrap();
//!     manager.subscribe("room.lobby").await.unwrap(); // refcounted, no second request
//!
//!     link.verify();
//!     assert_eq!(link.requests(), vec![("subscribe".to_string(), json!("room.lobby"))]);
//! }
//! ```
//!
//! ## Failure scenarios
//!
//! `return_err` makes the next matching request fail with any [`FabricError`], which is
//! how routing failures (`ERR_NOT_FOUND`) or a dropped connection (`ERR_DISCONNECTED`)
//! are simulated.

use crate::client::Link;
use crate::error::FabricError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

struct Expectation {
    msg: String,
    response: Result<Value, FabricError>,
}

/// A scripted [`Link`].
///
/// Requests are matched against expectations in order. A request with no expectation
/// left, or with a different message name, panics.
///
/// ```ignore
/// let link = MockLink::new();
/// link.expect_request("login").return_ok(json!({ "display_name": "Alice" }));
/// link.expect_request("subscribe").return_err(FabricError::NotFound);
/// // drive client code...
/// link.verify(); // all expectations consumed
/// ```
#[derive(Default)]
pub struct MockLink {
    expectations: Arc<Mutex<VecDeque<Expectation>>>,
    requests: Mutex<Vec<(String, Value)>>,
    sends: Mutex<Vec<(String, Value)>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expects a request named `msg`.
    pub fn expect_request(&self, msg: &str) -> RequestExpectationBuilder {
        RequestExpectationBuilder {
            msg: msg.to_string(),
            expectations: self.expectations.clone(),
        }
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }

    /// Every fire-and-forget message seen so far, in order.
    pub fn sends(&self) -> Vec<(String, Value)> {
        self.sends.lock().unwrap().clone()
    }

    /// Panics unless every expectation was consumed.
    pub fn verify(&self) {
        let exps = self.expectations.lock().unwrap();
        if !exps.is_empty() {
            let left: Vec<&str> = exps.iter().map(|e| e.msg.as_str()).collect();
            panic!("Not all expectations were met. {} remaining: {left:?}", exps.len());
        }
    }
}

#[async_trait]
impl Link for MockLink {
    async fn send(&self, msg: &str, data: Value) -> Result<(), FabricError> {
        self.sends.lock().unwrap().push((msg.to_string(), data));
        Ok(())
    }

    async fn request(&self, msg: &str, data: Value) -> Result<Value, FabricError> {
        self.requests.lock().unwrap().push((msg.to_string(), data));
        let expectation = self.expectations.lock().unwrap().pop_front();
        match expectation {
            Some(exp) if exp.msg == msg => exp.response,
            Some(exp) => panic!("Unexpected request {msg:?}, expected {:?}", exp.msg),
            None => panic!("Unexpected request {msg:?}, no expectations left"),
        }
    }
}

/// Builder for request expectations.
pub struct RequestExpectationBuilder {
    msg: String,
    expectations: Arc<Mutex<VecDeque<Expectation>>>,
}

impl RequestExpectationBuilder {
    /// Sets the expectation to return a successful result.
    pub fn return_ok(self, value: Value) {
        self.expectations.lock().unwrap().push_back(Expectation {
            msg: self.msg,
            response: Ok(value),
        });
    }

    /// Sets the expectation to return an error.
    pub fn return_err(self, error: FabricError) {
        self.expectations.lock().unwrap().push_back(Expectation {
            msg: self.msg,
            response: Err(error),
        });
    }
}
