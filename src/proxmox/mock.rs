//! Scripted in-memory transport for exercising the tracker and orchestrator.

use super::error::{ProxmoxError, Result};
use super::transport::Transport;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Debug)]
pub enum Reply {
    Data(Value),
    Status(u16, String),
    Transport(String),
    /// Answer only after the given delay.
    After(Duration, Box<Reply>),
}

impl Reply {
    fn into_result(self) -> Result<Value> {
        match self {
            Reply::Data(v) => Ok(v),
            Reply::Status(code, msg) => Err(ProxmoxError::from_status(code, msg)),
            Reply::Transport(msg) => Err(ProxmoxError::Transport(msg)),
            Reply::After(_, inner) => inner.into_result(),
        }
    }
}

/// Routes are keyed by method and path (query string stripped). Each route replays its
/// replies in order and keeps repeating the last one.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<(String, String), VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, method: Method, path: &str, replies: Vec<Reply>) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert((method.to_string(), path.to_string()), replies.into());
        self
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, p)| *m == method.as_str() && p == path)
            .count()
    }

    pub fn mutating_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m != "GET")
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn invoke(&self, method: Method, path: &str, _body: Option<&Value>) -> Result<Value> {
        let bare = path.split('?').next().unwrap_or(path).to_string();
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), bare.clone()));

        let reply = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(&(method.to_string(), bare.clone())) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        // Yield so concurrent callers interleave the way they would on a socket.
        tokio::task::yield_now().await;
        if let Some(Reply::After(wait, _)) = &reply {
            tokio::time::sleep(*wait).await;
        }

        match reply {
            Some(r) => r.into_result(),
            None => Err(ProxmoxError::NotFound(format!("no mock route for {} {}", method, bare))),
        }
    }
}
