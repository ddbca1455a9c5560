//! In-process transport recording everything published, for tests.

use super::{Bound, CommandSocket, PublishSocket, Transport};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct State {
    next_port: u16,
    published: HashMap<String, Vec<Vec<Bytes>>>,
    inboxes: HashMap<String, VecDeque<Vec<Bytes>>>,
    closed: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
    fail_binds: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following bind fail until reset.
    pub fn set_fail_binds(&self, fail: bool) {
        self.fail_binds.store(fail, Ordering::SeqCst);
    }

    /// All messages published on `url`, oldest first.
    pub fn published(&self, url: &str) -> Vec<Vec<Bytes>> {
        self.state
            .lock()
            .published
            .get(url)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_published(&self, url: &str) {
        self.state.lock().published.remove(url);
    }

    /// Queue a command message for the pull socket bound at `url`.
    pub fn push_command(&self, url: &str, parts: Vec<Bytes>) {
        self.state
            .lock()
            .inboxes
            .entry(url.to_string())
            .or_default()
            .push_back(parts);
    }

    pub fn is_closed(&self, url: &str) -> bool {
        self.state.lock().closed.contains(url)
    }

    fn allocate(&self, host: &str) -> Result<String> {
        if self.fail_binds.load(Ordering::SeqCst) {
            return Err(BridgeError::BindFailed {
                endpoint: format!("tcp://{}:0", host),
                reason: "bind refused".into(),
            });
        }
        let mut state = self.state.lock();
        state.next_port += 1;
        Ok(format!("tcp://{}:{}", host, 40_000 + state.next_port))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn bind_publisher(&self, advertised_host: &str) -> Result<Bound<Box<dyn PublishSocket>>> {
        let url = self.allocate(advertised_host)?;
        Ok(Bound {
            socket: Box::new(MemoryPublisher {
                url: url.clone(),
                state: self.state.clone(),
            }),
            url,
        })
    }

    async fn bind_command(&self, advertised_host: &str) -> Result<Bound<Box<dyn CommandSocket>>> {
        let url = self.allocate(advertised_host)?;
        Ok(Bound {
            socket: Box::new(MemoryPuller {
                url: url.clone(),
                state: self.state.clone(),
            }),
            url,
        })
    }
}

struct MemoryPublisher {
    url: String,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl PublishSocket for MemoryPublisher {
    async fn send(&mut self, parts: Vec<Bytes>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed.contains(&self.url) {
            return Err(BridgeError::SendFailed {
                socket: "publish",
                reason: "socket closed".into(),
            });
        }
        state.published.entry(self.url.clone()).or_default().push(parts);
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.state.lock().closed.insert(self.url.clone());
    }
}

struct MemoryPuller {
    url: String,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl CommandSocket for MemoryPuller {
    fn try_recv(&mut self) -> Result<Option<Vec<Bytes>>> {
        Ok(self
            .state
            .lock()
            .inboxes
            .get_mut(&self.url)
            .and_then(VecDeque::pop_front))
    }

    async fn close(self: Box<Self>) {
        self.state.lock().closed.insert(self.url.clone());
    }
}
