//! Named publish/subscribe topics
//!
//! Each subscriber owns a bounded queue; publishing clones the message into
//! every queue in publication order. A topic may carry a validator that
//! rejects messages synchronously, before anything is queued. Every wait,
//! including the one for a concurrent publisher, is bounded by the publish
//! timeout.

use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::PublishError;

pub type Validator<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

pub struct Topic<T> {
    name: &'static str,
    validator: Option<Validator<T>>,
    subscribers: RwLock<Vec<mpsc::Sender<T>>>,
    /// Serializes publishers so every queue sees the same order
    order: Mutex<()>,
}

impl<T: Clone + Send + 'static> Topic<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            validator: None,
            subscribers: RwLock::new(Vec::new()),
            order: Mutex::new(()),
        }
    }

    pub fn with_validator(
        name: &'static str,
        validator: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            validator: Some(Box::new(validator)),
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Add a subscriber with its own queue of `capacity` messages
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.write().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn validate(&self, msg: &T) -> bool {
        self.validator.as_ref().map_or(true, |v| v(msg))
    }

    /// Publish one message, waiting at most `timeout` for a concurrent
    /// publisher and at most `timeout` per full subscriber queue
    pub async fn publish(&self, msg: T, timeout: Duration) -> Result<(), PublishError> {
        if !self.validate(&msg) {
            return Err(PublishError::Rejected(self.name));
        }
        let Ok(_order) = tokio::time::timeout(timeout, self.order.lock()).await else {
            warn!(topic = self.name, "Topic busy, message dropped");
            return Err(PublishError::Timeout(self.name));
        };
        self.deliver(msg, timeout).await
    }

    async fn deliver(&self, msg: T, timeout: Duration) -> Result<(), PublishError> {
        let subscribers = self.subscribers.read().clone();
        let Some((last, rest)) = subscribers.split_last() else {
            debug!(topic = self.name, "No subscribers, message dropped");
            return Ok(());
        };

        let mut result = Ok(());
        for tx in rest {
            if let Err(e) = self.send_one(tx, msg.clone(), timeout).await {
                result = Err(e);
            }
        }
        if let Err(e) = self.send_one(last, msg, timeout).await {
            result = Err(e);
        }

        if subscribers.iter().any(|tx| tx.is_closed()) {
            self.subscribers.write().retain(|tx| !tx.is_closed());
        }
        result
    }

    async fn send_one(
        &self,
        tx: &mpsc::Sender<T>,
        msg: T,
        timeout: Duration,
    ) -> Result<(), PublishError> {
        match tx.send_timeout(msg, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(topic = self.name, "Subscriber queue full, message dropped");
                Err(PublishError::Timeout(self.name))
            }
            Err(SendTimeoutError::Closed(_)) => Err(PublishError::Closed(self.name)),
        }
    }
}
