//! Pluggable message queue for outgoing activities
//!
//! When a queue is configured,
//! [send_activity](crate::federation::Federation::send_activity) enqueues one
//! message per target inbox instead of delivering inline, and a listener
//! drains them concurrently. Backends must provide at-least-once delivery;
//! the engine tolerates duplicates on the inbox side only.

use crate::error::Error;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use tracing::warn;

/// Handler invoked for every dequeued message.
pub type MessageHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Durable message queue with delayed enqueue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a message, to become visible after `delay` if given.
    async fn enqueue(&self, message: Value, delay: Option<Duration>) -> Result<(), Error>;

    /// Consume messages until the queue shuts down, invoking `handler` for
    /// each. Messages are processed concurrently; no ordering is promised
    /// between them.
    async fn listen(&self, handler: MessageHandler) -> Result<(), Error>;
}

/// In-process [MessageQueue] backed by an unbounded tokio channel. Messages
/// do not survive a restart; production deployments should plug in a durable
/// backend.
pub struct InProcessQueue {
    sender: mpsc::UnboundedSender<Value>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    worker_count: usize,
}

impl InProcessQueue {
    /// Create a queue draining up to 8 messages concurrently.
    pub fn new() -> InProcessQueue {
        InProcessQueue::with_workers(8)
    }

    /// Create a queue draining up to `worker_count` messages concurrently.
    pub fn with_workers(worker_count: usize) -> InProcessQueue {
        let (sender, receiver) = mpsc::unbounded_channel();
        InProcessQueue {
            sender,
            receiver: Mutex::new(Some(receiver)),
            worker_count,
        }
    }
}

impl Default for InProcessQueue {
    fn default() -> Self {
        InProcessQueue::new()
    }
}

#[async_trait]
impl MessageQueue for InProcessQueue {
    async fn enqueue(&self, message: Value, delay: Option<Duration>) -> Result<(), Error> {
        match delay {
            None => self
                .sender
                .send(message)
                .map_err(|e| Error::Queue(e.to_string())),
            Some(delay) => {
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if sender.send(message).is_err() {
                        warn!("Queue closed before a delayed message became due");
                    }
                });
                Ok(())
            }
        }
    }

    async fn listen(&self, handler: MessageHandler) -> Result<(), Error> {
        let mut receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Queue("Queue is already being listened on".to_string()))?;

        let mut join_set = JoinSet::new();
        while let Some(message) = receiver.recv().await {
            // bound concurrency the same way the send workers do
            while join_set.len() >= self.worker_count {
                join_set.join_next().await;
            }
            join_set.spawn(handler(message));
        }
        while join_set.join_next().await.is_some() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Instant,
    };

    #[tokio::test]
    async fn test_enqueue_and_drain() {
        let queue = Arc::new(InProcessQueue::new());
        let seen = Arc::new(AtomicUsize::new(0));

        for i in 0..10 {
            queue.enqueue(json!({ "i": i }), None).await.unwrap();
        }

        let handler_seen = seen.clone();
        let handler: MessageHandler = Arc::new(move |_msg| {
            let seen = handler_seen.clone();
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        });

        let listener = queue.clone();
        tokio::spawn(async move {
            listener.listen(handler).await.ok();
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.load(Ordering::SeqCst) < 10 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all messages processed");
    }

    #[tokio::test]
    async fn test_delayed_enqueue() {
        let queue = Arc::new(InProcessQueue::new());
        let delivered = Arc::new(Mutex::new(None::<Instant>));

        let handler_delivered = delivered.clone();
        let handler: MessageHandler = Arc::new(move |_msg| {
            let delivered = handler_delivered.clone();
            Box::pin(async move {
                *delivered.lock().await = Some(Instant::now());
            })
        });

        let listener = queue.clone();
        tokio::spawn(async move {
            listener.listen(handler).await.ok();
        });

        let start = Instant::now();
        queue
            .enqueue(json!({}), Some(Duration::from_millis(100)))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if delivered.lock().await.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("delayed message processed");

        let at = delivered.lock().await.expect("delivered");
        assert!(at.duration_since(start) >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_second_listener_rejected() {
        let queue = InProcessQueue::new();
        let handler: MessageHandler = Arc::new(|_msg| Box::pin(async {}));
        // drop the channel sender side is still alive, so listen() would block;
        // taking the receiver twice is the observable error
        let mut guard = queue.receiver.lock().await;
        guard.take();
        drop(guard);
        assert!(queue.listen(handler).await.is_err());
    }
}
