//! Per-sender dispatch
//!
//! Each whitelisted sender gets a FIFO queue drained by its own worker task,
//! so one sender's commands run strictly in arrival order while different
//! senders proceed in parallel. Unauthorised senders never get a queue, and a
//! worker that sits idle retires and drops its queue.

use async_channel::TrySendError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pipeline::{reply, Pipeline};

/// How long a sender's worker waits for a message before retiring
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

type Queues = Arc<DashMap<String, async_channel::Sender<String>>>;

/// Message received from a sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: String,
    pub text: String,
}

impl InboundMessage {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
        }
    }
}

/// Reply to forward to a sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReply {
    pub sender: String,
    pub text: String,
}

pub struct Dispatcher {
    pipeline: Arc<Pipeline>,
    queues: Queues,
    replies: mpsc::Sender<OutboundReply>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queue_capacity: usize,
    idle_timeout: Duration,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        pipeline: Arc<Pipeline>,
        replies: mpsc::Sender<OutboundReply>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            pipeline,
            queues: Arc::new(DashMap::new()),
            replies,
            workers: Mutex::new(Vec::new()),
            queue_capacity: queue_capacity.max(1),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Queue a message behind earlier ones from the same sender
    pub async fn dispatch(&self, message: InboundMessage) -> Result<()> {
        let InboundMessage { sender, text } = message;

        if !self.pipeline.is_whitelisted(&sender).await {
            warn!(sender = %sender, "Dropping message from unauthorised sender");
            let outbound = OutboundReply {
                sender: sender.clone(),
                text: reply::unauthorised(),
            };
            return self
                .replies
                .send(outbound)
                .await
                .map_err(|_| Error::DispatchClosed(sender));
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::DispatchClosed(sender));
        }

        // Enqueue under the map entry so an idle worker cannot retire the
        // queue between lookup and send
        let (queue, text) = {
            let entry = self
                .queues
                .entry(sender.clone())
                .or_insert_with(|| self.spawn_worker(&sender));
            match entry.try_send(text) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(text)) => (entry.value().clone(), text),
                Err(TrySendError::Closed(_)) => return Err(Error::DispatchClosed(sender)),
            }
        };

        debug!(sender = %sender, "Sender queue full, waiting");
        queue
            .send(text)
            .await
            .map_err(|_| Error::DispatchClosed(sender))
    }

    fn spawn_worker(&self, sender: &str) -> async_channel::Sender<String> {
        let (tx, rx) = async_channel::bounded(self.queue_capacity);
        let handle = tokio::spawn(worker(
            Arc::clone(&self.pipeline),
            sender.to_string(),
            rx,
            self.replies.clone(),
            Arc::clone(&self.queues),
            self.idle_timeout,
        ));

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.retain(|w| !w.is_finished());
        workers.push(handle);
        tx
    }

    /// Senders with a live queue
    pub fn active_senders(&self) -> usize {
        self.queues.len()
    }

    /// Stop accepting messages, drain queued ones and wait for workers
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for queue in self.queues.iter() {
            queue.close();
        }
        self.queues.clear();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        info!(workers = workers.len(), "Waiting for sender workers to drain");
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Sender worker ended abnormally");
            }
        }
    }
}

async fn worker(
    pipeline: Arc<Pipeline>,
    sender: String,
    queue: async_channel::Receiver<String>,
    replies: mpsc::Sender<OutboundReply>,
    queues: Queues,
    idle_timeout: Duration,
) {
    debug!(sender = %sender, "Sender worker started");

    loop {
        let text = match timeout(idle_timeout, queue.recv()).await {
            Ok(Ok(text)) => text,
            // Closed and drained
            Ok(Err(_)) => break,
            Err(_) => {
                // Retire only if nothing slipped in; the check and close hold the entry lock
                let retired = queues
                    .remove_if(&sender, |_, tx| tx.is_empty() && tx.close())
                    .is_some();
                if retired {
                    debug!(sender = %sender, "Sender worker idle, retiring");
                }
                continue;
            }
        };

        let reply = pipeline.handle(&sender, &text).await;
        let outbound = OutboundReply {
            sender: sender.clone(),
            text: reply,
        };
        if replies.send(outbound).await.is_err() {
            warn!(sender = %sender, "Reply sink closed, stopping worker");
            queue.close();
            queues.remove_if(&sender, |_, tx| tx.is_closed());
            break;
        }
    }

    debug!(sender = %sender, "Sender worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{paper, pipeline, DESK, TRADER};

    #[tokio::test]
    async fn test_sender_messages_run_in_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let dispatcher = Dispatcher::new(Arc::new(pipeline(paper())), tx, 8);

        for text in [
            "BUY NIFTY 24000 CE 1",
            "STATUS",
            "SELL NIFTY 24000 CE 1",
            "STATUS",
        ] {
            dispatcher.dispatch(InboundMessage::new(TRADER, text)).await.unwrap();
        }
        assert_eq!(dispatcher.active_senders(), 1);

        let mut replies = Vec::new();
        for _ in 0..4 {
            replies.push(rx.recv().await.unwrap());
        }

        assert!(replies.iter().all(|r| r.sender == TRADER));
        assert!(replies[0].text.starts_with("✅ Order placed!"));
        assert!(replies[1].text.contains("net +1 lots"), "{}", replies[1].text);
        assert!(replies[2].text.starts_with("✅ Order placed!"));
        assert_eq!(replies[3].text, "📊 No open positions.");
    }

    #[tokio::test]
    async fn test_every_message_gets_a_reply() {
        let (tx, mut rx) = mpsc::channel(16);
        let dispatcher = Dispatcher::new(Arc::new(pipeline(paper())), tx, 8);

        dispatcher.dispatch(InboundMessage::new(TRADER, "STATUS")).await.unwrap();
        dispatcher
            .dispatch(InboundMessage::new("910000000000", "STATUS"))
            .await
            .unwrap();
        dispatcher.shutdown().await;

        let mut replies = Vec::new();
        while let Ok(reply) = rx.try_recv() {
            replies.push(reply);
        }
        replies.sort_by(|a, b| a.sender.cmp(&b.sender));

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].text, "❌ Unauthorised sender.");
        assert_eq!(replies[1].text, "📊 No open positions.");
    }

    #[tokio::test]
    async fn test_unauthorised_senders_get_no_queue() {
        let (tx, mut rx) = mpsc::channel(256);
        let dispatcher = Dispatcher::new(Arc::new(pipeline(paper())), tx, 8);

        for n in 0..200 {
            let sender = format!("91000000{:04}", n);
            dispatcher.dispatch(InboundMessage::new(sender, "STATUS")).await.unwrap();
        }

        assert_eq!(dispatcher.active_senders(), 0);
        for _ in 0..200 {
            assert_eq!(rx.recv().await.unwrap().text, "❌ Unauthorised sender.");
        }
    }

    #[tokio::test]
    async fn test_idle_worker_retires_and_sender_can_return() {
        let (tx, mut rx) = mpsc::channel(16);
        let dispatcher = Dispatcher::new(Arc::new(pipeline(paper())), tx, 8)
            .with_idle_timeout(Duration::from_millis(30));

        dispatcher.dispatch(InboundMessage::new(TRADER, "STATUS")).await.unwrap();
        dispatcher.dispatch(InboundMessage::new(DESK, "STATUS")).await.unwrap();
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(dispatcher.active_senders(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(dispatcher.active_senders(), 0);

        dispatcher
            .dispatch(InboundMessage::new(TRADER, "BUY NIFTY 24000 CE 1"))
            .await
            .unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.sender, TRADER);
        assert!(reply.text.starts_with("✅ Order placed!"), "{}", reply.text);
        assert_eq!(dispatcher.active_senders(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_fails() {
        let (tx, _rx) = mpsc::channel(16);
        let dispatcher = Dispatcher::new(Arc::new(pipeline(paper())), tx, 8);
        dispatcher.shutdown().await;

        let result = dispatcher.dispatch(InboundMessage::new(TRADER, "STATUS")).await;
        assert!(matches!(result, Err(Error::DispatchClosed(_))));
    }
}
