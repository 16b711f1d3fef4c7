//! Bounded write queue between the render pool and the write consumer.
//!
//! Pushing into a full queue waits until the consumer pulls, so rendering
//! never runs ahead of writing by more than the queue capacity.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::task::{Attempt, WriteMessage};
use crate::error::PublishError;

#[derive(Debug, Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<WriteMessage>,
    depth: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct WriteReceiver {
    rx: mpsc::Receiver<WriteMessage>,
    depth: Arc<AtomicUsize>,
}

/// Creates a queue of `capacity` messages. `depth` mirrors the number of
/// queued messages for status reporting.
pub fn write_queue(capacity: usize, depth: Arc<AtomicUsize>) -> (WriteQueue, WriteReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        WriteQueue {
            tx,
            depth: depth.clone(),
        },
        WriteReceiver { rx, depth },
    )
}

impl WriteQueue {
    pub async fn push(&self, attempt: Attempt) -> Result<(), PublishError> {
        let permit = self.tx.reserve().await.map_err(|_| PublishError::QueueClosed)?;
        self.depth.fetch_add(1, Ordering::SeqCst);
        permit.send(WriteMessage::Work(attempt));
        Ok(())
    }

    /// Asks the consumer to stop after the messages queued so far.
    pub async fn stop(&self) {
        if let Ok(permit) = self.tx.reserve().await {
            self.depth.fetch_add(1, Ordering::SeqCst);
            permit.send(WriteMessage::Stop);
        }
    }
}

impl WriteReceiver {
    pub async fn pull(&mut self) -> Option<WriteMessage> {
        let msg = self.rx.recv().await;
        if msg.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        msg
    }

    /// Discards everything queued and closes the queue. Returns the number of
    /// discarded work items.
    pub fn drain(&mut self) -> usize {
        self.rx.close();
        let mut dropped = 0;
        while let Ok(msg) = self.rx.try_recv() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            if matches!(msg, WriteMessage::Work(_)) {
                dropped += 1;
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::task::tests::task;
    use std::time::Duration;

    #[tokio::test]
    async fn full_queue_blocks_until_consumer_advances() {
        let depth = Arc::new(AtomicUsize::new(0));
        let (queue, mut rx) = write_queue(2, depth.clone());
        queue.push(Attempt::new(task(1))).await.unwrap();
        queue.push(Attempt::new(task(2))).await.unwrap();
        assert_eq!(depth.load(Ordering::SeqCst), 2);

        let producer = queue.clone();
        let third = tokio::spawn(async move { producer.push(Attempt::new(task(3))).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!third.is_finished());

        assert!(matches!(rx.pull().await, Some(WriteMessage::Work(_))));
        tokio::time::timeout(Duration::from_secs(1), third)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(depth.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drain_discards_and_closes() {
        let depth = Arc::new(AtomicUsize::new(0));
        let (queue, mut rx) = write_queue(4, depth.clone());
        queue.push(Attempt::new(task(1))).await.unwrap();
        queue.stop().await;
        assert_eq!(rx.drain(), 1);
        assert_eq!(depth.load(Ordering::SeqCst), 0);
        assert!(matches!(
            queue.push(Attempt::new(task(2))).await,
            Err(PublishError::QueueClosed)
        ));
    }
}
