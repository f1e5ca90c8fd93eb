/// Per-conversation message batching.
///
/// Bursts of new-message events are collected per conversation and delivered
/// downstream once, either when the window opened by the first message
/// elapses or when the batch reaches its size limit, whichever comes first.
use crate::messenger_types::{ConversationId, Message, MessageId};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Messages for one conversation, deduplicated by id, ascending
#[derive(Debug, Clone, PartialEq)]
pub struct FlushedBatch {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
}

#[derive(Debug)]
struct Batch {
    pending: Vec<Message>,
    deadline: Instant,
}

impl Batch {
    /// Later arrivals win on id collisions; output is ascending by id
    fn finish(self, conversation_id: ConversationId) -> FlushedBatch {
        let mut by_id: BTreeMap<MessageId, Message> = BTreeMap::new();
        for message in self.pending {
            by_id.insert(message.id, message);
        }
        FlushedBatch {
            conversation_id,
            messages: by_id.into_values().collect(),
        }
    }
}

/// Open batches and the time/count rules, independent of any runtime
#[derive(Debug)]
pub struct BatchSet {
    window: Duration,
    max_batch_size: usize,
    open: HashMap<ConversationId, Batch>,
}

impl BatchSet {
    pub fn new(window: Duration, max_batch_size: usize) -> Self {
        Self {
            window,
            max_batch_size: max_batch_size.max(1),
            open: HashMap::new(),
        }
    }

    /// Record a message. Returns the batch if this arrival filled it.
    pub fn push(&mut self, conversation_id: ConversationId, message: Message, now: Instant) -> Option<FlushedBatch> {
        let window = self.window;
        let batch = self.open.entry(conversation_id).or_insert_with(|| Batch {
            pending: Vec::new(),
            deadline: now + window,
        });
        batch.pending.push(message);

        if batch.pending.len() >= self.max_batch_size {
            return self
                .open
                .remove(&conversation_id)
                .map(|b| b.finish(conversation_id));
        }
        None
    }

    /// Earliest window end among open batches
    pub fn next_deadline(&self) -> Option<Instant> {
        self.open.values().map(|b| b.deadline).min()
    }

    /// Close every batch whose window has elapsed, oldest first
    pub fn take_expired(&mut self, now: Instant) -> Vec<FlushedBatch> {
        let mut expired: Vec<(Instant, ConversationId)> = self
            .open
            .iter()
            .filter(|(_, b)| b.deadline <= now)
            .map(|(id, b)| (b.deadline, *id))
            .collect();
        expired.sort();

        expired
            .into_iter()
            .filter_map(|(_, id)| self.open.remove(&id).map(|b| b.finish(id)))
            .collect()
    }

    /// Drop the open batch for a conversation that no longer exists
    pub fn discard(&mut self, conversation_id: ConversationId) -> usize {
        self.open
            .remove(&conversation_id)
            .map(|b| b.pending.len())
            .unwrap_or(0)
    }

    /// Close everything regardless of deadlines
    pub fn drain(&mut self) -> Vec<FlushedBatch> {
        let mut ids: Vec<ConversationId> = self.open.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.open.remove(&id).map(|b| b.finish(id)))
            .collect()
    }

    pub fn open_batches(&self) -> usize {
        self.open.len()
    }
}

#[derive(Debug)]
pub enum BatcherInput {
    Message {
        conversation_id: ConversationId,
        message: Message,
    },
    Discard(ConversationId),
    /// Deliver every open batch now; acknowledged once they are enqueued
    Flush(oneshot::Sender<()>),
}

/// Cheap handle for feeding the batcher task
#[derive(Debug, Clone)]
pub struct BatcherHandle {
    tx: mpsc::UnboundedSender<BatcherInput>,
}

impl BatcherHandle {
    /// Returns false once the batcher task has stopped
    pub fn on_message_event(&self, conversation_id: ConversationId, message: Message) -> bool {
        self.tx
            .send(BatcherInput::Message {
                conversation_id,
                message,
            })
            .is_ok()
    }

    pub fn discard(&self, conversation_id: ConversationId) {
        let _ = self.tx.send(BatcherInput::Discard(conversation_id));
    }

    /// Push out every open batch. Returns once they sit in the sink, or
    /// false if the batcher is gone.
    pub async fn flush(&self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(BatcherInput::Flush(done_tx)).is_err() {
            return false;
        }
        done_rx.await.is_ok()
    }
}

/// Batcher task. Runs on its own tokio task; flushed batches are enqueued
/// into `sink`, never applied directly.
pub struct MessageBatcher<T> {
    set: BatchSet,
    rx: mpsc::UnboundedReceiver<BatcherInput>,
    sink: mpsc::Sender<T>,
}

impl<T> MessageBatcher<T>
where
    T: From<FlushedBatch> + Send + 'static,
{
    /// Spawn the batcher and return its input handle
    pub fn spawn(window: Duration, max_batch_size: usize, sink: mpsc::Sender<T>) -> BatcherHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let batcher = Self {
            set: BatchSet::new(window, max_batch_size),
            rx,
            sink,
        };
        tokio::spawn(batcher.run());
        BatcherHandle { tx }
    }

    async fn run(mut self) {
        loop {
            let deadline = self.set.next_deadline();
            tokio::select! {
                input = self.rx.recv() => match input {
                    Some(BatcherInput::Message { conversation_id, message }) => {
                        if let Some(batch) = self.set.push(conversation_id, message, Instant::now()) {
                            if !self.deliver(batch).await {
                                return;
                            }
                        }
                    }
                    Some(BatcherInput::Discard(conversation_id)) => {
                        let dropped = self.set.discard(conversation_id);
                        if dropped > 0 {
                            debug!(conversation_id, dropped, "Discarded batch for removed conversation");
                        }
                    }
                    Some(BatcherInput::Flush(done)) => {
                        for batch in self.set.drain() {
                            if !self.deliver(batch).await {
                                return;
                            }
                        }
                        let _ = done.send(());
                    }
                    None => {
                        // Producers gone: hand over whatever is still open
                        for batch in self.set.drain() {
                            if !self.deliver(batch).await {
                                break;
                            }
                        }
                        return;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    for batch in self.set.take_expired(Instant::now()) {
                        if !self.deliver(batch).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn deliver(&self, batch: FlushedBatch) -> bool {
        debug!(
            conversation_id = batch.conversation_id,
            count = batch.messages.len(),
            "Flushing message batch"
        );
        if self.sink.send(T::from(batch)).await.is_err() {
            warn!("Batch sink closed, stopping batcher");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: MessageId, text: &str) -> Message {
        Message {
            id,
            author_id: 7,
            text: text.to_string(),
            time: Utc.timestamp_opt(id as i64, 0).unwrap(),
            mentions: vec![],
        }
    }

    #[test]
    fn test_dedup_and_sort_later_wins() {
        let mut set = BatchSet::new(Duration::from_millis(200), 50);
        let now = Instant::now();
        for (id, text) in [(3, "c"), (1, "a-old"), (2, "b"), (1, "a-new")] {
            assert!(set.push(9, message(id, text), now).is_none());
        }

        let flushed = set.take_expired(now + Duration::from_millis(200));
        assert_eq!(flushed.len(), 1);
        let batch = &flushed[0];
        assert_eq!(batch.conversation_id, 9);
        let ids: Vec<_> = batch.messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(batch.messages[0].text, "a-new");
    }

    #[test]
    fn test_window_is_fixed_from_first_arrival() {
        let mut set = BatchSet::new(Duration::from_millis(200), 50);
        let start = Instant::now();
        set.push(1, message(1, "x"), start);
        set.push(1, message(2, "y"), start + Duration::from_millis(150));

        assert_eq!(set.next_deadline(), Some(start + Duration::from_millis(200)));
        assert!(set.take_expired(start + Duration::from_millis(199)).is_empty());
        assert_eq!(set.take_expired(start + Duration::from_millis(200)).len(), 1);
        assert_eq!(set.open_batches(), 0);
    }

    #[test]
    fn test_count_threshold_flushes_immediately() {
        let mut set = BatchSet::new(Duration::from_secs(60), 3);
        let now = Instant::now();
        assert!(set.push(1, message(1, "a"), now).is_none());
        assert!(set.push(1, message(2, "b"), now).is_none());
        let batch = set.push(1, message(3, "c"), now).expect("full batch");
        assert_eq!(batch.messages.len(), 3);
        assert_eq!(set.open_batches(), 0);

        // Next arrival opens a fresh batch
        assert!(set.push(1, message(4, "d"), now).is_none());
        assert_eq!(set.open_batches(), 1);
    }

    #[test]
    fn test_batches_are_per_conversation() {
        let mut set = BatchSet::new(Duration::from_millis(100), 50);
        let now = Instant::now();
        set.push(1, message(1, "a"), now);
        set.push(2, message(2, "b"), now + Duration::from_millis(10));
        assert_eq!(set.open_batches(), 2);

        let first = set.take_expired(now + Duration::from_millis(105));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].conversation_id, 1);

        assert_eq!(set.discard(2), 1);
        assert!(set.drain().is_empty());
    }

    #[tokio::test]
    async fn test_batcher_task_flushes_window() {
        let (tx, mut rx) = mpsc::channel::<FlushedBatch>(8);
        let handle = MessageBatcher::spawn(Duration::from_millis(30), 50, tx);

        for id in [3, 1, 2, 1] {
            assert!(handle.on_message_event(5, message(id, "m")));
        }

        let batch = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("flush within timeout")
            .expect("batch");
        let ids: Vec<_> = batch.messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_batcher_task_flushes_on_close() {
        let (tx, mut rx) = mpsc::channel::<FlushedBatch>(8);
        let handle = MessageBatcher::spawn(Duration::from_secs(60), 50, tx);
        handle.on_message_event(1, message(1, "a"));
        drop(handle);

        let batch = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_flush_ignores_window() {
        let (tx, mut rx) = mpsc::channel::<FlushedBatch>(8);
        let handle = MessageBatcher::spawn(Duration::from_secs(60), 50, tx);
        handle.on_message_event(2, message(4, "x"));
        handle.on_message_event(2, message(3, "y"));
        assert!(handle.flush().await);

        let batch = rx.try_recv().expect("batch enqueued before ack");
        assert_eq!(batch.conversation_id, 2);
        assert_eq!(batch.messages.len(), 2);
    }
}
