/// Single-writer sync engine.
///
/// One tokio task owns the `ConversationStore` and the `SyncCoordinator` and
/// applies every mutation in queue order. Message events detour through the
/// batcher task; fetches run on their own tasks and come back as commands.
use crate::batcher::{BatcherHandle, FlushedBatch, MessageBatcher};
use crate::config::SyncConfig;
use crate::coordinator::{FetchKind, FetchOutcome, LoadPhase, PlannedFetch, SkipReason, SyncCoordinator};
use crate::error::{Result, SyncError};
use crate::fetcher::{ThreadFetcher, ThreadPage};
use crate::messenger_types::{
    ConnectionStatus, ConversationId, ConversationSummary, SyncEvent, ThreadEvent,
};
use crate::pin_store::PinStorage;
use crate::presentation::PresentationDelegate;
use crate::sort_policy;
use crate::store::{ConversationStore, SideCar};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_BUS_CAPACITY: usize = 1024;

type FetchReply = oneshot::Sender<Result<FetchOutcome>>;

/// Everything the writer task can be asked to do
pub enum Command {
    Thread(ThreadEvent),
    Connection(ConnectionStatus),
    BatchFlushed(FlushedBatch),
    GetThreads(FetchReply),
    LoadMore {
        anchor: ConversationId,
        reply: FetchReply,
    },
    Refresh(FetchReply),
    Select {
        id: ConversationId,
        reply: oneshot::Sender<bool>,
    },
    Deselect,
    SetScrollIntent(Option<ConversationId>),
    AttachSideCar {
        id: ConversationId,
        side_car: SideCar,
        reply: oneshot::Sender<bool>,
    },
    Snapshot(oneshot::Sender<EngineSnapshot>),
    FetchCompleted {
        planned: PlannedFetch,
        result: Result<ThreadPage>,
    },
    Shutdown(Option<oneshot::Sender<()>>),
}

impl From<FlushedBatch> for Command {
    fn from(batch: FlushedBatch) -> Self {
        Command::BatchFlushed(batch)
    }
}

/// Point-in-time copy of the engine state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub entries: Vec<ConversationSummary>,
    pub pins: Vec<ConversationId>,
    pub selected: Option<ConversationId>,
    pub scroll_intent: Option<ConversationId>,
    pub phase: LoadPhase,
    pub loading: bool,
    pub has_next: bool,
    pub connection: Option<ConnectionStatus>,
    pub generation: u64,
}

impl EngineSnapshot {
    pub fn order(&self) -> Vec<ConversationId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    pub fn get(&self, id: ConversationId) -> Option<&ConversationSummary> {
        self.entries.iter().find(|e| e.id == id)
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    store: ConversationStore,
    coordinator: SyncCoordinator,
    fetcher: Arc<dyn ThreadFetcher>,
    delegate: Arc<dyn PresentationDelegate>,
    batcher: BatcherHandle,
    commands: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
    waiters: HashMap<u64, FetchReply>,
}

impl SyncEngine {
    /// Start the writer and batcher tasks and return a handle to them
    pub fn spawn(
        config: SyncConfig,
        fetcher: Arc<dyn ThreadFetcher>,
        delegate: Arc<dyn PresentationDelegate>,
        pin_storage: Arc<dyn PinStorage>,
    ) -> Result<EngineHandle> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.command_queue_capacity);
        let batcher = MessageBatcher::<Command>::spawn(config.batch_window, config.max_batch_size, tx.clone());
        let (bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        let engine = SyncEngine {
            store: ConversationStore::new(config.viewer_id, config.scope, delegate.clone()),
            coordinator: SyncCoordinator::new(&config, pin_storage),
            config,
            fetcher,
            delegate,
            batcher: batcher.clone(),
            commands: tx.clone(),
            rx,
            waiters: HashMap::new(),
        };
        info!(
            viewer = engine.config.viewer_id,
            scope = ?engine.config.scope,
            pins = ?engine.coordinator.pins().ids(),
            "Starting sync engine"
        );
        let task = tokio::spawn(engine.run());

        Ok(EngineHandle {
            commands: tx.clone(),
            batcher,
            bus,
            task: Arc::new(std::sync::Mutex::new(Some(task))),
            _guard: Arc::new(ShutdownGuard { commands: tx }),
        })
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            if let Command::Shutdown(done) = command {
                self.coordinator.persist_pins();
                if let Some(done) = done {
                    let _ = done.send(());
                }
                break;
            }
            self.handle(command).await;
        }
        info!("Sync engine stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Thread(event) => self.on_thread_event(event),
            Command::Connection(status) => {
                if let Some(planned) = self.coordinator.on_connection_status(status, &mut self.store) {
                    self.start_fetch(planned, None);
                }
            }
            Command::BatchFlushed(batch) => {
                let applied = self.store.apply_message_batch(
                    batch.conversation_id,
                    &batch.messages,
                    self.coordinator.pins(),
                );
                if applied == 0 {
                    debug!(
                        conversation_id = batch.conversation_id,
                        "Dropped message batch for unknown conversation"
                    );
                }
            }
            Command::GetThreads(reply) => match self.coordinator.plan_get_threads() {
                Ok(planned) => self.start_fetch(planned, Some(reply)),
                Err(reason) => skip(reply, reason),
            },
            Command::LoadMore { anchor, reply } => {
                let order = self.store.order();
                match self.coordinator.plan_load_more(anchor, &order) {
                    Ok(planned) => self.start_fetch(planned, Some(reply)),
                    Err(reason) => skip(reply, reason),
                }
            }
            Command::Refresh(reply) => {
                let planned = self.coordinator.plan_refresh();
                self.start_fetch(planned, Some(reply));
            }
            Command::Select { id, reply } => {
                let _ = reply.send(self.store.select(id));
            }
            Command::Deselect => self.store.deselect(),
            Command::SetScrollIntent(id) => self.coordinator.set_scroll_intent(id),
            Command::AttachSideCar { id, side_car, reply } => {
                let _ = reply.send(self.store.attach_side_car(id, side_car));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::FetchCompleted { planned, result } => self.on_fetch_completed(planned, result).await,
            Command::Shutdown(_) => {}
        }
    }

    fn on_thread_event(&mut self, event: ThreadEvent) {
        let id = event.conversation_id();
        let was_present = id.map_or(false, |id| self.store.contains(id));

        self.store.apply(event, self.coordinator.pins_mut());
        self.coordinator.persist_pins();

        if let Some(id) = id {
            if was_present && !self.store.contains(id) {
                self.batcher.discard(id);
            }
        }
    }

    fn start_fetch(&mut self, planned: PlannedFetch, reply: Option<FetchReply>) {
        if let Some(reply) = reply {
            self.waiters.insert(planned.seq, reply);
        }
        self.delegate.set_loading_indicator(true);
        debug!(
            seq = planned.seq,
            generation = planned.generation,
            kind = ?planned.kind,
            offset = planned.request.offset,
            mode = ?planned.request.mode,
            "Starting fetch"
        );

        let fetcher = self.fetcher.clone();
        let commands = self.commands.clone();
        let limit = fetcher.request_timeout().unwrap_or(self.config.fetch_timeout);
        tokio::spawn(async move {
            let result = match tokio::time::timeout(limit, fetcher.fetch_threads(planned.request.clone())).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(format!("no response after {:?}", limit))),
            };
            if commands.send(Command::FetchCompleted { planned, result }).await.is_err() {
                debug!("Engine stopped before fetch completed");
            }
        });
    }

    async fn on_fetch_completed(&mut self, planned: PlannedFetch, result: Result<ThreadPage>) {
        let outcome = self.coordinator.complete(&planned, result, &mut self.store);

        if let Ok(FetchOutcome::Applied { kind, .. }) = &outcome {
            self.install_sorted(*kind != FetchKind::Reconnect).await;
            if *kind == FetchKind::Reconnect {
                self.delegate.scroll_to_top();
            }
        }
        if !self.coordinator.is_loading() {
            self.delegate.set_loading_indicator(false);
        }

        if let Some(reply) = self.waiters.remove(&planned.seq) {
            let _ = reply.send(outcome);
        } else if let Err(e) = outcome {
            warn!(kind = ?planned.kind, "Background fetch failed: {}", e);
        }
    }

    /// Sort and notify. Long lists are ordered on a blocking thread; the
    /// writer waits for the result so nothing interleaves with the install.
    async fn install_sorted(&mut self, animate: bool) {
        if self.store.len() >= self.config.offload_sort_threshold {
            let keys = self.store.sort_keys();
            let ranking = self.coordinator.pins().clone();
            match tokio::task::spawn_blocking(move || sort_policy::order_of(keys, &ranking)).await {
                Ok(order) if self.store.install_order(&order) => {
                    self.store.notify(animate);
                    return;
                }
                Ok(_) => debug!("Offloaded order no longer matches the store, sorting inline"),
                Err(e) => warn!("Sort task failed: {}", e),
            }
        }
        self.store.sort_and_notify(self.coordinator.pins(), animate);
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            entries: self.store.entries().to_vec(),
            pins: self.coordinator.pins().ids().to_vec(),
            selected: self.store.selected(),
            scroll_intent: self.coordinator.scroll_intent(),
            phase: self.coordinator.phase(),
            loading: self.coordinator.is_loading(),
            has_next: self.coordinator.has_next(),
            connection: self.coordinator.connection(),
            generation: self.coordinator.generation(),
        }
    }
}

fn skip(reply: FetchReply, reason: SkipReason) {
    debug!(?reason, "Fetch skipped");
    let _ = reply.send(Ok(FetchOutcome::Skipped(reason)));
}

/// Stops the writer once the last handle is dropped
struct ShutdownGuard {
    commands: mpsc::Sender<Command>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if self.commands.try_send(Command::Shutdown(None)).is_ok() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let commands = self.commands.clone();
            runtime.spawn(async move {
                let _ = commands.send(Command::Shutdown(None)).await;
            });
        }
    }
}

/// Cloneable front door to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    batcher: BatcherHandle,
    bus: broadcast::Sender<SyncEvent>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
    _guard: Arc<ShutdownGuard>,
}

impl EngineHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::Engine("sync engine is not running".to_string()))
    }

    /// Feed one event from the event bus. Message events go through the
    /// batcher, everything else straight to the writer.
    pub async fn publish(&self, event: SyncEvent) -> Result<()> {
        // No subscribers is fine
        let _ = self.bus.send(event.clone());
        match event {
            SyncEvent::Thread { event } => self.send(Command::Thread(event)).await,
            SyncEvent::ConnectionStatusChanged { status } => self.send(Command::Connection(status)).await,
            SyncEvent::Message {
                conversation_id,
                message,
            } => {
                if self.batcher.on_message_event(conversation_id, message) {
                    Ok(())
                } else {
                    Err(SyncError::Engine("message batcher stopped".to_string()))
                }
            }
        }
    }

    /// Forward an external event stream into the engine until it ends
    pub fn attach_event_source<S>(&self, events: S) -> JoinHandle<()>
    where
        S: Stream<Item = SyncEvent> + Send + 'static,
    {
        let handle = self.clone();
        tokio::spawn(async move {
            futures_util::pin_mut!(events);
            while let Some(event) = events.next().await {
                if let Err(e) = handle.publish(event).await {
                    warn!("Event source detached: {}", e);
                    break;
                }
            }
        })
    }

    /// Stream of every event published to this engine. Slow subscribers skip
    /// what they missed.
    pub fn subscribe(&self) -> impl Stream<Item = SyncEvent> + Send + 'static {
        let rx = self.bus.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event subscriber lagged {} events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    async fn fetch(&self, command: impl FnOnce(FetchReply) -> Command) -> Result<FetchOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        rx.await?
    }

    /// Load the next page
    pub async fn get_threads(&self) -> Result<FetchOutcome> {
        self.fetch(Command::GetThreads).await
    }

    /// Load the next page if `anchor` is near the end of the list
    pub async fn load_more(&self, anchor: ConversationId) -> Result<FetchOutcome> {
        self.fetch(|reply| Command::LoadMore { anchor, reply }).await
    }

    /// Network-only reload of the first page
    pub async fn refresh(&self) -> Result<FetchOutcome> {
        self.fetch(Command::Refresh).await
    }

    pub async fn select(&self, id: ConversationId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Select { id, reply }).await?;
        Ok(rx.await?)
    }

    pub async fn deselect(&self) -> Result<()> {
        self.send(Command::Deselect).await
    }

    pub async fn set_scroll_intent(&self, id: Option<ConversationId>) -> Result<()> {
        self.send(Command::SetScrollIntent(id)).await
    }

    /// Hand a background resource to the store; it is aborted with its row
    pub async fn attach_side_car(&self, id: ConversationId, side_car: SideCar) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AttachSideCar { id, side_car, reply }).await?;
        Ok(rx.await?)
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply)).await?;
        Ok(rx.await?)
    }

    /// Push every open message batch into the writer queue without waiting
    /// for its window. Commands sent afterwards see the batches applied.
    pub async fn flush_messages(&self) -> Result<()> {
        if self.batcher.flush().await {
            Ok(())
        } else {
            Err(SyncError::Engine("message batcher stopped".to_string()))
        }
    }

    /// Flush open message batches, apply them, then stop the writer
    pub async fn shutdown(&self) -> Result<()> {
        if let Err(e) = self.flush_messages().await {
            debug!("Skipping batch flush: {}", e);
        }
        let (done, rx) = oneshot::channel();
        self.send(Command::Shutdown(Some(done))).await?;
        rx.await?;

        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.await
                .map_err(|e| SyncError::Engine(format!("writer task failed: {}", e)))?;
        }
        Ok(())
    }
}
