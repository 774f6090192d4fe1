use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum EventKind {
    LogDebug,
    LogInfo,
    LogWarning,
    LogError,
    PrintConsole,
    LoaderUpdate,
    LoaderStop,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Event {
    kind: EventKind,
    source: String,
    message: String,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Carries events from a backend to a single UI subscriber.
///
/// `publish` never blocks: the channel is unbounded, so a slow subscriber
/// only grows the queue. Events published from one task arrive in order;
/// events from concurrent tasks interleave arbitrarily. `close` drops the
/// sending half and waits until the subscriber has drained every event.
#[derive(Debug)]
pub struct EventBus {
    tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            subscriber: Mutex::new(None),
        }
    }

    pub fn publish(&self, event: Event) {
        if let Some(tx) = lock(&self.tx).as_ref() {
            // a closed bus or a dropped subscriber silently discards the event
            let _ = tx.send(event);
        }
    }

    /// Starts the single consumer. Only the first call takes effect.
    pub fn subscribe<F>(&self, mut callback: F) -> bool
    where
        F: FnMut(Event) + Send + 'static,
    {
        let Some(mut receiver) = lock(&self.rx).take() else {
            return false;
        };

        let handle = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                callback(event);
            }
        });
        *lock(&self.subscriber) = Some(handle);
        true
    }

    pub async fn close(&self) {
        drop(lock(&self.tx).take());
        let handle = lock(&self.subscriber).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A bus handle that stamps every event with the emitting backend's name.
#[derive(Debug, Clone)]
pub struct Emitter {
    bus: std::sync::Arc<EventBus>,
    source: String,
}

impl Emitter {
    pub fn new(bus: std::sync::Arc<EventBus>, source: impl Into<String>) -> Self {
        Self {
            bus,
            source: source.into(),
        }
    }

    pub fn bus(&self) -> &std::sync::Arc<EventBus> {
        &self.bus
    }

    pub fn emit(&self, kind: EventKind, message: impl Into<String>) {
        self.bus.publish(Event::new(kind, self.source.clone(), message));
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(EventKind::LogDebug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(EventKind::LogInfo, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(EventKind::LogWarning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(EventKind::LogError, message);
    }

    pub fn console(&self, message: impl Into<String>) {
        self.emit(EventKind::PrintConsole, message);
    }

    pub fn loader(&self, message: impl Into<String>) {
        self.emit(EventKind::LoaderUpdate, message);
    }

    pub fn loader_stop(&self) {
        self.emit(EventKind::LoaderStop, "");
    }
}
