//! Typed event fan-out for records decoded from the worker's stdout.
//!
//! The [`EventBus`] maps an event kind (the record's `type` field) to an
//! ordered list of handlers. Handlers run synchronously, in registration
//! order, on the task that emits the event; one-shot handlers are removed
//! after their first call.
//!
//! ```text
//! worker stdout --> EventDecoder --emit--> EventBus --> on("log", ..)
//!                        |                     |------> wait_for("start")
//!                        v                     '------> stream("*")
//!                   ConsoleSink (non-JSON lines)
//! ```

pub mod decoder;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub use decoder::{ConsoleSink, DecodeStats, EventDecoder, StdoutSink, TracingSink, decode_line};

/// Handlers registered under this kind observe every emitted event, after
/// the kind-specific handlers.
pub const ANY_EVENT: &str = "*";

/// One structured record emitted by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Value of the record's `type` field.
    pub kind: String,
    /// The full decoded record, `type` included.
    pub payload: Value,
}

impl Event {
    /// Wrap a decoded record whose `type` is `kind`.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Look up a top-level field of the record.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

/// Identifies a registered handler so it can be removed with [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type PersistentFn = Arc<Mutex<Box<dyn FnMut(&Event) + Send>>>;

enum Handler {
    Persistent(PersistentFn),
    Once(Box<dyn FnOnce(&Event) + Send>),
}

impl Handler {
    fn call(self, event: &Event) {
        match self {
            Handler::Persistent(f) => {
                let mut f = f.lock().unwrap_or_else(PoisonError::into_inner);
                (*f)(event);
            }
            Handler::Once(f) => f(event),
        }
    }
}

struct Listener {
    id: ListenerId,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<String, Vec<Listener>>,
}

impl Registry {
    fn insert(&mut self, kind: &str, handler: Handler) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners
            .entry(kind.to_owned())
            .or_default()
            .push(Listener { id, handler });
        id
    }

    /// Collect the handlers due for an event of `kind` into `due`. One-shot
    /// handlers leave the registry here, before they run.
    fn take_due(&mut self, kind: &str, due: &mut Vec<Handler>) {
        let Some(list) = self.listeners.get_mut(kind) else {
            return;
        };
        for listener in std::mem::take(list) {
            match listener.handler {
                Handler::Persistent(f) => {
                    due.push(Handler::Persistent(Arc::clone(&f)));
                    list.push(Listener {
                        id: listener.id,
                        handler: Handler::Persistent(f),
                    });
                }
                once @ Handler::Once(_) => due.push(once),
            }
        }
    }
}

/// Shared, cheaply clonable event bus.
///
/// Handlers run after the registry lock is released, so a handler may call
/// back into the bus (register, remove itself, wait). The handlers for one
/// emission are fixed when it starts; a handler removed mid-emission still
/// sees that event. A handler must not synchronously emit an event that it
/// handles itself.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.lock();
        let kinds: HashMap<&str, usize> = registry
            .listeners
            .iter()
            .map(|(kind, list)| (kind.as_str(), list.len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &kinds).finish()
    }
}

impl EventBus {
    /// An empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    // Handlers never run under this lock, so poisoning only follows a panic
    // in the bus itself and leaves the registry consistent.
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a persistent handler for `kind`.
    pub fn on<F>(&self, kind: &str, handler: F) -> ListenerId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        let handler: Box<dyn FnMut(&Event) + Send> = Box::new(handler);
        self.lock()
            .insert(kind, Handler::Persistent(Arc::new(Mutex::new(handler))))
    }

    /// Register a handler that runs for the next `kind` event only.
    pub fn once<F>(&self, kind: &str, handler: F) -> ListenerId
    where
        F: FnOnce(&Event) + Send + 'static,
    {
        self.lock().insert(kind, Handler::Once(Box::new(handler)))
    }

    /// Remove a handler. Returns `false` if it was already gone (fired
    /// one-shot, or removed earlier).
    pub fn off(&self, id: ListenerId) -> bool {
        let mut registry = self.lock();
        for list in registry.listeners.values_mut() {
            if let Some(pos) = list.iter().position(|l| l.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of handlers currently registered for `kind`.
    pub fn listener_count(&self, kind: &str) -> usize {
        self.lock().listeners.get(kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to its kind's handlers, then to [`ANY_EVENT`]
    /// handlers. Returns how many handlers ran.
    pub fn emit(&self, event: &Event) -> usize {
        let mut due = Vec::new();
        {
            let mut registry = self.lock();
            registry.take_due(&event.kind, &mut due);
            if event.kind != ANY_EVENT {
                registry.take_due(ANY_EVENT, &mut due);
            }
        }
        let invoked = due.len();
        for handler in due {
            handler.call(event);
        }
        invoked
    }

    /// Wait for the next event of `kind`.
    ///
    /// The handler is registered when this method is called, not when the
    /// returned future is first polled, so an event emitted in between is
    /// not lost. Dropping the future unregisters the handler.
    pub fn wait_for(&self, kind: &str) -> EventWait {
        let (tx, rx) = oneshot::channel();
        let id = self.once(kind, move |event| {
            let _ = tx.send(event.clone());
        });
        EventWait {
            bus: self.clone(),
            id,
            rx,
        }
    }

    /// Stream every subsequent event of `kind` (use [`ANY_EVENT`] for all).
    pub fn stream(&self, kind: &str) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on(kind, move |event| {
            let _ = tx.send(event.clone());
        });
        EventStream {
            bus: self.clone(),
            id,
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

/// Future returned by [`EventBus::wait_for`].
///
/// Resolves to `None` only if the handler was removed before it fired.
pub struct EventWait {
    bus: EventBus,
    id: ListenerId,
    rx: oneshot::Receiver<Event>,
}

impl EventWait {
    /// Handler id, for removing the wait with [`EventBus::off`].
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl Future for EventWait {
    type Output = Option<Event>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

impl Drop for EventWait {
    fn drop(&mut self) {
        self.bus.off(self.id);
    }
}

/// Stream returned by [`EventBus::stream`].
pub struct EventStream {
    bus: EventBus,
    id: ListenerId,
    inner: UnboundedReceiverStream<Event>,
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.bus.off(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn event(kind: &str) -> Event {
        Event::new(kind, json!({ "type": kind }))
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn FnMut(&Event) + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |tag: &str| {
                let log = Arc::clone(&log);
                let tag = tag.to_string();
                Box::new(move |e: &Event| log.lock().unwrap().push(format!("{tag}:{}", e.kind)))
                    as Box<dyn FnMut(&Event) + Send>
            }
        };
        (log, make)
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.on("log", make("a"));
        bus.on("log", make("b"));
        bus.on("log", make("c"));

        assert_eq!(bus.emit(&event("log")), 3);
        assert_eq!(*log.lock().unwrap(), vec!["a:log", "b:log", "c:log"]);
    }

    #[test]
    fn once_handler_fires_a_single_time() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let mut handler = make("once");
        bus.once("start", move |e| handler(e));

        assert_eq!(bus.emit(&event("start")), 1);
        assert_eq!(bus.emit(&event("start")), 0);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(bus.listener_count("start"), 0);
    }

    #[test]
    fn off_removes_handler() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let id = bus.on("log", make("a"));
        bus.on("log", make("b"));

        assert!(bus.off(id));
        assert!(!bus.off(id), "second removal should report missing");
        bus.emit(&event("log"));
        assert_eq!(*log.lock().unwrap(), vec!["b:log"]);
    }

    #[test]
    fn other_kinds_are_not_delivered() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.on("log", make("a"));
        assert_eq!(bus.emit(&event("task")), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn wildcard_runs_after_specific_handlers() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.on(ANY_EVENT, make("any"));
        bus.on("log", make("log"));

        bus.emit(&event("log"));
        bus.emit(&event("other"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["log:log", "any:log", "any:other"]
        );
    }

    #[tokio::test]
    async fn wait_for_sees_event_emitted_before_first_poll() {
        let bus = EventBus::new();
        let wait = bus.wait_for("start");
        bus.emit(&Event::new("start", json!({ "type": "start", "pid": 7 })));

        let got = wait.await.expect("start event");
        assert_eq!(got.kind, "start");
        assert_eq!(got.field("pid"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn dropping_wait_unregisters_handler() {
        let bus = EventBus::new();
        let wait = bus.wait_for("start");
        assert_eq!(bus.listener_count("start"), 1);
        drop(wait);
        assert_eq!(bus.listener_count("start"), 0);
    }

    #[tokio::test]
    async fn wait_resolves_none_when_handler_removed() {
        let bus = EventBus::new();
        let wait = bus.wait_for("start");
        bus.off(wait.id());
        assert!(wait.await.is_none());
    }

    #[tokio::test]
    async fn stream_yields_events_in_order_and_unregisters_on_drop() {
        let bus = EventBus::new();
        let mut stream = bus.stream("log");
        for n in 0..3 {
            bus.emit(&Event::new("log", json!({ "type": "log", "n": n })));
        }

        for n in 0..3 {
            let e = stream.next().await.unwrap();
            assert_eq!(e.field("n"), Some(&json!(n)));
        }
        drop(stream);
        assert_eq!(bus.listener_count("log"), 0);
    }

    #[test]
    fn handler_can_remove_itself() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(0));
        let own_id = Arc::new(Mutex::new(None::<ListenerId>));

        let id = bus.on("log", {
            let bus = bus.clone();
            let calls = Arc::clone(&calls);
            let own_id = Arc::clone(&own_id);
            move |_| {
                *calls.lock().unwrap() += 1;
                if let Some(id) = *own_id.lock().unwrap() {
                    assert!(bus.off(id));
                }
            }
        });
        *own_id.lock().unwrap() = Some(id);

        assert_eq!(bus.emit(&event("log")), 1);
        assert_eq!(bus.emit(&event("log")), 0);
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(bus.listener_count("log"), 0);
    }

    #[tokio::test]
    async fn handler_can_register_and_wait_on_the_bus() {
        let bus = EventBus::new();
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        bus.on("start", {
            let bus = bus.clone();
            move |_| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send((bus.listener_count("start"), bus.wait_for("done")));
                }
            }
        });

        bus.emit(&event("start"));
        let (count, done) = rx.await.unwrap();
        assert_eq!(count, 1);
        bus.emit(&event("done"));
        assert_eq!(done.await.unwrap().kind, "done");
    }

    #[test]
    fn cloned_bus_shares_handlers() {
        let bus = EventBus::new();
        let other = bus.clone();
        let (log, make) = recorder();
        other.on("log", make("a"));
        bus.emit(&event("log"));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn panicking_handler_does_not_break_bus() {
        let bus = EventBus::new();
        bus.on("boom", |_| panic!("handler failure"));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            bus.emit(&event("boom"));
        }));
        assert!(result.is_err());

        let (log, make) = recorder();
        bus.on("log", make("a"));
        bus.emit(&event("log"));
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
