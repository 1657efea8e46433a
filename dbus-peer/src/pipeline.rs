//! The bidirectional handler pipeline.
//!
//! An ordered chain of named handlers with explicit propagate-or-consume
//! control flow, run off a dedicated worker pool (`tokio::task::spawn`) so
//! a handler that blocks never stalls the I/O loop.

use std::any::Any;
use std::cell::Cell;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::message::{InboundMessage, MessageBuilder, OutboundMessage};

/// An application-defined event injected into the pipeline via
/// [`Pipeline::fire_user_event`], distinct from anything the wire protocol
/// produced.
pub type UserEvent = Box<dyn Any + Send + Sync>;

/// A named, ordered participant in a [`Pipeline`].
///
/// Every method has a default no-op body that propagates the event, so a
/// handler implements only the hooks it cares about. Propagation is
/// explicit: call [`PipelineContext::propagate`] to pass the event to the
/// next handler, or do nothing to consume it.
pub trait Handler: Send + Sync + 'static {
    /// The connection reached `ACTIVE`.
    fn on_connection_active(&self, ctx: &PipelineContext) {
        ctx.propagate();
    }

    /// The connection left `ACTIVE` (closed or degraded).
    fn on_connection_inactive(&self, ctx: &PipelineContext) {
        ctx.propagate();
    }

    /// A message arrived that the correlator did not claim: an unsolicited
    /// signal, an incoming method call, or a routed reply.
    fn on_inbound_message(&self, ctx: &PipelineContext, message: &InboundMessage) {
        let _ = message;
        ctx.propagate();
    }

    /// A message is being written, for observation only; it is not gated on
    /// propagation, the write proceeds regardless.
    fn on_outbound_message(&self, ctx: &PipelineContext, message: &OutboundMessage) {
        let _ = message;
        ctx.propagate();
    }

    /// An application-injected event.
    fn on_user_event(&self, ctx: &PipelineContext, event: &UserEvent) {
        let _ = event;
        ctx.propagate();
    }

    /// A connection-level error, delivered alongside (not instead of) the
    /// `on_connection_inactive` transition it usually precedes.
    fn on_exception(&self, ctx: &PipelineContext, error: &Error) {
        let _ = error;
        ctx.propagate();
    }
}

/// Passed to every handler invocation: carries the propagate/consume
/// decision and a channel handlers can use to submit writes, which are
/// re-dispatched back to the I/O loop rather than written directly —
/// resolving the cyclic reference between pipeline and I/O loop by message
/// passing instead of a direct call back in.
pub struct PipelineContext {
    propagated: Cell<bool>,
    outbound: mpsc::UnboundedSender<MessageBuilder>,
}

impl PipelineContext {
    fn new(outbound: mpsc::UnboundedSender<MessageBuilder>) -> Self {
        Self {
            propagated: Cell::new(false),
            outbound,
        }
    }

    /// Pass the current event on to the next handler in the chain. A
    /// handler that never calls this consumes the event: no handler after
    /// it in the chain runs.
    pub fn propagate(&self) {
        self.propagated.set(true);
    }

    /// Submit a message to be sent. The builder is assigned a serial and
    /// written by the connection's I/O loop, not by the calling handler.
    pub fn send(&self, message: MessageBuilder) {
        let _ = self.outbound.send(message);
    }
}

pub(crate) enum PipelineEvent {
    ConnectionActive,
    ConnectionInactive,
    Inbound(Box<InboundMessage>),
    Outbound(Box<OutboundMessage>),
    User(UserEvent),
    Exception(Box<Error>),
}

type HandlerList = Arc<Mutex<Vec<(String, Arc<dyn Handler>)>>>;

/// The ordered chain of [`Handler`]s for one connection.
///
/// Events are enqueued from the I/O loop (non-blocking) and drained by a
/// small pool of worker tasks. Only one worker processes an event at a
/// time — handlers on a single pipeline never observe events out of order
/// or concurrently — but idle workers race to pick up the next one as soon
/// as it is free, giving the pool its parallelism across connections
/// without reordering any one connection's events.
pub struct Pipeline {
    handlers: HandlerList,
    events: mpsc::UnboundedSender<PipelineEvent>,
    outbound: mpsc::UnboundedSender<MessageBuilder>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub(crate) fn new(worker_pool_size: usize, outbound: mpsc::UnboundedSender<MessageBuilder>) -> Self {
        let handlers: HandlerList = Arc::new(Mutex::new(Vec::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared_rx = Arc::new(tokio::sync::Mutex::new(events_rx));

        let mut workers = Vec::with_capacity(worker_pool_size.max(1));
        for _ in 0..worker_pool_size.max(1) {
            let handlers = Arc::clone(&handlers);
            let outbound = outbound.clone();
            let shared_rx = Arc::clone(&shared_rx);

            workers.push(tokio::spawn(async move {
                loop {
                    let mut rx = shared_rx.lock().await;
                    let Some(event) = rx.recv().await else {
                        return;
                    };
                    dispatch(&handlers, &outbound, event);
                    drop(rx);
                }
            }));
        }

        Self {
            handlers,
            events: events_tx,
            outbound,
            workers,
        }
    }

    /// Add `handler` under `name` at the end of the chain.
    pub fn add_handler(&self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.lock().expect("handler list lock poisoned").push((name.into(), handler));
    }

    /// Remove the handler registered under `name`, if any. Returns whether
    /// a handler was removed.
    pub fn remove_handler(&self, name: &str) -> bool {
        let mut handlers = self.handlers.lock().expect("handler list lock poisoned");
        let before = handlers.len();
        handlers.retain(|(n, _)| n != name);
        handlers.len() != before
    }

    /// Inject an application-defined event into the pipeline.
    pub fn fire_user_event(&self, event: UserEvent) {
        let _ = self.events.send(PipelineEvent::User(event));
    }

    pub(crate) fn fire_connection_active(&self) {
        let _ = self.events.send(PipelineEvent::ConnectionActive);
    }

    pub(crate) fn fire_connection_inactive(&self) {
        let _ = self.events.send(PipelineEvent::ConnectionInactive);
    }

    pub(crate) fn fire_inbound(&self, message: InboundMessage) {
        let _ = self.events.send(PipelineEvent::Inbound(Box::new(message)));
    }

    pub(crate) fn fire_outbound(&self, message: OutboundMessage) {
        let _ = self.events.send(PipelineEvent::Outbound(Box::new(message)));
    }

    pub(crate) fn fire_exception(&self, error: Error) {
        let _ = self.events.send(PipelineEvent::Exception(Box::new(error)));
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

fn dispatch(handlers: &HandlerList, outbound: &mpsc::UnboundedSender<MessageBuilder>, event: PipelineEvent) {
    let snapshot: Vec<Arc<dyn Handler>> = handlers
        .lock()
        .expect("handler list lock poisoned")
        .iter()
        .map(|(_, h)| Arc::clone(h))
        .collect();

    let mut consumed = false;

    for handler in &snapshot {
        let ctx = PipelineContext::new(outbound.clone());

        match &event {
            PipelineEvent::ConnectionActive => handler.on_connection_active(&ctx),
            PipelineEvent::ConnectionInactive => handler.on_connection_inactive(&ctx),
            PipelineEvent::Inbound(message) => handler.on_inbound_message(&ctx, message),
            PipelineEvent::Outbound(message) => handler.on_outbound_message(&ctx, message),
            PipelineEvent::User(user_event) => handler.on_user_event(&ctx, user_event),
            PipelineEvent::Exception(error) => handler.on_exception(&ctx, error),
        }

        if !ctx.propagated.get() {
            consumed = true;
            break;
        }
    }

    if consumed {
        return;
    }

    // No handler claimed an incoming method call that expects a reply:
    // answer with a default `NotSupported` error rather than going silent.
    if let PipelineEvent::Inbound(message) = event {
        respond_not_supported(outbound, &message);
    }
}

fn respond_not_supported(outbound: &mpsc::UnboundedSender<MessageBuilder>, message: &InboundMessage) {
    use dbus_peer_core::{BasicValue, Flags, MessageType, Value};

    if message.header.message_type != MessageType::MethodCall {
        return;
    }
    if message.header.flags.contains(Flags::NO_REPLY_EXPECTED) {
        return;
    }

    let mut builder = MessageBuilder::error(message.header.serial, "org.freedesktop.DBus.Error.NotSupported").body(
        vec![Value::Basic(BasicValue::String(
            "no handler claimed this method call".into(),
        ))],
    );

    if let Some(sender) = &message.header.fields.sender {
        builder = builder.destination(sender.clone());
    }

    let _ = outbound.send(builder);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    impl Handler for CountingHandler {
        fn on_connection_active(&self, ctx: &PipelineContext) {
            self.count.fetch_add(1, Ordering::SeqCst);
            ctx.propagate();
        }
    }

    struct ConsumingHandler;

    impl Handler for ConsumingHandler {
        fn on_connection_active(&self, _ctx: &PipelineContext) {
            // Does not call propagate(): consumes the event.
        }
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let (outbound, _rx) = mpsc::unbounded_channel();
        let pipeline = Pipeline::new(1, outbound);
        let count = Arc::new(AtomicUsize::new(0));
        pipeline.add_handler("a", Arc::new(CountingHandler { count: count.clone() }));
        pipeline.add_handler("b", Arc::new(CountingHandler { count: count.clone() }));

        pipeline.fire_connection_active();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn a_consuming_handler_stops_propagation() {
        let (outbound, _rx) = mpsc::unbounded_channel();
        let pipeline = Pipeline::new(1, outbound);
        let count = Arc::new(AtomicUsize::new(0));
        pipeline.add_handler("consume", Arc::new(ConsumingHandler));
        pipeline.add_handler("after", Arc::new(CountingHandler { count: count.clone() }));

        pipeline.fire_connection_active();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remove_handler_drops_it_from_future_dispatch() {
        let (outbound, _rx) = mpsc::unbounded_channel();
        let pipeline = Pipeline::new(1, outbound);
        let count = Arc::new(AtomicUsize::new(0));
        pipeline.add_handler("temp", Arc::new(CountingHandler { count: count.clone() }));
        assert!(pipeline.remove_handler("temp"));

        pipeline.fire_connection_active();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
