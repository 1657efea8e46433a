//! Request/response correlation and dispatch.
//!
//! A serial-keyed table of outstanding calls, using the `tokio::sync::
//! oneshot` channel the wider tokio ecosystem reaches for whenever a
//! single async caller needs to be woken by a different task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dbus_peer_core::{BasicValue, MessageType, Value};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::{Error, ErrorKind, Result};
use crate::message::InboundMessage;
use crate::pipeline::Pipeline;

enum PendingEntry {
    /// Created by `send_request`: the caller is awaiting a oneshot directly.
    Direct {
        reply: oneshot::Sender<Result<InboundMessage>>,
        timer: AbortHandle,
    },
    /// Created by `send_and_route`: the eventual reply is delivered to the
    /// pipeline as an inbound message instead of completing a future.
    Routed,
}

/// The serial-keyed pending-reply table backing
/// [`crate::connection::Connection::send_request`] and
/// [`crate::connection::Connection::send_and_route`].
pub(crate) struct Correlator {
    pending: Mutex<HashMap<u32, PendingEntry>>,
}

impl Correlator {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Register a direct pending reply for `serial`, arming a timeout that
    /// fails the call with `ErrorKind::Timeout` if nothing arrives in time.
    pub(crate) fn register_direct(
        self: &Arc<Self>,
        serial: u32,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<InboundMessage>> {
        let (tx, rx) = oneshot::channel();

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let entry = this.pending.lock().expect("pending lock poisoned").remove(&serial);
            if let Some(PendingEntry::Direct { reply, .. }) = entry {
                let _ = reply.send(Err(ErrorKind::Timeout { serial, elapsed: timeout }.into()));
            }
        });

        self.pending.lock().expect("pending lock poisoned").insert(
            serial,
            PendingEntry::Direct {
                reply: tx,
                timer: handle.abort_handle(),
            },
        );

        rx
    }

    /// Register a routed pending reply for `serial`: no future is handed
    /// back, the eventual reply is delivered to `pipeline` instead.
    pub(crate) fn register_routed(&self, serial: u32) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(serial, PendingEntry::Routed);
    }

    /// Remove a pending entry without completing it, e.g. because the
    /// write that would have produced a reply never went out.
    pub(crate) fn cancel(&self, serial: u32) {
        if let Some(PendingEntry::Direct { timer, .. }) =
            self.pending.lock().expect("pending lock poisoned").remove(&serial)
        {
            timer.abort();
        }
    }

    /// Route a `MethodReturn` or `Error` message to whoever is waiting on
    /// its `reply_serial`, or discard it with a warning if nobody is.
    pub(crate) fn complete(&self, message: InboundMessage, pipeline: &Pipeline) {
        let Some(reply_serial) = message.header.fields.reply_serial else {
            tracing::warn!("reply message without a REPLY_SERIAL field, discarding");
            return;
        };

        let entry = self.pending.lock().expect("pending lock poisoned").remove(&reply_serial);

        match entry {
            Some(PendingEntry::Direct { reply, timer }) => {
                timer.abort();
                let result = if message.header.message_type == MessageType::Error {
                    Err(bus_error(&message, reply_serial))
                } else {
                    Ok(message)
                };
                if reply.send(result).is_err() {
                    tracing::warn!(serial = reply_serial, "reply arrived after its call was cancelled");
                }
            }
            Some(PendingEntry::Routed) => {
                pipeline.fire_inbound(message);
            }
            None => {
                tracing::warn!(serial = reply_serial, "discarding unsolicited reply");
            }
        }
    }

    /// Fail every pending direct call with `Closed` and drop every routed
    /// registration. Idempotent: calling this on an already-empty table is
    /// a no-op.
    pub(crate) fn fail_all(&self) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        for (_, entry) in pending.drain() {
            if let PendingEntry::Direct { reply, timer } = entry {
                timer.abort();
                let _ = reply.send(Err(ErrorKind::Closed.into()));
            }
        }
    }
}

fn bus_error(message: &InboundMessage, reply_serial: u32) -> Error {
    let name = message.header.fields.error_name.clone().unwrap_or_default();
    let text = message
        .body
        .first()
        .and_then(|value| match value {
            Value::Basic(BasicValue::String(s)) => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_default();

    ErrorKind::BusError {
        name,
        message: text,
        reply_serial,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBuilder, OutboundMessage};
    use std::time::Duration;

    fn method_return_for(serial: u32, text: &str) -> InboundMessage {
        let outbound: OutboundMessage = MessageBuilder::method_return(serial)
            .body(vec![Value::Basic(BasicValue::String(text.into()))])
            .build(99)
            .unwrap();

        InboundMessage {
            header: outbound.header,
            body: outbound.body,
        }
    }

    #[tokio::test]
    async fn a_direct_reply_completes_the_waiting_future() {
        let correlator = Correlator::new();
        let rx = correlator.register_direct(1, Duration::from_secs(5));

        let pipeline = Pipeline::new(1, tokio::sync::mpsc::unbounded_channel().0);
        correlator.complete(method_return_for(1, "hi"), &pipeline);

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.body, vec![Value::Basic(BasicValue::String("hi".into()))]);
    }

    #[tokio::test]
    async fn an_unsolicited_reply_is_discarded_without_panicking() {
        let correlator = Correlator::new();
        let pipeline = Pipeline::new(1, tokio::sync::mpsc::unbounded_channel().0);
        correlator.complete(method_return_for(42, "nobody waiting"), &pipeline);
    }

    #[tokio::test]
    async fn fail_all_fails_every_pending_direct_call() {
        let correlator = Correlator::new();
        let rx = correlator.register_direct(1, Duration::from_secs(5));
        correlator.fail_all();

        let error = rx.await.unwrap().unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn a_call_without_a_reply_times_out() {
        let correlator = Correlator::new();
        let rx = correlator.register_direct(1, Duration::from_millis(10));

        tokio::time::advance(Duration::from_millis(20)).await;

        let error = rx.await.unwrap().unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::Timeout { serial: 1, .. }));
    }
}
