/// Typed event-subscription registry.
///
/// An explicit multi-map from event name to an ordered list of handlers,
/// with a single `notify` entry point. Handlers run synchronously in
/// registration order; dispatch scheduling is the caller's concern.
use crate::payload::Payload;
use crate::socket::{AckSender, Socket};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Application handler for a named event: the receiving session, the event
/// arguments, and an ack sender when the peer requested one.
pub type EventCallback = Arc<dyn Fn(Arc<Socket>, Vec<Payload>, Option<AckSender>) + Send + Sync>;

#[derive(Default)]
pub struct EventHandlers {
    handlers: RwLock<HashMap<String, Vec<EventCallback>>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: &str, callback: EventCallback) {
        let mut handlers = self.handlers.write().unwrap();
        handlers.entry(event.to_string()).or_default().push(callback);
    }

    /// Invoke every handler registered for `event`, in registration order.
    /// Returns the number of handlers invoked.
    pub fn notify(
        &self,
        socket: &Arc<Socket>,
        event: &str,
        args: &[Payload],
        ack: Option<AckSender>,
    ) -> usize {
        let callbacks = {
            let handlers = self.handlers.read().unwrap();
            match handlers.get(event) {
                Some(list) => list.clone(),
                None => return 0,
            }
        };

        let count = callbacks.len();
        let mut ack = ack;
        for callback in callbacks {
            // The ack sender is single-use; the first handler takes it.
            callback(Arc::clone(socket), args.to_vec(), ack.take());
        }
        count
    }
}
