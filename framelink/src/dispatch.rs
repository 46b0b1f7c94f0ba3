//! Inbound message classification and per-kind handler registry

use crate::results::AnalysisResult;
use framelink_core::{FramelinkError, InboundMessage, MessageKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Callback invoked for each result of a registered kind
pub type ResultHandler = Arc<dyn Fn(&AnalysisResult) + Send + Sync>;

/// What to do with one text message from the peer
#[derive(Debug)]
pub enum Inbound {
    /// A result to record and hand to handlers
    Result(AnalysisResult),
    /// The peer wants a `pong`
    Ping,
    /// Well-formed, but of a kind nobody handles
    Unknown {
        /// The unrecognised `type`
        kind: String,
    },
    /// Not a valid message at all
    Malformed(FramelinkError),
}

impl Inbound {
    /// Classify a raw text message
    pub fn classify(text: &str) -> Self {
        match InboundMessage::parse(text) {
            Ok(InboundMessage::Ping) => Inbound::Ping,
            Ok(InboundMessage::Unknown { kind, .. }) => Inbound::Unknown { kind },
            Ok(message) => match AnalysisResult::from_message(message) {
                Some(result) => Inbound::Result(result),
                None => Inbound::Malformed(FramelinkError::protocol("message carries no result")),
            },
            Err(e) => Inbound::Malformed(e),
        }
    }
}

/// Handlers keyed by result kind
#[derive(Default)]
pub struct MessageDispatcher {
    handlers: RwLock<HashMap<MessageKind, Vec<ResultHandler>>>,
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        let counts: HashMap<_, _> = handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("MessageDispatcher")
            .field("handlers", &counts)
            .finish()
    }
}

impl MessageDispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one kind; handlers run in registration order
    pub fn on<F>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(&AnalysisResult) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Run every handler registered for the result's kind
    ///
    /// Returns how many handlers ran. Handlers may register further handlers;
    /// those apply from the next result on.
    pub fn dispatch(&self, result: &AnalysisResult) -> usize {
        let handlers = match self.handlers.read().get(&result.kind) {
            Some(handlers) => handlers.clone(),
            None => return 0,
        };
        for handler in &handlers {
            handler(result);
        }
        handlers.len()
    }

    /// Handlers registered for a kind
    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Remove every handler
    pub fn clear(&self) {
        self.handlers.write().clear();
    }
}
