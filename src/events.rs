//! State-update fan-out
//!
//! The receive loop hands every decoded value/text-state batch to the
//! [`EventRouter`], which looks each identifier up in the active
//! [`SubscriberTable`] and pushes the state into the registered sinks.
//! Sinks are unbounded channel senders, so dispatch never blocks the loop;
//! anything slower than a `send` belongs on the receiving side.
//!
//! The table is an immutable snapshot. Rebuild it with
//! [`SubscriberTable::builder`] and swap it in with [`EventRouter::install`];
//! a dispatch already in progress finishes against the snapshot it loaded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tracing::warn;

use crate::client::message::{TextState, ValueState};
use crate::error::LoxoneError;
use crate::uuid::Uuid;

/// Sink receiving value states for a subscribed identifier
pub type ValueStateSink = mpsc::UnboundedSender<ValueState>;

/// Sink receiving text states for a subscribed identifier
pub type TextStateSink = mpsc::UnboundedSender<TextState>;

/// Sink receiving fan-out dispatch errors
pub type ErrorSink = Box<dyn Fn(&LoxoneError) + Send + Sync>;

/// Immutable identifier-to-subscriber snapshot
#[derive(Default)]
pub struct SubscriberTable {
    values: HashMap<Uuid, Vec<ValueStateSink>>,
    texts: HashMap<Uuid, Vec<TextStateSink>>,
}

impl SubscriberTable {
    pub fn builder() -> SubscriberTableBuilder {
        SubscriberTableBuilder::default()
    }

    /// Number of identifiers with at least one subscriber.
    pub fn len(&self) -> usize {
        self.values.len().max(self.texts.len())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.texts.is_empty()
    }
}

/// Accumulates subscriptions for the next table snapshot
#[derive(Default)]
pub struct SubscriberTableBuilder {
    table: SubscriberTable,
}

impl SubscriberTableBuilder {
    /// Register one channel receiving value states for all of `identifiers`.
    pub fn subscribe_values<I>(&mut self, identifiers: I) -> mpsc::UnboundedReceiver<ValueState>
    where
        I: IntoIterator<Item = Uuid>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        for uuid in identifiers {
            self.table.values.entry(uuid).or_default().push(tx.clone());
        }
        rx
    }

    /// Register one channel receiving text states for all of `identifiers`.
    pub fn subscribe_texts<I>(&mut self, identifiers: I) -> mpsc::UnboundedReceiver<TextState>
    where
        I: IntoIterator<Item = Uuid>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        for uuid in identifiers {
            self.table.texts.entry(uuid).or_default().push(tx.clone());
        }
        rx
    }

    pub fn build(self) -> SubscriberTable {
        self.table
    }
}

/// Routes decoded state batches to the current subscriber snapshot.
pub struct EventRouter {
    table: ArcSwap<SubscriberTable>,
    error_sink: Mutex<Option<ErrorSink>>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(SubscriberTable::default()),
            error_sink: Mutex::new(None),
        }
    }

    /// Atomically replace the active subscriber table.
    pub fn install(&self, table: SubscriberTable) {
        self.table.store(Arc::new(table));
    }

    /// Register the single sink receiving fan-out dispatch errors.
    ///
    /// Without one, dispatch errors are logged and dropped.
    pub fn set_error_sink(&self, sink: ErrorSink) {
        *self.error_sink.lock().expect("error sink poisoned") = Some(sink);
    }

    /// Fan a value-state batch out to its subscribers.
    ///
    /// Identifiers without a subscriber are silently dropped; a state update
    /// for a device missing from the structure description is not an error.
    pub fn dispatch_value_states(&self, states: &[ValueState]) {
        let table = self.table.load();
        for state in states {
            let Some(sinks) = table.values.get(&state.control) else {
                continue;
            };
            for sink in sinks {
                if sink.send(state.clone()).is_err() {
                    self.report(LoxoneError::connection(format!(
                        "value-state subscriber for {} is gone",
                        state.control
                    )));
                }
            }
        }
    }

    /// Fan a text-state batch out to its subscribers.
    pub fn dispatch_text_states(&self, states: &[TextState]) {
        let table = self.table.load();
        for state in states {
            let Some(sinks) = table.texts.get(&state.control) else {
                continue;
            };
            for sink in sinks {
                if sink.send(state.clone()).is_err() {
                    self.report(LoxoneError::connection(format!(
                        "text-state subscriber for {} is gone",
                        state.control
                    )));
                }
            }
        }
    }

    fn report(&self, error: LoxoneError) {
        match &*self.error_sink.lock().expect("error sink poisoned") {
            Some(sink) => sink(&error),
            None => warn!(error = %error, "state dispatch error"),
        }
    }
}
