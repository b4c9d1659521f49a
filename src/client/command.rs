//! Command/response correlation
//!
//! At most one command is in flight per connection. The pending slot holds
//! the single outstanding completion; claiming and clearing it are the only
//! synchronization points between command issuers and the receive loop. A
//! second enqueue attempt while the slot is occupied fails immediately, it
//! is never queued.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::client::message::MessageIdentifier;
use crate::crypto::Encryptor;
use crate::error::{LoxoneError, Result};

/// Status code of a successful command.
pub const STATUS_OK: i32 = 200;

/// Decoded JSON command response envelope.
///
/// The envelope schema is an external contract: a `value` of arbitrary shape
/// and a status code that some firmware versions encode as a string. A
/// non-success code is data, not an error; use [`LxResponse::ensure_success`]
/// when a failed command should abort the caller.
#[derive(Debug, Clone)]
pub struct LxResponse {
    /// Echo of the command this envelope answers
    pub control: String,
    /// Response value
    pub value: Value,
    /// Status code (200 = success)
    pub code: i32,
}

impl LxResponse {
    /// Parse a response envelope from its JSON text.
    pub fn parse(text: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(text)?;
        let envelope = root
            .get("LL")
            .ok_or_else(|| LoxoneError::parsing("response envelope is missing the LL object"))?;

        let code = envelope
            .get("Code")
            .or_else(|| envelope.get("code"))
            .and_then(|code| match code {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .ok_or_else(|| LoxoneError::parsing("response envelope has no status code"))?;

        Ok(Self {
            control: envelope
                .get("control")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            value: envelope.get("value").cloned().unwrap_or(Value::Null),
            code: code as i32,
        })
    }

    /// Whether the Miniserver reported success.
    pub fn is_success(&self) -> bool {
        self.code == STATUS_OK
    }

    /// Convert a non-success status into [`LoxoneError::CommandStatus`].
    pub fn ensure_success(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(LoxoneError::CommandStatus(self.code))
        }
    }

    /// The response value as a string, if it is one.
    pub fn value_as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// The single outstanding command awaiting its response frame.
pub(crate) struct PendingCommand {
    /// Applied to the raw response text before resolution
    decoder: Option<Arc<Encryptor>>,
    completion: oneshot::Sender<Result<String>>,
}

impl PendingCommand {
    pub(crate) fn new(
        decoder: Option<Arc<Encryptor>>,
    ) -> (Self, oneshot::Receiver<Result<String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                decoder,
                completion: tx,
            },
            rx,
        )
    }

    /// Resolve with the raw response text, decoding it first if the command
    /// asked for an encrypted reply. The requester may have given up; a
    /// dropped receiver is not an error.
    pub(crate) fn resolve(self, raw: Result<String>) {
        let outcome = raw.and_then(|text| match &self.decoder {
            Some(decoder) => decoder.decode_response(&text),
            None => Ok(text),
        });
        let _ = self.completion.send(outcome);
    }
}

/// Holder of the at-most-one pending command.
#[derive(Default)]
pub(crate) struct PendingSlot {
    inner: Mutex<Option<PendingCommand>>,
}

impl PendingSlot {
    /// Install `command` as the pending one; fails fast when the slot is
    /// already occupied.
    pub(crate) fn enqueue(&self, command: PendingCommand) -> Result<()> {
        let mut slot = self.inner.lock().expect("pending slot poisoned");
        if slot.is_some() {
            return Err(LoxoneError::CommandPending);
        }
        *slot = Some(command);
        Ok(())
    }

    /// Claim the pending command if `identifier` announces its response.
    pub(crate) fn claim_for(&self, identifier: MessageIdentifier) -> Option<PendingCommand> {
        let mut slot = self.inner.lock().expect("pending slot poisoned");
        if identifier.is_command_response() {
            slot.take()
        } else {
            None
        }
    }

    /// Remove the pending command unconditionally (send failure, teardown).
    pub(crate) fn clear(&self) -> Option<PendingCommand> {
        self.inner.lock().expect("pending slot poisoned").take()
    }
}
