//! The boundary to the computer-algebra backend.
//!
//! Cells never talk to the backend directly. They build a [`CasCommand`] and
//! hand it to a [`CasBackend`]; the backend answers by consuming the command
//! with [`CasCommand::fulfill`]. Consuming `self` makes a double answer
//! impossible.

use crate::error::CasError;
use quantum_expr::Expr;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use uuid::Uuid;

/// Correlates a command with its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CommandId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type CasOutcome = Result<Expr, CasError>;

type ResultCallback = Box<dyn FnOnce(CasOutcome)>;

/// A single-use request to evaluate `expression` given `inputs`.
pub struct CasCommand {
    id: CommandId,
    inputs: BTreeMap<String, Expr>,
    expression: Expr,
    on_result: ResultCallback,
}

impl CasCommand {
    pub fn new(
        id: CommandId,
        inputs: BTreeMap<String, Expr>,
        expression: Expr,
        on_result: impl FnOnce(CasOutcome) + 'static,
    ) -> Self {
        Self {
            id,
            inputs,
            expression,
            on_result: Box::new(on_result),
        }
    }

    pub fn id(&self) -> &CommandId {
        &self.id
    }

    /// Values of the names the expression reads. Free names are absent.
    pub fn inputs(&self) -> &BTreeMap<String, Expr> {
        &self.inputs
    }

    pub fn expression(&self) -> &Expr {
        &self.expression
    }

    /// The serializable part of the command.
    pub fn envelope(&self) -> CommandEnvelope {
        CommandEnvelope {
            id: self.id.clone(),
            inputs: self.inputs.clone(),
            expression: self.expression.clone(),
        }
    }

    /// Delivers the answer. The owner decides whether it is still wanted.
    pub fn fulfill(self, outcome: CasOutcome) {
        (self.on_result)(outcome);
    }
}

impl fmt::Debug for CasCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CasCommand")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("expression", &self.expression)
            .finish_non_exhaustive()
    }
}

/// Something that evaluates commands, now or later.
///
/// `dispatch` must not block. It may fulfill the command synchronously.
/// `cancel` is advisory: the owner ignores late answers on its own.
pub trait CasBackend {
    fn dispatch(&self, command: CasCommand);
    fn cancel(&self, id: &CommandId);
}

/// Outgoing message for a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: CommandId,
    pub inputs: BTreeMap<String, Expr>,
    pub expression: Expr,
}

/// Incoming message: `{"id": .., "result": ..}` or `{"id": .., "error": ".."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CasReply {
    pub id: CommandId,
    #[serde(flatten)]
    pub outcome: ReplyOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyOutcome {
    Result(Expr),
    Error(String),
}

impl From<ReplyOutcome> for CasOutcome {
    fn from(outcome: ReplyOutcome) -> Self {
        match outcome {
            ReplyOutcome::Result(expr) => Ok(expr),
            ReplyOutcome::Error(message) => Err(CasError::Failed(message)),
        }
    }
}

/// A message-passing backend.
///
/// Commands wait in an outbox until a transport drains them with
/// [`CommandQueue::next_envelope`]; replies are fed back by id.
#[derive(Default)]
pub struct CommandQueue {
    state: RefCell<QueueState>,
}

#[derive(Default)]
struct QueueState {
    outbox: VecDeque<CommandId>,
    pending: HashMap<CommandId, CasCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The oldest command not yet sent. Cancelled commands are skipped.
    pub fn next_envelope(&self) -> Option<CommandEnvelope> {
        let mut state = self.state.borrow_mut();
        while let Some(id) = state.outbox.pop_front() {
            if let Some(command) = state.pending.get(&id) {
                return Some(command.envelope());
            }
        }
        None
    }

    /// Commands waiting for a reply, sent or not.
    pub fn pending_len(&self) -> usize {
        self.state.borrow().pending.len()
    }

    pub fn is_pending(&self, id: &CommandId) -> bool {
        self.state.borrow().pending.contains_key(id)
    }

    /// Delivers a reply. Returns false if no command with that id is waiting.
    pub fn receive(&self, reply: CasReply) -> bool {
        let command = self.state.borrow_mut().pending.remove(&reply.id);
        match command {
            Some(command) => {
                command.fulfill(reply.outcome.into());
                true
            }
            None => {
                log::debug!("dropping reply for unknown command {}", reply.id);
                false
            }
        }
    }

    pub fn receive_json(&self, json: &str) -> Result<bool, CasError> {
        let reply: CasReply =
            serde_json::from_str(json).map_err(|err| CasError::MalformedReply(err.to_string()))?;
        Ok(self.receive(reply))
    }
}

impl CasBackend for CommandQueue {
    fn dispatch(&self, command: CasCommand) {
        let mut state = self.state.borrow_mut();
        state.outbox.push_back(command.id().clone());
        state.pending.insert(command.id().clone(), command);
    }

    fn cancel(&self, id: &CommandId) {
        let removed = self.state.borrow_mut().pending.remove(id);
        if removed.is_some() {
            log::debug!("cancelled command {id}");
        }
    }
}
