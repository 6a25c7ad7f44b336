//! Keeping track of what we were doing when something went wrong.
//!
//! Every step of a retrieval runs inside an [`Operation`]. Operations know
//! their parent, so when a step fails the [`Tracer`] can explain the failure
//! in terms of everything that was going on at the time ("fetch in retrieve:
//! git https://...").

use failure::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Retrieve,
    Availability,
    Credentials,
    Checkout,
    Cloning,
    Fetch,
    Reset,
    CheckoutRevision,
    ResolveRevision,
    Update,
    Version,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match *self {
            OperationKind::Retrieve => "retrieve",
            OperationKind::Availability => "availability",
            OperationKind::Credentials => "credentials",
            OperationKind::Checkout => "checkout",
            OperationKind::Cloning => "cloning",
            OperationKind::Fetch => "fetch",
            OperationKind::Reset => "reset",
            OperationKind::CheckoutRevision => "checkout_revision",
            OperationKind::ResolveRevision => "resolve_revision",
            OperationKind::Update => "update",
            OperationKind::Version => "version",
        }
    }
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step in a retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation<'a> {
    kind: OperationKind,
    explanation: Option<String>,
    parent: Option<&'a Operation<'a>>,
}

impl Operation<'static> {
    /// Start a brand new chain of operations.
    pub fn root<S: Into<String>>(kind: OperationKind, explanation: S) -> Operation<'static> {
        Operation {
            kind,
            explanation: Some(explanation.into()),
            parent: None,
        }
    }
}

impl<'a> Operation<'a> {
    /// An operation carried out as part of this one.
    pub fn child(&self, kind: OperationKind) -> Operation {
        Operation {
            kind,
            explanation: None,
            parent: Some(self),
        }
    }

    pub fn explained<S: Into<String>>(mut self, explanation: S) -> Operation<'a> {
        self.explanation = Some(explanation.into());
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn explanation(&self) -> Option<&str> {
        self.explanation.as_ref().map(|e| e.as_str())
    }

    pub fn parent(&self) -> Option<&Operation> {
        self.parent
    }

    /// How many operations deep this is, starting at 1.
    pub fn depth(&self) -> usize {
        1 + self.parent.map(|p| p.depth()).unwrap_or(0)
    }

    /// This operation followed by everything enclosing it.
    pub fn context(&self) -> String {
        let mut context = self.to_string();
        let mut parent = self.parent;

        while let Some(p) = parent {
            context.push_str(" in ");
            context.push_str(&p.to_string());
            parent = p.parent;
        }

        context
    }
}

impl<'a> Display for Operation<'a> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.explanation() {
            Some(explanation) if !explanation.is_empty() => {
                write!(f, "{}: {}", self.kind(), explanation)
            }
            _ => write!(f, "{}", self.kind()),
        }
    }
}

/// Told about the start, success and failure of every operation.
pub trait Tracer: Send + Sync {
    fn started(&self, _op: &Operation) {}

    fn succeeded(&self, _op: &Operation) {}

    fn note_error(&self, op: &Operation, error: &Error);
}

impl<T: Tracer + ?Sized> Tracer for Arc<T> {
    fn started(&self, op: &Operation) {
        (**self).started(op)
    }

    fn succeeded(&self, op: &Operation) {
        (**self).succeeded(op)
    }

    fn note_error(&self, op: &Operation, error: &Error) {
        (**self).note_error(op, error)
    }
}

/// A tracer which sends everything to the `log` crate.
///
/// Progress goes out at `debug` level, prefixed with one `>` per level of
/// nesting. Failures are always logged at `error` level.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn started(&self, op: &Operation) {
        debug!("{} begin {}", depth_marker(op), op);
    }

    fn succeeded(&self, op: &Operation) {
        debug!("{} close {}", depth_marker(op), op);
    }

    fn note_error(&self, op: &Operation, error: &Error) {
        debug!("{} abort {}", depth_marker(op), op);
        error!("Saw {} during {}", error, op.context());
    }
}

fn depth_marker(op: &Operation) -> String {
    ">".repeat(op.depth())
}

/// Run `f` as part of `op`, letting the tracer know how it went.
///
/// Errors are handed back untouched.
pub fn trace<T, F>(tracer: &dyn Tracer, op: &Operation, f: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error>,
{
    tracer.started(op);

    match f() {
        Ok(value) => {
            tracer.succeeded(op);
            Ok(value)
        }
        Err(e) => {
            tracer.note_error(op, &e);
            Err(e)
        }
    }
}
