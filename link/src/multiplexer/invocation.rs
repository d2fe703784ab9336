//! Client-side bookkeeping for one request or subscription.

use crate::{
    cancellable::Cancellable,
    error::Result,
    models::{Request, RequestIdentifier},
    reset_lock::ResetLock,
};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Completion of a one-shot request.
pub type Completion = Box<dyn FnOnce(Result<JsonValue>) + Send>;

/// Result of the request that opened a subscription. Called on every
/// (re)initiation.
pub type InitiatedHandler = Arc<dyn Fn(Result<JsonValue>) + Send + Sync>;

/// Receives subscription events together with a token that ends the subscription.
pub type EventHandler = Arc<dyn Fn(Cancellable, JsonValue) + Send + Sync>;

static NEXT_UNIQUE_ID: AtomicU64 = AtomicU64::new(1);

/// 0 encodes "no identifier"; identifiers start at 1.
const UNASSIGNED: u64 = 0;

pub struct Invocation {
    unique_id: u64,
    request: Request,
    identifier: AtomicU64,
    created_at: SystemTime,
    kind: InvocationKind,
}

enum InvocationKind {
    Single {
        completion: ResetLock<Completion>,
    },
    Subscription {
        initiated: ResetLock<InitiatedHandler>,
        handler: ResetLock<EventHandler>,
        needs_retry: AtomicBool,
    },
}

impl Invocation {
    pub fn single(request: Request, created_at: SystemTime, completion: Completion) -> Arc<Self> {
        Arc::new(Self::with_kind(
            request,
            created_at,
            InvocationKind::Single {
                completion: ResetLock::new(completion),
            },
        ))
    }

    pub fn subscription(
        request: Request,
        created_at: SystemTime,
        initiated: Option<InitiatedHandler>,
        handler: EventHandler,
    ) -> Arc<Self> {
        Arc::new(Self::with_kind(
            request,
            created_at,
            InvocationKind::Subscription {
                initiated: initiated.map(ResetLock::new).unwrap_or_else(ResetLock::empty),
                handler: ResetLock::new(handler),
                needs_retry: AtomicBool::new(false),
            },
        ))
    }

    fn with_kind(request: Request, created_at: SystemTime, kind: InvocationKind) -> Self {
        Self {
            unique_id: NEXT_UNIQUE_ID.fetch_add(1, Ordering::Relaxed),
            request,
            identifier: AtomicU64::new(UNASSIGNED),
            created_at,
            kind,
        }
    }

    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn identifier(&self) -> Option<RequestIdentifier> {
        match self.identifier.load(Ordering::SeqCst) {
            UNASSIGNED => None,
            value => Some(RequestIdentifier::new(value)),
        }
    }

    pub(crate) fn set_identifier(&self, identifier: Option<RequestIdentifier>) {
        let value = identifier.map(RequestIdentifier::get).unwrap_or(UNASSIGNED);
        self.identifier.store(value, Ordering::SeqCst);
    }

    pub fn is_subscription(&self) -> bool {
        matches!(self.kind, InvocationKind::Subscription { .. })
    }

    /// True while unidentified and someone still wants the answer.
    pub fn needs_assignment(&self) -> bool {
        self.identifier().is_none() && self.has_callbacks()
    }

    fn has_callbacks(&self) -> bool {
        match &self.kind {
            InvocationKind::Single { completion } => completion.is_set(),
            InvocationKind::Subscription { handler, .. } => handler.is_set(),
        }
    }

    /// Whether `retry_timeout` has elapsed at `now`.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self.request.retry_timeout {
            Some(timeout) => self.created_at + timeout <= now,
            None => false,
        }
    }

    /// The request that tears this invocation down on the server, if any.
    pub fn cancel_request(&self) -> Option<Request> {
        match (&self.kind, self.identifier()) {
            (InvocationKind::Subscription { .. }, Some(identifier)) => {
                Some(Request::unsubscribe(identifier))
            },
            _ => None,
        }
    }

    /// Drop every callback. Returns whether any was still present.
    pub(crate) fn cancel_callbacks(&self) -> bool {
        match &self.kind {
            InvocationKind::Single { completion } => completion.pop().is_some(),
            InvocationKind::Subscription {
                initiated, handler, ..
            } => {
                initiated.reset();
                handler.pop().is_some()
            },
        }
    }

    /// Take the completion of a single request; `None` once resolved or cancelled.
    pub(crate) fn take_completion(&self) -> Option<Completion> {
        match &self.kind {
            InvocationKind::Single { completion } => completion.pop(),
            InvocationKind::Subscription { .. } => None,
        }
    }

    pub(crate) fn initiated(&self) -> Option<InitiatedHandler> {
        match &self.kind {
            InvocationKind::Subscription { initiated, .. } => initiated.read(),
            InvocationKind::Single { .. } => None,
        }
    }

    pub(crate) fn event_handler(&self) -> Option<EventHandler> {
        match &self.kind {
            InvocationKind::Subscription { handler, .. } => handler.read(),
            InvocationKind::Single { .. } => None,
        }
    }

    pub fn needs_retry(&self) -> bool {
        match &self.kind {
            InvocationKind::Subscription { needs_retry, .. } => needs_retry.load(Ordering::SeqCst),
            InvocationKind::Single { .. } => false,
        }
    }

    pub(crate) fn set_needs_retry(&self, value: bool) {
        if let InvocationKind::Subscription { needs_retry, .. } = &self.kind {
            needs_retry.store(value, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("unique_id", &self.unique_id)
            .field(
                "kind",
                &if self.is_subscription() {
                    "subscription"
                } else {
                    "single"
                },
            )
            .field("command", &self.request.kind.command())
            .field("identifier", &self.identifier())
            .finish()
    }
}
