//! Request/subscription multiplexer.
//!
//! Tracks every in-flight request and subscription, hands out identifiers
//! when sending is allowed, and decides what survives a lost socket.
//!
//! Bookkeeping:
//!
//! - `pending`: every unresolved socket-scoped invocation (assigned or not),
//!   in insertion order, plus perpetual invocations not yet assigned.
//! - `active`: identifier index over the assigned socket-scoped entries of
//!   `pending`, valid for the current socket only.
//! - `perpetual`: assigned Rest invocations. They leave `pending` on assignment
//!   and are never replayed.

pub mod invocation;

use crate::{
    clock::Clock,
    dispatch::DispatchQueue,
    error::HassLinkError,
    models::{AllowedKinds, RequestIdentifier},
    protected::Protected,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

pub use invocation::{Completion, EventHandler, InitiatedHandler, Invocation};

/// The side of the connection that knows the phase and owns the socket.
pub trait MultiplexerDelegate: Send + Sync {
    /// Which request kinds may be transmitted right now.
    fn allowed_send_kinds(&self) -> AllowedKinds;

    /// `invocation` was just assigned an identifier and must be transmitted.
    fn did_prepare(&self, invocation: Arc<Invocation>);
}

struct MultiplexerState {
    next_identifier: u64,
    pending: Vec<Arc<Invocation>>,
    active: HashMap<RequestIdentifier, Arc<Invocation>>,
    perpetual: HashMap<RequestIdentifier, Arc<Invocation>>,
    retry_subscriptions_timer: Option<JoinHandle<()>>,
}

impl Default for MultiplexerState {
    fn default() -> Self {
        Self {
            next_identifier: 1,
            pending: Vec::new(),
            active: HashMap::new(),
            perpetual: HashMap::new(),
            retry_subscriptions_timer: None,
        }
    }
}

pub struct Multiplexer {
    state: Protected<MultiplexerState>,
    delegate: Weak<dyn MultiplexerDelegate>,
    clock: Arc<dyn Clock>,
    callback_queue: DispatchQueue,
    retry_subscriptions_delay: Duration,
    weak_self: Weak<Multiplexer>,
}

impl Multiplexer {
    pub fn new(
        delegate: Weak<dyn MultiplexerDelegate>,
        clock: Arc<dyn Clock>,
        callback_queue: DispatchQueue,
        retry_subscriptions_delay: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            state: Protected::default(),
            delegate,
            clock,
            callback_queue,
            retry_subscriptions_delay,
            weak_self: weak_self.clone(),
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Track `invocation` and send it as soon as that is allowed.
    pub fn add(&self, invocation: Arc<Invocation>) {
        log::debug!("[hass-link] Adding {:?}", invocation);
        self.state.mutate(|state| state.pending.push(invocation));
        self.prepare();
    }

    /// Stop tracking `invocation` and silence its callbacks.
    ///
    /// A subscription that was already sent on the current socket is torn down
    /// on the server with an `unsubscribe_events` request. Cancelling twice has
    /// no further effect.
    pub fn cancel(&self, invocation: &Arc<Invocation>) {
        // Identifiers are only assigned under this lock, so the cancel request
        // matches what `prepare` has handed out.
        let cancel_request = self
            .state
            .mutate(|state| {
                state.pending.retain(|entry| !Arc::ptr_eq(entry, invocation));
                if let Some(identifier) = invocation.identifier() {
                    remove_if_same(&mut state.active, identifier, invocation);
                    remove_if_same(&mut state.perpetual, identifier, invocation);
                }
                invocation.cancel_request()
            })
            .into_inner();

        let was_live = invocation.cancel_callbacks();
        log::debug!("[hass-link] Cancelled {:?}", invocation);

        match cancel_request {
            Some(request) if was_live => {
                let created_at = self.clock.now();
                self.add(Invocation::single(request, created_at, Box::new(|_| {})));
            },
            _ => self.prepare(),
        }
    }

    /// Assign identifiers to everything that may be sent now, then transmit.
    pub fn prepare(&self) {
        let allowed = match self.delegate.upgrade() {
            Some(delegate) => delegate.allowed_send_kinds(),
            None => AllowedKinds::NONE,
        };

        let delegate = self.delegate.clone();
        self.state
            .mutate(|state| {
                let mut assigned = Vec::new();
                let mut remaining = Vec::with_capacity(state.pending.len());

                for invocation in state.pending.drain(..) {
                    let kind = invocation.request().kind.kind();
                    if !allowed.contains(kind) || !invocation.needs_assignment() {
                        remaining.push(invocation);
                        continue;
                    }

                    let identifier = RequestIdentifier::new(state.next_identifier);
                    state.next_identifier += 1;
                    invocation.set_identifier(Some(identifier));

                    if invocation.request().kind.is_perpetual() {
                        state.perpetual.insert(identifier, invocation.clone());
                    } else {
                        state.active.insert(identifier, invocation.clone());
                        remaining.push(invocation.clone());
                    }
                    assigned.push(invocation);
                }

                state.pending = remaining;
                assigned
            })
            .deliver_on(&self.callback_queue, move |assigned| {
                if assigned.is_empty() {
                    return;
                }
                let Some(delegate) = delegate.upgrade() else {
                    log::debug!("[hass-link] Dropping transmissions: connection is gone");
                    return;
                };
                for invocation in assigned {
                    delegate.did_prepare(invocation);
                }
            });
    }

    /// Forget the current socket.
    ///
    /// Socket-scoped invocations that should be retried (and whose
    /// `retry_timeout` has not elapsed) lose their identifier and wait for the
    /// next socket. Every other socket-scoped invocation is dropped; a dropped
    /// request completes with an error. Perpetual invocations are untouched.
    pub fn reset_active(&self) {
        let now = self.clock.now();
        self.state
            .mutate(|state| {
                state.active.clear();

                let mut dropped = Vec::new();
                state.pending.retain(|invocation| {
                    if invocation.request().kind.is_perpetual() {
                        return true;
                    }
                    if invocation.request().should_retry && !invocation.is_expired(now) {
                        invocation.set_identifier(None);
                        true
                    } else {
                        dropped.push(invocation.clone());
                        false
                    }
                });
                dropped
            })
            .deliver_on(&self.callback_queue, |dropped| {
                for invocation in dropped {
                    log::debug!("[hass-link] Dropping {:?} after disconnect", invocation);
                    if let Some(completion) = invocation.take_completion() {
                        completion(Err(HassLinkError::WebSocketError(
                            "Connection lost before a response arrived".to_string(),
                        )));
                    }
                    invocation.cancel_callbacks();
                }
            });
    }

    /// The single (non-subscription) invocation waiting on `identifier`.
    pub fn single(&self, identifier: RequestIdentifier) -> Option<Arc<Invocation>> {
        self.lookup(identifier).filter(|invocation| !invocation.is_subscription())
    }

    /// The subscription registered under `identifier`.
    pub fn subscription(&self, identifier: RequestIdentifier) -> Option<Arc<Invocation>> {
        self.lookup(identifier).filter(|invocation| invocation.is_subscription())
    }

    fn lookup(&self, identifier: RequestIdentifier) -> Option<Arc<Invocation>> {
        self.state.read(|state| {
            state
                .active
                .get(&identifier)
                .or_else(|| state.perpetual.get(&identifier))
                .cloned()
        })
    }

    /// Stop tracking a resolved invocation.
    pub fn clear(&self, invocation: &Arc<Invocation>) {
        self.state.mutate(|state| {
            state.pending.retain(|entry| !Arc::ptr_eq(entry, invocation));
            if let Some(identifier) = invocation.identifier() {
                remove_if_same(&mut state.active, identifier, invocation);
                remove_if_same(&mut state.perpetual, identifier, invocation);
            }
        });
    }

    /// Re-send failed subscriptions after a short coalescing delay.
    pub fn retry_subscriptions(&self) {
        let delay = self.retry_subscriptions_delay;
        let weak_self = self.weak_self.clone();
        self.state.mutate(|state| {
            if state.retry_subscriptions_timer.is_some() {
                return;
            }
            state.retry_subscriptions_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(multiplexer) = weak_self.upgrade() {
                    multiplexer.retry_failed_subscriptions();
                }
            }));
        });
    }

    fn retry_failed_subscriptions(&self) {
        let retried = self
            .state
            .mutate(|state| {
                state.retry_subscriptions_timer = None;

                let mut retried = 0;
                for invocation in &state.pending {
                    if !invocation.is_subscription()
                        || !invocation.needs_retry()
                        || !invocation.request().should_retry
                    {
                        continue;
                    }
                    if let Some(identifier) = invocation.identifier() {
                        remove_if_same(&mut state.active, identifier, invocation);
                    }
                    invocation.set_identifier(None);
                    retried += 1;
                }
                retried
            })
            .into_inner();

        if retried > 0 {
            log::info!("[hass-link] Retrying {} failed subscription(s)", retried);
        }
        self.prepare();
    }

    /// Number of tracked, unresolved invocations (pending plus perpetual).
    pub fn tracked_count(&self) -> usize {
        self.state
            .read(|state| state.pending.len() + state.perpetual.len())
    }

    /// Number of invocations assigned on the current socket.
    pub fn active_count(&self) -> usize {
        self.state.read(|state| state.active.len())
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.state.mutate(|state| {
            if let Some(timer) = state.retry_subscriptions_timer.take() {
                timer.abort();
            }
        });
    }
}

fn remove_if_same(
    map: &mut HashMap<RequestIdentifier, Arc<Invocation>>,
    identifier: RequestIdentifier,
    invocation: &Arc<Invocation>,
) {
    if map
        .get(&identifier)
        .is_some_and(|entry| Arc::ptr_eq(entry, invocation))
    {
        map.remove(&identifier);
    }
}
