//! Reactive caches built from a populate request and event subscriptions.
//!
//! A [`Cache`] fetches its value with a [`PopulateInfo`] request once the
//! connection is authenticated, then keeps it current through one or more
//! [`SubscribeInfo`] subscriptions. Subscribers receive the current value as
//! soon as they attach and every replacement afterwards, on the connection's
//! callback queue.
//!
//! Transforms run on the work queue while the cache is locked, so each one
//! sees the value left by the previous one. A transform must not call back
//! into its own cache.
//!
//! The cache holds its connection weakly. The token returned by
//! [`Cache::subscribe`] holds the cache strongly, so keeping the token is what
//! keeps the cache alive.
//!
//! # Example
//!
//! ```rust,no_run
//! use hass_link::{Cache, CacheResponse, Connection, PopulateInfo, Request, SubscribeInfo};
//! use serde_json::Value;
//!
//! # fn example(connection: &Connection) {
//! let states: Cache<Vec<Value>> = Cache::new(
//!     connection,
//!     Some(PopulateInfo::new(Request::new("get_states"), |states: Vec<Value>, _| states)),
//!     vec![SubscribeInfo::new(
//!         Request::subscribe_events(Some("state_changed")),
//!         |_: Value, _, _| CacheResponse::<Vec<Value>>::ReissuePopulate,
//!     )],
//! );
//!
//! let token = states.subscribe(|_, states| println!("{} entities", states.len()));
//! // ... later
//! token.cancel();
//! # }
//! ```

mod populate;
mod subscribe;

pub use populate::PopulateInfo;
pub use subscribe::{CacheResponse, SubscribeInfo, SubscriptionPhase};

use crate::{
    cancellable::Cancellable,
    connection::{Connection, WeakConnection},
    dispatch::DispatchQueue,
    error::{HassLinkError, Result},
    protected::Protected,
};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

type CacheHandler<T> = Arc<dyn Fn(Cancellable, T) + Send + Sync>;
type StartUpstream<T> = Arc<dyn Fn(Weak<CacheInner<T>>) -> Cancellable + Send + Sync>;

/// A value kept current from the server. Cheap to clone.
pub struct Cache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct CacheInner<T> {
    source: Source<T>,
    work_queue: DispatchQueue,
    callback_queue: DispatchQueue,
    state: Protected<CacheState<T>>,
    weak_self: Weak<CacheInner<T>>,
}

enum Source<T> {
    Constant,
    Connection {
        connection: WeakConnection,
        populate: Option<PopulateInfo<T>>,
        subscribe: Vec<SubscribeInfo<T>>,
    },
    /// Derived from another cache, which the closure keeps alive.
    Mapped(StartUpstream<T>),
}

struct CacheState<T> {
    current: Option<T>,
    subscribers: Vec<(u64, CacheHandler<T>)>,
    next_subscriber: u64,
    /// The latest populate request; a reissue replaces it.
    populate_token: Option<Cancellable>,
    request_tokens: Vec<Cancellable>,
    should_reset_without_subscribers: bool,
    /// Bumped on every start and reset; callbacks from older starts are dropped.
    generation: u64,
}

impl<T> CacheState<T> {
    fn new(current: Option<T>, should_reset_without_subscribers: bool) -> Self {
        Self {
            current,
            subscribers: Vec::new(),
            next_subscriber: 0,
            populate_token: None,
            request_tokens: Vec::new(),
            should_reset_without_subscribers,
            generation: 0,
        }
    }

    fn has_requests(&self) -> bool {
        self.populate_token.is_some() || !self.request_tokens.is_empty()
    }

    fn take_requests(&mut self) -> Vec<Cancellable> {
        let mut tokens = std::mem::take(&mut self.request_tokens);
        tokens.extend(self.populate_token.take());
        tokens
    }

    /// Store `value` and return who should hear about it.
    fn store(&mut self, value: T) -> Vec<(u64, CacheHandler<T>)> {
        self.current = Some(value);
        self.subscribers.clone()
    }
}

/// What a transform decided, computed under the state lock.
enum Outcome<T> {
    Stale,
    Ignored,
    Replaced(T, Vec<(u64, CacheHandler<T>)>),
    Reissue,
    Failed(HassLinkError),
}

impl<T> Cache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A cache whose value never changes. It never talks to a connection and
    /// delivers synchronously.
    pub fn constant(value: T) -> Self {
        let queue = DispatchQueue::inline("hass-link.cache");
        Self::with_source(Source::Constant, Some(value), false, queue.clone(), queue)
    }

    /// A cache populated by `populate` and updated by `subscribe`. Requests
    /// start once `connection` is authenticated and a subscriber is attached.
    pub fn new(
        connection: &Connection,
        populate: Option<PopulateInfo<T>>,
        subscribe: Vec<SubscribeInfo<T>>,
    ) -> Self {
        let cache = Self::with_source(
            Source::Connection {
                connection: connection.downgrade(),
                populate,
                subscribe,
            },
            None,
            false,
            connection.work_queue().clone(),
            connection.callback_queue().clone(),
        );

        let weak = Arc::downgrade(&cache.inner);
        connection.observe_phase(move |phase| {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            if phase.is_command() {
                if inner.has_subscribers() {
                    inner.start();
                } else {
                    // Requests from the previous socket are gone; start afresh
                    // when the next subscriber attaches.
                    inner.discard_requests();
                }
            }
            true
        });
        cache
    }

    fn with_source(
        source: Source<T>,
        current: Option<T>,
        should_reset_without_subscribers: bool,
        work_queue: DispatchQueue,
        callback_queue: DispatchQueue,
    ) -> Self {
        Self {
            inner: Arc::new_cyclic(|weak_self| CacheInner {
                source,
                work_queue,
                callback_queue,
                state: Protected::new(CacheState::new(current, should_reset_without_subscribers)),
                weak_self: weak_self.clone(),
            }),
        }
    }

    /// When set, removing the last subscriber cancels the cache's requests
    /// and forgets its value. Off by default for connection-backed caches.
    pub fn set_should_reset_without_subscribers(&self, value: bool) {
        self.inner
            .state
            .mutate(|state| state.should_reset_without_subscribers = value);
    }

    /// The last known value.
    pub fn current(&self) -> Option<T> {
        self.inner.state.read(|state| state.current.clone())
    }

    /// Receive the current value (if any) and every later one.
    ///
    /// The returned token keeps the cache alive; cancel it to unsubscribe.
    /// The token handed to `handler` unsubscribes too but does not retain
    /// the cache.
    pub fn subscribe(
        &self,
        handler: impl Fn(Cancellable, T) + Send + Sync + 'static,
    ) -> Cancellable {
        let handler: CacheHandler<T> = Arc::new(handler);
        let (id, current, needs_start) = self
            .inner
            .state
            .mutate(|state| {
                state.next_subscriber += 1;
                let id = state.next_subscriber;
                state.subscribers.push((id, handler.clone()));
                (id, state.current.clone(), !state.has_requests())
            })
            .into_inner();

        if let Some(value) = current {
            let weak = self.inner.weak_self.clone();
            self.inner.callback_queue.dispatch(move || {
                if let Some(inner) = weak.upgrade() {
                    if inner.is_subscribed(id) {
                        handler(inner.handler_token(id), value);
                    }
                }
            });
        }
        if needs_start {
            self.inner.start();
        }

        let inner = self.inner.clone();
        Cancellable::new(move || inner.remove_subscriber(id))
    }

    /// Receive exactly one value, then unsubscribe.
    pub fn once(&self, handler: impl FnOnce(T) + Send + 'static) -> Cancellable {
        let handler = Mutex::new(Some(handler));
        self.subscribe(move |token, value| {
            let handler = handler
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(handler) = handler {
                token.cancel();
                handler(value);
            }
        })
    }

    /// Derive a cache whose value is `transform` of this one.
    ///
    /// The derived cache keeps this one alive and drops its upstream
    /// subscription when its own last subscriber leaves.
    pub fn map<U>(&self, transform: impl Fn(&T) -> U + Send + Sync + 'static) -> Cache<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        let source = self.clone();
        let transform = Arc::new(transform);
        let start: StartUpstream<U> = Arc::new(move |derived: Weak<CacheInner<U>>| {
            let transform = transform.clone();
            source.subscribe(move |token, value| match derived.upgrade() {
                Some(derived) => derived.replace(transform(&value)),
                None => token.cancel(),
            })
        });

        Cache::with_source(
            Source::Mapped(start),
            None,
            true,
            self.inner.work_queue.clone(),
            self.inner.callback_queue.clone(),
        )
    }
}

impl<T> CacheInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn has_subscribers(&self) -> bool {
        self.state.read(|state| !state.subscribers.is_empty())
    }

    fn is_subscribed(&self, id: u64) -> bool {
        self.state
            .read(|state| state.subscribers.iter().any(|(sid, _)| *sid == id))
    }

    fn handler_token(&self, id: u64) -> Cancellable {
        let weak = self.weak_self.clone();
        Cancellable::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_subscriber(id);
            }
        })
    }

    fn discard_requests(&self) {
        let tokens = self
            .state
            .mutate(|state| {
                state.generation += 1;
                state.take_requests()
            })
            .into_inner();
        for token in tokens {
            token.cancel();
        }
    }

    fn remove_subscriber(&self, id: u64) {
        let tokens = self
            .state
            .mutate(|state| {
                state.subscribers.retain(|(sid, _)| *sid != id);
                if state.subscribers.is_empty() && state.should_reset_without_subscribers {
                    state.current = None;
                    state.generation += 1;
                    state.take_requests()
                } else {
                    Vec::new()
                }
            })
            .into_inner();

        if !tokens.is_empty() {
            log::debug!("[hass-link] Cache lost its last subscriber, cancelling requests");
        }
        for token in tokens {
            token.cancel();
        }
    }

    /// (Re)start the populate/subscribe pipeline, superseding any earlier one.
    fn start(&self) {
        match &self.source {
            Source::Constant => {},
            Source::Mapped(start_upstream) => {
                let token = start_upstream(self.weak_self.clone());
                self.state.mutate(|state| state.request_tokens.push(token));
            },
            Source::Connection {
                connection,
                populate,
                ..
            } => {
                let Some(connection) = connection.upgrade() else {
                    log::warn!("[hass-link] Cache outlived its connection, not starting");
                    return;
                };
                if !connection.phase().is_command() {
                    return;
                }

                let (generation, stale) = self
                    .state
                    .mutate(|state| {
                        state.generation += 1;
                        (state.generation, state.take_requests())
                    })
                    .into_inner();
                for token in stale {
                    token.cancel();
                }

                match populate {
                    Some(populate) => self.send_populate(&connection, populate, generation, true),
                    None => self.open_subscriptions(&connection, generation),
                }
            },
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.read(|state| state.generation == generation)
    }

    fn send_populate(
        &self,
        connection: &Connection,
        populate: &PopulateInfo<T>,
        generation: u64,
        then_subscribe: bool,
    ) {
        let request = populate.request().clone().with_should_retry(false);
        let weak = self.weak_self.clone();
        let token = connection.send(request, move |result| {
            if let Some(inner) = weak.upgrade() {
                inner.did_populate(generation, then_subscribe, result);
            }
        });
        let previous = self
            .state
            .mutate(|state| state.populate_token.replace(token))
            .into_inner();
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn did_populate(&self, generation: u64, then_subscribe: bool, result: Result<JsonValue>) {
        if !self.is_current(generation) {
            return;
        }
        let incoming = match result {
            Ok(incoming) => incoming,
            Err(e) => {
                log::warn!("[hass-link] Cache populate failed: {}", e);
                return;
            },
        };
        let Source::Connection { populate: Some(populate), .. } = &self.source else {
            return;
        };

        let populate = populate.clone();
        let weak = self.weak_self.clone();
        self.work_queue.dispatch(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let outcome = inner
                .state
                .mutate(|state| {
                    if state.generation != generation {
                        return Outcome::Stale;
                    }
                    match populate.apply(incoming, state.current.as_ref()) {
                        Ok(value) => Outcome::Replaced(value.clone(), state.store(value)),
                        Err(e) => Outcome::Failed(e),
                    }
                })
                .into_inner();

            match outcome {
                Outcome::Replaced(value, subscribers) => inner.fan_out(subscribers, value),
                Outcome::Failed(e) => {
                    log::warn!("[hass-link] Cache populate decode failed: {}", e);
                    return;
                },
                Outcome::Stale | Outcome::Ignored | Outcome::Reissue => return,
            }
            if then_subscribe {
                let callback_queue = inner.callback_queue.clone();
                callback_queue.dispatch(move || {
                    if !inner.is_current(generation) {
                        return;
                    }
                    if let Some(connection) = inner.connection() {
                        inner.open_subscriptions(&connection, generation);
                    }
                });
            }
        });
    }

    fn connection(&self) -> Option<Connection> {
        match &self.source {
            Source::Connection { connection, .. } => {
                let connection = connection.upgrade();
                if connection.is_none() {
                    log::warn!("[hass-link] Cache outlived its connection");
                }
                connection
            },
            _ => None,
        }
    }

    fn open_subscriptions(&self, connection: &Connection, generation: u64) {
        let Source::Connection { subscribe, .. } = &self.source else {
            return;
        };

        let mut tokens = Vec::with_capacity(subscribe.len());
        for info in subscribe {
            // Set again whenever the server confirms a (re)subscription.
            let first_event = Arc::new(AtomicBool::new(true));
            let initiated_flag = first_event.clone();
            let weak = self.weak_self.clone();
            let info = info.clone();
            let request = info.request().clone().with_should_retry(false);

            tokens.push(connection.subscribe_with_initiated(
                request,
                move |result| {
                    if result.is_ok() {
                        initiated_flag.store(true, Ordering::SeqCst);
                    }
                },
                move |token, incoming| {
                    let Some(inner) = weak.upgrade() else {
                        token.cancel();
                        return;
                    };
                    if !inner.is_current(generation) {
                        token.cancel();
                        return;
                    }
                    let phase = if first_event.swap(false, Ordering::SeqCst) {
                        SubscriptionPhase::Initial
                    } else {
                        SubscriptionPhase::Iteration
                    };
                    inner.did_receive_event(generation, &info, incoming, phase);
                },
            ));
        }
        self.state.mutate(|state| state.request_tokens.extend(tokens));
    }

    fn did_receive_event(
        &self,
        generation: u64,
        info: &SubscribeInfo<T>,
        incoming: JsonValue,
        phase: SubscriptionPhase,
    ) {
        let info = info.clone();
        let weak = self.weak_self.clone();
        self.work_queue.dispatch(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let outcome = inner
                .state
                .mutate(|state| {
                    if state.generation != generation {
                        return Outcome::Stale;
                    }
                    match info.apply(incoming, state.current.as_ref(), phase) {
                        Ok(CacheResponse::Ignore) => Outcome::Ignored,
                        Ok(CacheResponse::Replace(value)) => {
                            Outcome::Replaced(value.clone(), state.store(value))
                        },
                        Ok(CacheResponse::ReissuePopulate) => Outcome::Reissue,
                        Err(e) => Outcome::Failed(e),
                    }
                })
                .into_inner();

            match outcome {
                Outcome::Replaced(value, subscribers) => inner.fan_out(subscribers, value),
                Outcome::Reissue => {
                    let callback_queue = inner.callback_queue.clone();
                    callback_queue.dispatch(move || {
                        if inner.is_current(generation) {
                            inner.reissue_populate(generation);
                        }
                    });
                },
                Outcome::Failed(e) => {
                    log::warn!("[hass-link] Dropping undecodable cache event: {}", e)
                },
                Outcome::Stale | Outcome::Ignored => {},
            }
        });
    }

    fn reissue_populate(&self, generation: u64) {
        let Source::Connection { populate: Some(populate), .. } = &self.source else {
            log::debug!("[hass-link] Cache has no populate request to reissue");
            return;
        };
        if let Some(connection) = self.connection() {
            self.send_populate(&connection, populate, generation, false);
        }
    }

    /// Store `value` and hand it to every subscriber.
    fn replace(&self, value: T) {
        let subscribers = self
            .state
            .mutate(|state| state.store(value.clone()))
            .into_inner();
        self.fan_out(subscribers, value);
    }

    fn fan_out(&self, subscribers: Vec<(u64, CacheHandler<T>)>, value: T) {
        let weak = self.weak_self.clone();
        self.callback_queue.dispatch(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            for (id, handler) in subscribers {
                handler(inner.handler_token(id), value.clone());
            }
        });
    }
}

impl<T> Drop for CacheInner<T> {
    fn drop(&mut self) {
        let tokens = self.state.mutate(CacheState::take_requests).into_inner();
        for token in tokens {
            token.cancel();
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Cache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.state.read(|state| {
            f.debug_struct("Cache")
                .field("current", &state.current)
                .field("subscribers", &state.subscribers.len())
                .field(
                    "requests",
                    &(state.request_tokens.len() + usize::from(state.populate_token.is_some())),
                )
                .finish()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_constant_delivers_immediately() {
        let cache = Cache::constant(42_u32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _token = cache.subscribe(move |_, value| sink.lock().unwrap().push(value));
        assert_eq!(*seen.lock().unwrap(), vec![42]);
        assert_eq!(cache.current(), Some(42));
    }

    #[test]
    fn test_once_delivers_a_single_value() {
        let cache = Cache::constant("hello".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let token = cache.once(move |value| {
            assert_eq!(value, "hello");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.inner.has_subscribers());
        token.cancel();
    }

    #[test]
    fn test_map_derives_from_source() {
        let cache = Cache::constant(20_u32);
        let doubled = cache.map(|value| value * 2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let token = doubled.subscribe(move |_, value| sink.lock().unwrap().push(value));

        assert_eq!(*seen.lock().unwrap(), vec![40]);
        assert_eq!(doubled.current(), Some(40));
        assert!(cache.inner.has_subscribers());

        // Derived caches reset once their last subscriber leaves.
        token.cancel();
        assert_eq!(doubled.current(), None);
        assert!(!cache.inner.has_subscribers());
    }

    #[test]
    fn test_mapped_cache_keeps_source_alive() {
        let doubled = Cache::constant(3_u32).map(|value| value * 2);
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let _token = doubled.subscribe(move |_, value| *sink.lock().unwrap() = Some(value));
        assert_eq!(*seen.lock().unwrap(), Some(6));
    }

    #[test]
    fn test_handler_token_unsubscribes() {
        let cache = Cache::constant(1_u8);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _token = cache.subscribe(move |token, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            token.cancel();
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.inner.has_subscribers());
    }
}
