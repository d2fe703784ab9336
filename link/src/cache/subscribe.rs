use crate::{
    error::{HassLinkError, Result},
    models::Request,
};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

/// Whether an event is the first one after (re)subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    /// First event after the subscription was (re)established, often a
    /// full snapshot.
    Initial,
    /// Any later event, often an incremental change.
    Iteration,
}

/// What a subscription event does to the cached value.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheResponse<T> {
    /// Keep the current value.
    Ignore,
    /// Replace the current value and notify subscribers.
    Replace(T),
    /// Discard the event and run the populate request again.
    ReissuePopulate,
}

type Transform<T> =
    Arc<dyn Fn(JsonValue, Option<&T>, SubscriptionPhase) -> Result<CacheResponse<T>> + Send + Sync>;
type AnyTransform<T> =
    Arc<dyn Fn(&dyn Any, Option<&T>, SubscriptionPhase) -> Result<CacheResponse<T>> + Send + Sync>;

/// A subscription that keeps a cache's value current.
pub struct SubscribeInfo<T> {
    request: Request,
    transform: Transform<T>,
    transform_any: AnyTransform<T>,
}

impl<T: 'static> SubscribeInfo<T> {
    pub fn new<U>(
        request: Request,
        transform: impl Fn(U, Option<&T>, SubscriptionPhase) -> CacheResponse<T>
            + Send
            + Sync
            + 'static,
    ) -> Self
    where
        U: DeserializeOwned + Clone + 'static,
    {
        let transform = Arc::new(transform);
        let typed = transform.clone();
        Self {
            request,
            transform: Arc::new(
                move |incoming: JsonValue, current: Option<&T>, phase: SubscriptionPhase| {
                    let decoded = serde_json::from_value::<U>(incoming)?;
                    Ok(typed(decoded, current, phase))
                },
            ),
            transform_any: Arc::new(
                move |incoming: &dyn Any, current: Option<&T>, phase: SubscriptionPhase| {
                    let decoded = incoming.downcast_ref::<U>().ok_or_else(|| {
                        HassLinkError::internal(format!(
                            "Subscribe transform expects {}",
                            type_name::<U>()
                        ))
                    })?;
                    Ok(transform(decoded.clone(), current, phase))
                },
            ),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn apply(
        &self,
        incoming: JsonValue,
        current: Option<&T>,
        phase: SubscriptionPhase,
    ) -> Result<CacheResponse<T>> {
        (self.transform)(incoming, current, phase)
    }

    #[doc(hidden)]
    pub fn transform_any(
        &self,
        incoming: &dyn Any,
        current: Option<&T>,
        phase: SubscriptionPhase,
    ) -> Result<CacheResponse<T>> {
        (self.transform_any)(incoming, current, phase)
    }
}

impl<T> Clone for SubscribeInfo<T> {
    fn clone(&self) -> Self {
        Self {
            request: self.request.clone(),
            transform: self.transform.clone(),
            transform_any: self.transform_any.clone(),
        }
    }
}

impl<T> fmt::Debug for SubscribeInfo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeInfo")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}
