use crate::{
    error::{HassLinkError, Result},
    models::Request,
};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

type Transform<T> = Arc<dyn Fn(JsonValue, Option<&T>) -> Result<T> + Send + Sync>;
type AnyTransform<T> = Arc<dyn Fn(&dyn Any, Option<&T>) -> Result<T> + Send + Sync>;

/// The one-shot request that establishes (or refreshes) a cache's value.
///
/// The response is decoded into `U` and combined with the previous value,
/// if any, to produce the new one.
pub struct PopulateInfo<T> {
    request: Request,
    transform: Transform<T>,
    transform_any: AnyTransform<T>,
}

impl<T: 'static> PopulateInfo<T> {
    pub fn new<U>(
        request: Request,
        transform: impl Fn(U, Option<&T>) -> T + Send + Sync + 'static,
    ) -> Self
    where
        U: DeserializeOwned + Clone + 'static,
    {
        let transform = Arc::new(transform);
        let typed = transform.clone();
        Self {
            request,
            transform: Arc::new(move |incoming: JsonValue, current: Option<&T>| {
                let decoded = serde_json::from_value::<U>(incoming)?;
                Ok(typed(decoded, current))
            }),
            transform_any: Arc::new(move |incoming: &dyn Any, current: Option<&T>| {
                let decoded = incoming.downcast_ref::<U>().ok_or_else(|| {
                    HassLinkError::internal(format!(
                        "Populate transform expects {}",
                        type_name::<U>()
                    ))
                })?;
                Ok(transform(decoded.clone(), current))
            }),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Decode `incoming` and compute the next value.
    pub(crate) fn apply(&self, incoming: JsonValue, current: Option<&T>) -> Result<T> {
        (self.transform)(incoming, current)
    }

    /// Run the transform on an already-decoded value, failing if its type is
    /// not the one the transform was declared with.
    #[doc(hidden)]
    pub fn transform_any(&self, incoming: &dyn Any, current: Option<&T>) -> Result<T> {
        (self.transform_any)(incoming, current)
    }
}

impl<T> Clone for PopulateInfo<T> {
    fn clone(&self) -> Self {
        Self {
            request: self.request.clone(),
            transform: self.transform.clone(),
            transform_any: self.transform_any.clone(),
        }
    }
}

impl<T> fmt::Debug for PopulateInfo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PopulateInfo")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}
