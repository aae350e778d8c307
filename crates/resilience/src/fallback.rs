//! Degraded results when an operation fails.

use tracing::debug;

use forgeflow_core::{Classified, ErrorClass};

type Filter<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

/// Substitutes the result of a fallback operation for a failed one.
///
/// Without a filter every error triggers the fallback. With one, errors the
/// filter rejects are returned unchanged. Only the fallback's own failure
/// escapes when it runs.
pub struct Fallback<E> {
    filter: Option<Filter<E>>,
}

impl<E> Default for Fallback<E> {
    fn default() -> Self {
        Self { filter: None }
    }
}

impl<E> core::fmt::Debug for Fallback<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fallback")
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl<E> Fallback<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only fall back for errors matching `filter`.
    pub fn when<P>(mut self, filter: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Run `op`; on a matching error run `fallback` with that error instead.
    pub fn run<T, F, G>(&self, op: F, fallback: G) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        G: FnOnce(&E) -> Result<T, E>,
    {
        match op() {
            Ok(value) => Ok(value),
            Err(err) => {
                let applies = self.filter.as_ref().is_none_or(|filter| filter(&err));
                if !applies {
                    return Err(err);
                }
                debug!("operation failed, using fallback");
                fallback(&err)
            }
        }
    }
}

impl<E: Classified> Fallback<E> {
    /// Only fall back for errors of the given class.
    pub fn for_class(class: ErrorClass) -> Self {
        Self::new().when(move |e: &E| e.class() == class)
    }
}
