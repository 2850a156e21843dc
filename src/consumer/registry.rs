use std::collections::HashMap;
use std::fmt;

use crate::bus::Envelope;
use crate::error::{HandlerError, RegistryError};
use crate::event::IntegrationEvent;

/// Application code run for one event name, inside the consumer's unit of
/// work `T`.
pub trait Handler<T>: Send + Sync {
    fn handle(&self, tx: &mut T, envelope: &Envelope) -> Result<(), HandlerError>;
}

impl<T, F> Handler<T> for F
where
    F: Fn(&mut T, &Envelope) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, tx: &mut T, envelope: &Envelope) -> Result<(), HandlerError> {
        self(tx, envelope)
    }
}

/// Event name to handler map, resolved once at startup.
///
/// ```
/// use sourced_outbox::{Envelope, HandlerError, HandlerRegistry, MemoryTransaction};
///
/// let mut registry = HandlerRegistry::<MemoryTransaction>::new();
/// registry
///     .register("OrderCreated", |tx: &mut MemoryTransaction, envelope: &Envelope| -> Result<(), HandlerError> {
///         tx.put("seen", &envelope.id, &true)?;
///         Ok(())
///     })
///     .unwrap();
///
/// assert!(registry.validate(&["OrderCreated"]).is_ok());
/// assert!(registry.validate(&["OrderShipped"]).is_err());
/// ```
pub struct HandlerRegistry<T> {
    handlers: HashMap<String, Box<dyn Handler<T>>>,
}

impl<T> Default for HandlerRegistry<T> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<T> fmt::Debug for HandlerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl<T: 'static> HandlerRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for raw envelopes named `name`.
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> Result<(), RegistryError>
    where
        H: Handler<T> + 'static,
    {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::DuplicateHandler(name));
        }
        self.handlers.insert(name, Box::new(handler));
        Ok(())
    }

    /// Register a handler for a typed event, decoded with the codec named by
    /// the envelope's content type. A payload that does not decode fails the
    /// delivery like any other handler error.
    pub fn register_event<E, F>(&mut self, handler: F) -> Result<(), RegistryError>
    where
        E: IntegrationEvent + 'static,
        F: Fn(&mut T, E, &Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(E::NAME, move |tx: &mut T, envelope: &Envelope| {
            let event: E = envelope.decode()?;
            handler(tx, event, envelope)
        })
    }
}

impl<T> HandlerRegistry<T> {
    pub fn get(&self, name: &str) -> Option<&dyn Handler<T>> {
        self.handlers.get(name).map(|handler| handler.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Check that every expected event name has a handler.
    pub fn validate(&self, expected: &[&str]) -> Result<(), RegistryError> {
        let missing: Vec<String> = expected
            .iter()
            .filter(|name| !self.contains(name))
            .map(|name| name.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::MissingHandlers(missing))
        }
    }
}
