use std::sync::Mutex;

use event_emitter_rs::EventEmitter;

use super::{Envelope, PublishError, Publisher};

/// A publisher that emits envelopes via an `EventEmitter` for in-process
/// subscribers.
///
/// Listeners receive the payload as a string (lossy UTF-8) and run on the
/// emitter's own threads.
pub struct EmitterPublisher {
    emitter: Mutex<EventEmitter>,
}

impl Default for EmitterPublisher {
    fn default() -> Self {
        Self::new(EventEmitter::new())
    }
}

impl EmitterPublisher {
    pub fn new(emitter: EventEmitter) -> Self {
        EmitterPublisher {
            emitter: Mutex::new(emitter),
        }
    }

    /// Register a listener for an event name.
    pub fn on<F>(&self, name: &str, listener: F) -> Result<(), PublishError>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.emitter
            .lock()
            .map_err(|_| PublishError::ConnectionFailed("emitter lock poisoned".into()))?
            .on(name, listener);
        Ok(())
    }
}

impl Publisher for EmitterPublisher {
    fn publish(&self, envelope: Envelope) -> Result<(), PublishError> {
        let payload = String::from_utf8_lossy(&envelope.content).into_owned();
        self.emitter
            .lock()
            .map_err(|_| PublishError::ConnectionFailed("emitter lock poisoned".into()))?
            .emit(&envelope.name, payload);
        Ok(())
    }
}
