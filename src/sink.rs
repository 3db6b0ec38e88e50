//! Downstream seams: where merged events leave the codec.

use std::sync::Arc;

use bytes::Bytes;

use crate::event::MergedEvent;

/// Receiver for merged events.
///
/// Delivery is allowed to block (downstream backpressure) and allowed to
/// fail; a failed delivery leaves the assembler's pending buffer intact so
/// the record can be retried on a later flush.
pub trait EventSink: Send + Sync {
    /// Hands one merged event downstream.
    fn deliver(&self, event: MergedEvent) -> crate::Result<()>;
}

impl<F> EventSink for F
where
    F: Fn(MergedEvent) -> crate::Result<()> + Send + Sync,
{
    fn deliver(&self, event: MergedEvent) -> crate::Result<()> {
        (self)(event)
    }
}

/// Upstream party in the `accept` fan-in: carries the bytes to decode, the
/// provenance path, and the place merged events should land.
pub trait Listener: Send + Sync {
    /// The chunk of raw bytes this listener wants decoded.
    fn data(&self) -> Bytes;
    /// Provenance of the data, e.g. a file path or connection key.
    fn path(&self) -> &str;
    /// Receives a merged event attributed to this listener.
    fn process_event(&self, event: MergedEvent) -> crate::Result<()>;
}

/// Value-level emission target: a sink plus the provenance to stamp on
/// events delivered through it.
///
/// Contexts are passed per call and stored by value, so the assembler never
/// holds a reference to a live upstream object. For `what = previous`, the
/// record completed by a new line is emitted against the context that
/// accompanied the *prior* line; the assembler keeps the last two contexts
/// it has seen to get that attribution right.
#[derive(Clone)]
pub struct EmissionContext {
    path: Option<String>,
    sink: Arc<dyn EventSink>,
}

impl EmissionContext {
    /// Creates a context delivering to `sink` with no provenance path.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { path: None, sink }
    }

    /// Creates a context from a plain closure sink.
    pub fn from_fn<F>(sink: F) -> Self
    where
        F: Fn(MergedEvent) -> crate::Result<()> + Send + Sync + 'static,
    {
        Self::new(Arc::new(sink))
    }

    /// Sets the provenance path stamped on delivered events.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Adapts a listener into a context: events are stamped with the
    /// listener's path and handed to its `process_event`.
    pub fn for_listener(listener: Arc<dyn Listener>) -> Self {
        let path = listener.path().to_string();
        Self {
            path: Some(path),
            sink: Arc::new(ListenerSink(listener)),
        }
    }

    /// The provenance path carried by this context.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub(crate) fn deliver(&self, mut event: MergedEvent) -> crate::Result<()> {
        if event.path.is_none() {
            event.path = self.path.clone();
        }
        self.sink.deliver(event)
    }
}

impl std::fmt::Debug for EmissionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmissionContext")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

struct ListenerSink(Arc<dyn Listener>);

impl EventSink for ListenerSink {
    fn deliver(&self, event: MergedEvent) -> crate::Result<()> {
        self.0.process_event(event)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn context_stamps_path_on_delivery() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&seen);
        let ctx = EmissionContext::from_fn(move |event: MergedEvent| {
            inner.lock().unwrap().push(event);
            Ok(())
        })
        .with_path("en.log");

        ctx.deliver(MergedEvent::new("hello")).unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(events[0].path.as_deref(), Some("en.log"));
    }

    #[test]
    fn context_keeps_preexisting_path() {
        let ctx = EmissionContext::from_fn(|event: MergedEvent| {
            assert_eq!(event.path.as_deref(), Some("already-set"));
            Ok(())
        })
        .with_path("ignored");

        let mut event = MergedEvent::new("hello");
        event.path = Some("already-set".to_string());
        ctx.deliver(event).unwrap();
    }
}
