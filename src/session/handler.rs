//! Caller-supplied handlers and the lanes that run them.
//!
//! Handlers never run on the engine loop. Each subscription listener gets a
//! sequential lane (one task, one queue), so events for that listener are
//! handled in arrival order. Each registration gets a lane that admits
//! invocations in arrival order and runs up to `concurrency` of them at once.
//! Invocation outcomes return to the engine through a [`YieldSink`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};

use crate::error::WampError;
use crate::protocol::{reasons, Dict, Id, Payload};

/// An event delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Subscription id
    pub subscription: Id,
    /// Publication id
    pub publication: Id,
    /// Topic the event was published to
    pub topic: String,
    /// Event details
    pub details: Dict,
    /// Event payload
    pub payload: Payload,
}

/// A call routed to a registered procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Registration id
    pub registration: Id,
    /// Invocation request id (router-assigned)
    pub request: Id,
    /// Registered procedure
    pub procedure: String,
    /// Invocation details
    pub details: Dict,
    /// Call arguments
    pub payload: Payload,
}

/// Error returned by an invocation handler; sent to the caller as ERROR.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationError {
    /// Error URI
    pub error: String,
    /// Error arguments
    pub payload: Payload,
}

impl InvocationError {
    /// Error with a URI and no arguments
    pub fn new(error: &str) -> Self {
        Self {
            error: error.to_string(),
            payload: Payload::new(),
        }
    }

    /// Attach error arguments
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// `wamp.error.runtime_error` carrying `message`
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(reasons::RUNTIME_ERROR)
            .with_payload(Payload::with_args([Value::String(message.into())]))
    }
}

impl From<anyhow::Error> for InvocationError {
    fn from(err: anyhow::Error) -> Self {
        Self::runtime(err.to_string())
    }
}

impl From<WampError> for InvocationError {
    fn from(err: WampError) -> Self {
        match err {
            WampError::OperationFailed { error, payload, .. } => Self { error, payload },
            other => Self::runtime(other.to_string()),
        }
    }
}

/// Result of one invocation
pub type InvocationOutcome = Result<Payload, InvocationError>;

/// Event handler: async function of an [`Event`]
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Invocation handler: async function of an [`Invocation`]
pub type InvocationHandler =
    Arc<dyn Fn(Invocation) -> BoxFuture<'static, InvocationOutcome> + Send + Sync>;

/// Where invocation outcomes go: `(invocation request id, outcome)`
pub(crate) type YieldSink = Arc<dyn Fn(Id, InvocationOutcome) + Send + Sync>;

/// Box an async closure as an [`EventHandler`]
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

/// Box an async closure as an [`InvocationHandler`]
pub fn invocation_handler<F, Fut>(f: F) -> InvocationHandler
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = InvocationOutcome> + Send + 'static,
{
    Arc::new(move |invocation| f(invocation).boxed())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Sequential delivery lane for one subscription listener.
///
/// Dropping the lane lets queued events drain, then the task ends.
#[derive(Debug)]
pub(crate) struct EventLane {
    queue: mpsc::UnboundedSender<Event>,
}

impl EventLane {
    pub(crate) fn spawn(topic: &str, handler: EventHandler) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Event>();
        let topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let publication = event.publication;
                let handler = Arc::clone(&handler);
                let run = AssertUnwindSafe(async move { handler(event).await });
                match run.catch_unwind().await {
                    Ok(Ok(())) => {},
                    Ok(Err(e)) => {
                        let fault = WampError::HandlerFault(e.to_string());
                        tracing::warn!(
                            "Event handler for '{}' failed on publication {}: {}",
                            topic,
                            publication,
                            fault
                        );
                    },
                    Err(panic) => {
                        tracing::error!(
                            "Event handler for '{}' panicked on publication {}: {}",
                            topic,
                            publication,
                            panic_message(panic.as_ref())
                        );
                    },
                }
            }
        });
        Self { queue }
    }

    /// Queue an event; false if the lane has stopped
    pub(crate) fn deliver(&self, event: Event) -> bool {
        self.queue.send(event).is_ok()
    }
}

/// Delivery lane for one registration.
#[derive(Debug)]
pub(crate) struct InvocationLane {
    queue: mpsc::UnboundedSender<Invocation>,
}

impl InvocationLane {
    pub(crate) fn spawn(handler: InvocationHandler, concurrency: usize, sink: YieldSink) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Invocation>();
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        tokio::spawn(async move {
            while let Some(invocation) = rx.recv().await {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let handler = Arc::clone(&handler);
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    let request = invocation.request;
                    let procedure = invocation.procedure.clone();
                    let run = AssertUnwindSafe(async move { handler(invocation).await });
                    let outcome = match run.catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(panic) => {
                            let message = panic_message(panic.as_ref());
                            tracing::error!(
                                "Invocation handler for '{}' panicked on request {}: {}",
                                procedure,
                                request,
                                message
                            );
                            Err(InvocationError::runtime(message))
                        },
                    };
                    if let Err(e) = &outcome {
                        tracing::debug!("Invocation {} of '{}' failed: {}", request, procedure, e.error);
                    }
                    sink(request, outcome);
                    drop(permit);
                });
            }
        });
        Self { queue }
    }

    /// Queue an invocation; false if the lane has stopped
    pub(crate) fn deliver(&self, invocation: Invocation) -> bool {
        self.queue.send(invocation).is_ok()
    }
}
