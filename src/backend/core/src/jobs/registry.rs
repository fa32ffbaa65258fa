//! Queue registry: the process-wide table of named queues.
//!
//! Built once at startup from an explicit list of job definitions and
//! immutable afterwards. Constructed before any dispatch or worker start and
//! passed by `Arc` to the dispatcher and the worker runtime; there is no
//! ambient global queue state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DispatchError, Result};
use crate::jobs::broker::Broker;
use crate::jobs::job::QueueJob;
use crate::jobs::observer::QueueEvents;

/// One registered queue: its name, definition, broker handle, and the event
/// observer attached at registration time.
#[derive(Clone)]
pub struct QueueHandle {
    /// Queue name (the definition's key)
    pub name: String,
    /// The job definition processed on this queue
    pub definition: Arc<dyn QueueJob>,
    /// Broker backing this queue
    pub broker: Arc<dyn Broker>,
    /// Lifecycle event hooks, set once
    pub events: Arc<QueueEvents>,
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Process-wide mapping of queue name to [`QueueHandle`].
pub struct QueueRegistry {
    queues: HashMap<String, QueueHandle>,
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("queues", &self.names())
            .finish()
    }
}

impl QueueRegistry {
    /// Build the registry from an explicit list of job definitions, attaching
    /// the stock logging observer to every queue.
    ///
    /// Registering the same key twice is an error.
    pub fn register(
        broker: Arc<dyn Broker>,
        definitions: Vec<Arc<dyn QueueJob>>,
    ) -> Result<Self> {
        Self::register_with(broker, definitions, |_| QueueEvents::logging())
    }

    /// Build the registry with a caller-supplied observer per queue.
    pub fn register_with(
        broker: Arc<dyn Broker>,
        definitions: Vec<Arc<dyn QueueJob>>,
        mut events: impl FnMut(&str) -> QueueEvents,
    ) -> Result<Self> {
        let mut queues = HashMap::with_capacity(definitions.len());
        for definition in definitions {
            let name = definition.key().to_string();
            if queues.contains_key(&name) {
                return Err(DispatchError::duplicate_queue(&name));
            }
            tracing::debug!(queue = %name, "Queue registered");
            let handle = QueueHandle {
                name: name.clone(),
                definition,
                broker: broker.clone(),
                events: Arc::new(events(&name)),
            };
            queues.insert(name, handle);
        }
        tracing::info!(queues = queues.len(), "Queue registry built");
        Ok(Self { queues })
    }

    /// Look up a queue by name.
    pub fn lookup(&self, name: &str) -> Option<&QueueHandle> {
        self.queues.get(name)
    }

    /// Look up a queue by name, failing with `QueueNotFound`.
    pub fn get(&self, name: &str) -> Result<&QueueHandle> {
        self.lookup(name)
            .ok_or_else(|| DispatchError::queue_not_found(name))
    }

    /// Iterate over all registered queues.
    pub fn handles(&self) -> impl Iterator<Item = &QueueHandle> {
        self.queues.values()
    }

    /// Registered queue names.
    pub fn names(&self) -> Vec<&str> {
        self.queues.keys().map(String::as_str).collect()
    }

    /// Number of registered queues.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
