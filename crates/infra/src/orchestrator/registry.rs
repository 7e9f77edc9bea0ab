use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;

use saksflyt_events::{EventName, StepId};

use crate::steps::StepHandler;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("step `{0}` is already registered")]
    DuplicateStep(StepId),

    /// Failure envelopes and unknown names are handled by the dispatcher itself.
    #[error("step `{step}` cannot consume `{event}`")]
    Unroutable { step: StepId, event: EventName },
}

/// Step handlers by consumed event name and by step id.
///
/// Built once at startup; the dispatcher only reads it.
#[derive(Default)]
pub struct StepRegistry {
    by_event: HashMap<EventName, Vec<Arc<dyn StepHandler>>>,
    by_id: BTreeMap<StepId, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn StepHandler>) -> Result<(), RegistryError> {
        let step = handler.step_id();
        let event = handler.event_name();

        if matches!(event, EventName::StepFailed | EventName::Unknown(_)) {
            return Err(RegistryError::Unroutable { step, event });
        }
        if self.by_id.contains_key(&step) {
            return Err(RegistryError::DuplicateStep(step));
        }

        self.by_event.entry(event).or_default().push(handler.clone());
        self.by_id.insert(step, handler);
        Ok(())
    }

    pub fn register_all(
        &mut self,
        handlers: impl IntoIterator<Item = Arc<dyn StepHandler>>,
    ) -> Result<(), RegistryError> {
        handlers.into_iter().try_for_each(|h| self.register(h))
    }

    /// Handlers consuming `event`, in registration order.
    pub fn handlers_for(&self, event: &EventName) -> &[Arc<dyn StepHandler>] {
        self.by_event.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn step(&self, step: &StepId) -> Option<&Arc<dyn StepHandler>> {
        self.by_id.get(step)
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &StepId> {
        self.by_id.keys()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.by_id.keys().collect::<Vec<_>>())
            .finish()
    }
}
