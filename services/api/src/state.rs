//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the generation
//! services and the in-memory stores shared by all handlers.

use crate::prompts::Prompts;
use lessonforge_core::{
    attempt_log::MemoryAttemptSink,
    in_flight::GenerationLocks,
    lesson::LessonGenerator,
    model::{ModelClient, StaticModelSelector},
    pipeline::GenerationRepairPipeline,
};
use std::sync::Arc;
use std::time::Duration;

/// Finalized attempt logs kept for inspection.
const ATTEMPT_LOG_CAPACITY: usize = 1_000;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub generator: Arc<LessonGenerator>,
    pub attempts: Arc<MemoryAttemptSink>,
    pub locks: GenerationLocks,
    pub prompts: Arc<Prompts>,
}

impl AppState {
    /// Wires the repair pipeline around `model`. Without a `repair_model`
    /// the repack layer is disabled.
    pub fn new(
        model: Arc<dyn ModelClient>,
        repair_model: Option<String>,
        prompts: Prompts,
        stale_after: Duration,
    ) -> Self {
        let attempts = Arc::new(MemoryAttemptSink::new(ATTEMPT_LOG_CAPACITY));
        let pipeline = GenerationRepairPipeline::new(model, attempts.clone())
            .with_cheap_models(Arc::new(StaticModelSelector::new(repair_model)));

        Self {
            generator: Arc::new(LessonGenerator::new(Arc::new(pipeline))),
            attempts,
            locks: GenerationLocks::new(stale_after),
            prompts: Arc::new(prompts),
        }
    }
}
