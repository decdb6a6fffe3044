//! LessonForge Core
//!
//! Turns untrusted, schema-targeted model output into validated structured
//! lesson content, and author-supplied mathematical expressions into safely
//! evaluable functions. Everything here is provider-agnostic: the model is
//! reached through the `ModelClient` trait and attempt logs leave through the
//! `AttemptSink` trait.

pub mod attempt_log;
pub mod coercion;
pub mod content;
pub mod expression;
pub mod in_flight;
pub mod lesson;
pub mod model;
pub mod pipeline;
pub mod schema;
pub mod visualization;
