//! LessonForge API Library Crate
//!
//! This library contains the HTTP layer of the LessonForge service: the
//! application state, prompt loading, API handlers, and routing. The `api`
//! binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod prompts;
pub mod router;
pub mod state;
