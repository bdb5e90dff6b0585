//! # Lifehub Common Library
//!
//! Shared code for lifehub services including:
//! - Error types
//! - Entity references and job correlation hints
//! - Background job model (Job, JobStatus, JobFilter)
//! - Event types (LifehubEvent enum) and EventBus
//! - Configuration loading

pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod job;

pub use entity::{CorrelationHint, EntityRef};
pub use error::{Error, Result};
pub use job::{Job, JobFilter, JobStatus};
