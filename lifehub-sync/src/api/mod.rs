//! HTTP API route modules

pub mod health;
pub mod jobs;
pub mod merge;
pub mod sse;
pub mod watch;

pub use health::health_routes;
pub use jobs::job_routes;
pub use merge::merge_routes;
pub use sse::{event_stream, watch_event_stream};
pub use watch::watch_routes;
