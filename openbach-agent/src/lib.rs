//! OpenBACH agent job scheduler.
//!
//! Installs job descriptors, schedules job instances as OS processes and
//! answers the director's commands over TCP.

pub mod config;
pub mod handlers;
pub mod jobs;
pub mod server;
