//! OpenBACH director.
//!
//! Runs scenario instances: every OpenBACH function is launched once its
//! wait conditions clear, job orders are dispatched to agents through an
//! [`connector::AgentConnector`], and the [`poller::StatusPoller`] keeps job
//! statuses current until the whole instance has ended.
//!
//! # Key Components
//!
//! * [`catalog`] - Scenario definitions and entity addresses loaded from disk
//! * [`store`] - In-memory record of instances, function attempts and jobs
//! * [`params`] - `$name` placeholder substitution
//! * [`executor`] - Scenario DAG loop and function executors
//! * [`director`] - Registry of running scenario instances
//! * [`server`] - Unix socket front end

pub mod catalog;
pub mod config;
pub mod connector;
pub mod director;
pub mod executor;
pub mod handlers;
pub mod params;
pub mod poller;
pub mod server;
pub mod store;
pub mod transfer;
