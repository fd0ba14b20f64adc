//! griddispatch-core - dependency-aware batch dispatch onto a grid scheduler.
//!
//! Submits one scheduler job per batch of hierarchy nodes so that every
//! job holds on the jobs of its children. Two hierarchies are supported: an
//! octree-style decimal address space, discovered by probing the target
//! program, and a directory tree.
//!
//! # Modules
//!
//! - [`hierarchy`]: address parsing and probing, directory listing
//! - [`planner`]: depth grouping and batching
//! - [`ledger`]: parent links and hold sets
//! - [`throttle`]: admission control
//! - [`submit`]: scheduler command rendering and submission
//! - [`fanout`]: the per-batch worker that runs each member
//! - [`dispatch`]: drives the whole run and reports on it
//! - [`config`]: TOML configuration

pub mod config;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod hierarchy;
pub mod ledger;
pub mod planner;
pub mod submit;
pub mod throttle;

pub use config::DispatchConfig;
pub use dispatch::{DispatchReport, Dispatcher};
pub use error::DispatchError;
