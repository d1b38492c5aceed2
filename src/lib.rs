//! plugkit: build, test and release orchestration for sandboxed
//! design-tool plugins.
//!
//! Every pipeline is a [`dag::TaskGraph`] of [`task::Task`]s:
//!
//! - [`build`]: manifest validation, bundling and packaging
//! - [`session`]: room launch and remote assertions on top of the build graph
//! - [`release`]: git status, version bump, workflow sync and push
//!
//! [`bridge`] carries requests to a running plugin in either [`room::Room`].

pub mod bridge;
pub mod build;
pub mod config;
pub mod dag;
pub mod errors;
pub mod logging;
pub mod release;
pub mod room;
pub mod session;
pub mod task;
pub mod ui;
pub mod watch;
