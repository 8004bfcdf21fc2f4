// src/lib.rs
pub mod clock;
pub mod config;
pub mod email;
pub mod error;
pub mod excusals;
pub mod interfaces;
pub mod model;
pub mod notification_log;
pub mod notifier;
pub mod pipeline;
pub mod reconciler;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod roster;
pub mod sheets_client;
pub mod slack;
pub mod webwork_client;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod pipeline_tests;
