//! In-process backend for tests and local development
pub mod broker;

pub use broker::{DeliveryRecord, InMemoryBroker};
