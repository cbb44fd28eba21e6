//! # Protocol Layer
//!
//! Delivery of decoded inbound packets to application handlers.
//!
//! ## Components
//! - **Dispatcher**: copy-on-write subscriber list with panic isolation

pub mod dispatcher;

pub use dispatcher::{Dispatcher, SubscriptionId};
