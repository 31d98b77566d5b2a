//! Back-pressured async channels for coordinating producers and consumers
//! across concurrent tasks.
//!
//! Three channel variants are provided:
//!
//! - [`rendezvous`]: no buffer; every send awaits a matching receive.
//! - [`buffered`]: a bounded buffer; sends beyond capacity suspend.
//! - [`mpsc`]: multi-producer, single-consumer, with pluggable back-pressure
//!   strategies (high/low watermark or unbounded), a non-suspending send
//!   path driven by callback tokens, and termination callbacks.
//!
//! Each variant has a fallible form whose termination may carry a failure
//! value, delivered to exactly one consumer receive.

pub mod buffered;
pub mod error;
pub mod mpsc;
pub mod rendezvous;

pub use error::{ProduceError, SendError};
pub use mpsc::{BackpressureStrategy, CallbackToken, SendResult};
