// Retransmission module

pub mod queue;

pub use queue::{RetryPolicy, RetryQueue};
