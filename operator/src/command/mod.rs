//! Command dispatch and timeout tracking for the operator
//!
//! This module handles:
//! - Issuing commands to the paired drone
//! - Resending unacknowledged commands with backoff
//! - Resolving commands on ack or after the retry budget is spent

mod dispatcher;
mod timeout;

pub use dispatcher::CommandDispatcher;
pub use timeout::TimeoutTracker;
