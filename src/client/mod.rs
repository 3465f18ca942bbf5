//! Client side: channels, response streams and the retry executor.

mod channel;
pub mod retry;
mod stream;

pub use channel::Channel;
pub use retry::{Outcome, RetryAttempt, RetryPolicy};
pub use stream::ResponseStream;
