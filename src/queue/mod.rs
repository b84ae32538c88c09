//! Rate-limited work queue feeding the worker pool

mod rate_limiter;
mod work_queue;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter, DEFAULT_BASE_DELAY, DEFAULT_BURST, DEFAULT_MAX_DELAY,
    DEFAULT_QPS,
};
pub use work_queue::WorkQueue;
