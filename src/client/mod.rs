//! Rate-limited asynchronous API client
//!
//! One [`ApiAsyncClient`] per connection owns the connection's rate budget,
//! worker pool, credentials and cancellation token. Collectors share it by
//! cloning the handle.

mod async_client;
pub mod auth;
pub mod rate_limit;
pub mod retry;
pub mod status;

pub use async_client::{ApiAsyncClient, ApiRequest, ApiResponse, ClientOptions, TaskGroup};
pub use auth::{Authenticator, BasicAuth, NoAuth, TokenRotation};
pub use rate_limit::{DynamicRateLimit, HeaderRateLimit, RateBudget, RateLimiter};
pub use retry::{RetryConfig, RetryDecision, RetryableError};
pub use status::StatusRegistry;
