//! Networking: NNTP protocol client, authenticated connection pool,
//! bandwidth limiting, health tracking and retry policy.
//!
//! Everything above this crate talks through [`ArticleTransport`]; the
//! pool is the only component that owns raw server connections.

pub mod error;
pub mod health;
pub mod limiter;
pub mod nntp;
pub mod pool;
pub mod retry;
pub mod transport;

pub use error::{NetError, Result};
pub use health::{HealthSnapshot, HealthTracker};
pub use limiter::{RateLimiter, TokenBucket};
pub use nntp::{NntpClient, ServerCapabilities, Timeouts};
pub use pool::{NntpPool, PoolConfig, RotationStrategy, ServerStats};
pub use retry::RetryPolicy;
pub use transport::{ArticleTransport, FetchedArticle, MemoryTransport, PostReceipt};
