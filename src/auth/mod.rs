/**
 * REQUIREMENT: Session authentication for multi-user collaboration
 * PURPOSE: Bearer-token verification, user resolution, and per-user rate limits
 */

pub mod models;
pub mod rate_limit;
pub mod services;

pub use models::*;
pub use rate_limit::RateLimiter;
pub use services::AuthService;
