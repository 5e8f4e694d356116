//! HTTP middleware: security headers, authentication, rate limiting

pub mod auth;
pub mod rate_limit;
pub mod security_headers;

pub use auth::{auth_middleware, AuthContext};
pub use rate_limit::rate_limit_middleware;
pub use security_headers::apply_security_headers;
