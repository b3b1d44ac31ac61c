//! Wallet authentication: SIWE sign-in, JWT sessions, request middleware.

pub mod jwt;
pub mod middleware;
pub mod siwe;

pub use jwt::{Claims, JwtHandler};
pub use middleware::{auth_middleware, require_owner, AuthError};
