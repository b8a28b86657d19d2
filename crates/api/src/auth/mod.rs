//! Worker authentication

pub mod authenticator;
pub mod jwt;
pub mod middleware;
pub mod password;

pub use authenticator::{AuthError, Authenticator};
pub use jwt::{Claims, JwtError, JwtManager};
pub use middleware::{optional_worker, require_worker, AuthWorker};
pub use password::{hash_password, verify_password, PasswordError};
