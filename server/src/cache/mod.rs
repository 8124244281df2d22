pub mod auth;
pub mod presence;

pub use auth::{AuthorizationCache, AuthorizeError};
pub use presence::PresenceCache;
