//! INN login and session lifecycle.

mod limiter;
mod session;
mod state;

pub use limiter::LoginLimiter;
pub use session::SessionStore;
pub use state::{AuthAction, AuthPhase, AuthState};
