//! Gantry server library.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod janitor;
pub mod metrics;
pub mod password;
pub mod pow;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
