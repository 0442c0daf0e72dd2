//! JSON-over-HTTP front end for the dispatcher core
//!
//! A thin translator: each route maps to one core operation and back. No
//! business logic lives here.

pub mod response;
pub mod routes;
pub mod server;
pub mod state;

pub use response::{ApiError, ApiResult};
pub use routes::create_router;
pub use server::run;
pub use state::AppState;
