// HTTP surface: routing, auth, errors, cursors and the query handlers.

pub mod auth;
pub mod cursor;
pub mod error;
pub mod query;
pub mod routes;
pub mod server;
pub mod state;

pub use auth::AuthContext;
pub use cursor::{decode_cursor, encode_cursor};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use server::ApiServer;
pub use state::AppState;
