pub mod audit;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod retry;
pub mod schema;
pub mod state;
pub mod utils;

pub use error::{AppError, AppResult};
pub use state::AppState;
pub use utils::DbPool;
