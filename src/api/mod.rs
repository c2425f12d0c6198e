pub mod handler;
pub mod models;
pub mod reconciliation;
pub mod settlements;

pub use handler::AppState;
