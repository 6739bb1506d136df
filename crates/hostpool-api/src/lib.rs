pub mod app;
pub mod error;
pub mod handlers;
pub mod peer;
pub mod session;
pub mod state;

pub use app::build_app;
pub use session::SessionLayer;
pub use state::AppState;
