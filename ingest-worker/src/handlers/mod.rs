mod app;
mod messages;

pub use app::{app, AppState};
