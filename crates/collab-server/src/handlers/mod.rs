pub mod health;
pub mod ws;

pub use health::health_handler;
pub use ws::{ws_handler, WsQuery};
