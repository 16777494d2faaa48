pub mod artifacts;
pub mod handlers;
pub mod jobs;
pub mod middleware;
pub mod routes;
pub mod sessions;
pub mod ws;

pub use routes::create_router;
pub use ws::{WsBroadcaster, WsMessage};
