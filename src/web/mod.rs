mod handlers;
pub mod registry;
mod routes;
mod static_files;
mod ws;

pub use registry::{WsGuard, WsRegistry, CLOSE_GOING_AWAY};
pub use routes::create_router;
pub use static_files::StaticAssets;
pub use ws::ws_handler;
