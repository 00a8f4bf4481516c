//! Gateway server implementation

pub mod dispatch;
pub mod proxy;
pub mod response;
mod server;

pub use dispatch::{ACCESS_DENIED, AppState};
pub use proxy::{HttpForwarder, ProxyTransport};
pub use server::{Gateway, bind_listener, create_router};
