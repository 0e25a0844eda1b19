pub mod forwarder;
pub mod http;
pub mod pkce;
pub mod providers;
pub mod relay;
pub mod session;

pub use forwarder::ForwarderRegistry;
pub use session::SessionStore;
