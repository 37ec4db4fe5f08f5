pub mod chat;
pub mod demo;
pub mod relay_server;

pub use chat::ChatOptions;
pub use relay_server::RelayServer;
