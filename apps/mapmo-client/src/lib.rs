pub mod api;
pub mod client;
pub mod config;
pub mod connection;
pub mod countdown;
pub mod dispatch;
pub mod echo;
pub mod error;
pub mod outbound;
pub mod render;
pub mod session;
pub mod telemetry;
pub mod timer;
pub mod transport;
pub mod typing;
pub mod ui;

pub use client::{ChatClient, ClientHandle, Command};
pub use config::ClientConfig;
pub use error::{ClientError, ErrorKind};
pub use session::Session;
pub use ui::{UiSink, UiUpdate};
