// NATS client over a WebSocket transport.
pub use auth::{AuthCredentials, Authenticator, StaticCredentials};
pub use config::{ConnectOptions, QueuePolicy};
pub use connection::Client;
pub use error::{Error, Result};
pub use events::{Event, Status};
pub use message::Message;
pub use subscriptions::Subscription;

mod auth;
mod config;
mod connection;
mod error;
mod events;
mod inbox;
mod message;
mod subscriptions;
