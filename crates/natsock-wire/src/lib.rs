// Wire format for the NATS text protocol: parsing and serialization.
pub use codec::{try_parse, ReadBuffer};
pub use headers::HeaderMap;
pub use info::{ConnectInfo, ServerInfo};
pub use op::{ClientOp, ServerOp};

mod codec;
mod headers;
mod info;
mod op;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid utf-8 in command line")]
    InvalidUtf8,
    #[error("unknown server command: {0}")]
    UnknownCommand(String),
    #[error("json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid header block: {0}")]
    Headers(String),
}
