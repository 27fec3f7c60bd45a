use crate::relay::RelayState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to connect to proxy {address}: {source}")]
    ProxyConnectFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy response header longer than 1024 bytes")]
    HeaderTooLong,

    #[error("Malformed proxy response: {0}")]
    MalformedResponse(String),

    #[error("Proxy rejected CONNECT with status {0}")]
    ProxyRejected(u16),

    #[error("Relay failed in state {state:?}: {source}")]
    Relay {
        state: RelayState,
        #[source]
        source: Box<ProxyError>,
    },

    #[error("Failed to bind listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(std::io::Error),

    #[error("HTTP parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
