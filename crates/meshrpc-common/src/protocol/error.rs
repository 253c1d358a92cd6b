use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("no nodes available")]
    NoNodesAvailable,

    #[error("no workers available")]
    NoWorkersAvailable,

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, MeshError>;
