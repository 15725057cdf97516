//! Error types shared across the bot host.

/// Error from a connector operation.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("not connected")]
    NotConnected,

    #[error("{0} does not support this send kind")]
    Unsupported(&'static str),

    #[error("backend rejected the request: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Error from the config store. Reads never fail; only open, migrate and
/// durable writes can.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("unsupported schema version {0}")]
    SchemaVersion(i64),
}

/// Error from kernel operations.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("web server error: {0}")]
    Web(#[from] std::io::Error),
}
