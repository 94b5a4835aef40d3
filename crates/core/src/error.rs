use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Credentials not found: {0}")]
    CredentialNotFound(String),

    #[error("Could not find a suitable ssh-agent provider: {0}")]
    NoProvider(String),

    #[error("Agent bootstrap error: {0}")]
    Bootstrap(String),

    #[error("Failed to add identity: {0}")]
    Identity(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Agent channel error: {0}")]
    Channel(String),

    #[error("Scope store error: {0}")]
    Store(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Renders the error with its whole source chain, one cause per line.
    /// A cause already spelled out by the line above it is not repeated.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut last = out.clone();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            let message = cause.to_string();
            if !last.ends_with(&message) {
                out.push_str("\nCaused by: ");
                out.push_str(&message);
            }
            last = message;
            source = cause.source();
        }
        out
    }
}

pub type Result<T> = std::result::Result<T, Error>;
