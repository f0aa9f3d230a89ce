use thiserror::Error;

/// Gateway error taxonomy. Recoverable variants are translated to LDAP
/// result codes at the dispatcher boundary; transport errors terminate the
/// connection after a best-effort error response.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed BER, unknown operation or unsupported filter shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Bad Exchange credentials on bind.
    #[error("authentication failed")]
    AuthFailed,

    /// HTTP or WebDAV failure on the Exchange back-channel.
    #[error("{status} {message}")]
    Backend { status: u16, message: String },

    #[error("maximum redirections reached")]
    TooManyRedirects,

    #[error("I/O error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GatewayError {
    pub fn protocol(message: impl Into<String>) -> Self {
        GatewayError::Protocol(message.into())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
