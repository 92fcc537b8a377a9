use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdnsError {
    #[error("config error: {0}")]
    Config(String),

    #[error("capture error: {0}")]
    Capture(#[from] pcap::Error),

    #[error("packet parse error: {0}")]
    Parse(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PdnsError>;
