use thiserror::Error;

#[derive(Error, Debug)]
pub enum BotError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Fetch error: {message}")]
    Fetch { message: String },

    #[error("Capture error: {message}")]
    Capture { message: String },

    #[error("{message}")]
    Selection { message: String },

    #[error("Encoder error: {message}")]
    Encoder { message: String },

    #[error("Publish error: {message}")]
    Publish { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },
}

impl BotError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch { message: message.into() }
    }

    pub fn capture(message: impl Into<String>) -> Self {
        Self::Capture { message: message.into() }
    }

    pub fn selection(message: impl Into<String>) -> Self {
        Self::Selection { message: message.into() }
    }

    pub fn encoder(message: impl Into<String>) -> Self {
        Self::Encoder { message: message.into() }
    }

    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
