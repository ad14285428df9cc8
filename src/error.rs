use std::fmt;

use thiserror::Error;

use crate::template::TemplateError;

pub type Result<T> = std::result::Result<T, Error>;

/// Why one provider was given up on during fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
}

impl ProviderFailure {
    pub fn new(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.provider, self.reason)
    }
}

/// Formats a list of attempts as `[a] reason; [b] reason`.
pub struct Attempts<'a>(pub &'a [ProviderFailure]);

impl fmt::Display for Attempts<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no providers were tried");
        }
        for (i, a) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{a}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown model {model:?} (known: {})", .known.join(", "))]
    UnknownModel { model: String, known: Vec<String> },

    #[error("unknown product {product:?} for model {model} (known: {})", .known.join(", "))]
    UnknownProduct {
        model: String,
        product: String,
        known: Vec<String>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no provider could supply the file: {}", Attempts(.attempts))]
    NoProviderAvailable { attempts: Vec<ProviderFailure> },

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("index unavailable at {url}: {reason}")]
    InventoryUnavailable { url: String, reason: String },

    #[error("no index entries matched search {0:?}")]
    NoMatchingMessages(String),

    #[error("fetch of {url} failed after {attempts} attempt(s): {reason}")]
    Fetch {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("retrieval cancelled")]
    Cancelled,

    #[error("cannot establish latest cycle for {0}")]
    CannotEstablishLatest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Short machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnknownModel { .. } => "unknown_model",
            Error::UnknownProduct { .. } => "unknown_product",
            Error::InvalidRequest(_) => "invalid_request",
            Error::NoProviderAvailable { .. } => "no_provider_available",
            Error::Template(_) => "template",
            Error::InventoryUnavailable { .. } => "inventory_unavailable",
            Error::NoMatchingMessages(_) => "no_matching_messages",
            Error::Fetch { .. } => "fetch",
            Error::Cancelled => "cancelled",
            Error::CannotEstablishLatest(_) => "cannot_establish_latest",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Url(_) => "url",
        }
    }

    /// Whether the pipeline may move on to the next provider after this error.
    pub(crate) fn is_provider_scoped(&self) -> bool {
        matches!(self, Error::Fetch { .. } | Error::InventoryUnavailable { .. })
    }
}
