//! Error types for the OTA upload hook.

use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("cannot read firmware {}: {source}", .path.display())]
    Firmware {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Network(#[from] reqwest::Error),

    /// The store answered, but not with 2xx.
    #[error("{status}\n{body}")]
    Http {
        status: reqwest::StatusCode,
        body:   String,
    },

    #[error("URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

impl OtaError {
    /// Render the error together with its `source()` chain.
    ///
    /// reqwest keeps the connect/DNS cause a few levels down, so the
    /// top-level message alone ("error sending request for url ...") hides
    /// what actually went wrong.
    pub fn diagnostic(&self) -> String {
        let mut out = self.to_string();
        let mut cause = self.source();
        while let Some(e) = cause {
            let msg = e.to_string();
            if !out.contains(&msg) {
                out.push_str(": ");
                out.push_str(&msg);
            }
            cause = e.source();
        }
        out
    }
}

pub type Result<T> = std::result::Result<T, OtaError>;
