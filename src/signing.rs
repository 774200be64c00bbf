//! Detached signatures for release checksum manifests.

use thiserror::Error;
use tracing::info;

use crate::service::{HTTP_CLIENT, ServiceFuture, base_url};

/// Errors raised by the signing service.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SigningError {
    /// A setting the signer needs is absent.
    #[error("missing {field}: set {env_var} or add {field} to alcib.toml")]
    NotConfigured {
        /// Configuration key.
        field: &'static str,
        /// Environment variable.
        env_var: &'static str,
    },
    /// The request could not be sent or its body read.
    #[error("signing request failed: {0}")]
    Http(String),
    /// The service answered with an error status.
    #[error("signing service returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// The service returned an empty signature.
    #[error("signing service returned an empty signature")]
    EmptySignature,
}

/// Produces a detached signature for a manifest.
pub trait ManifestSigner {
    /// Signs `manifest` and returns the armored signature.
    fn sign<'a>(&'a self, manifest: &'a str) -> ServiceFuture<'a, String, SigningError>;
}

/// [`ManifestSigner`] backed by the signing REST service.
#[derive(Clone, Debug)]
pub struct SigningClient {
    url: Option<String>,
    token: Option<String>,
}

impl SigningClient {
    /// Creates a client posting to `url` with bearer `token`.
    #[must_use]
    pub fn new(url: Option<&str>, token: Option<String>) -> Self {
        Self {
            url: url.map(base_url),
            token,
        }
    }
}

impl ManifestSigner for SigningClient {
    fn sign<'a>(&'a self, manifest: &'a str) -> ServiceFuture<'a, String, SigningError> {
        Box::pin(async move {
            let url = self
                .url
                .as_deref()
                .filter(|url| !url.is_empty())
                .ok_or(SigningError::NotConfigured {
                    field: "signing_url",
                    env_var: "ALCIB_SIGNING_URL",
                })?;
            let token = self
                .token
                .as_deref()
                .filter(|token| !token.trim().is_empty())
                .ok_or(SigningError::NotConfigured {
                    field: "signing_token",
                    env_var: "ALCIB_SIGNING_TOKEN",
                })?;

            info!(bytes = manifest.len(), "requesting manifest signature");
            let response = HTTP_CLIENT
                .post(url)
                .bearer_auth(token)
                .header(reqwest::header::CONTENT_TYPE, "text/plain")
                .body(manifest.to_owned())
                .send()
                .await
                .map_err(|err| SigningError::Http(err.to_string()))?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|err| SigningError::Http(err.to_string()))?;
            if !status.is_success() {
                return Err(SigningError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            if body.trim().is_empty() {
                return Err(SigningError::EmptySignature);
            }
            Ok(body)
        })
    }
}
