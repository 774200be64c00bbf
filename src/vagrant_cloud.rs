//! Vagrant Cloud box registry client.
//!
//! Releasing a box is a fixed conversation: probe for the version, create it
//! only when the probe answers 404, register the provider with the box
//! checksum (or reuse it when already registered), then ask for a one-shot upload URL. The bytes themselves are
//! streamed from the build host, not through this process.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::service::{HTTP_CLIENT, ServiceFuture, base_url};

/// Default Vagrant Cloud API root.
pub const DEFAULT_API_URL: &str = "https://app.vagrantup.com/api/v1";

/// Answer to a version probe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VersionProbe {
    /// The registry answered 404.
    Missing,
    /// Any other status; the version is assumed to exist.
    Present(u16),
}

impl VersionProbe {
    /// Classifies an HTTP status.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        if status == 404 {
            Self::Missing
        } else {
            Self::Present(status)
        }
    }
}

/// Errors raised by the registry.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// A setting the registry needs is absent.
    #[error("missing {field}: set {env_var} or add {field} to alcib.toml")]
    NotConfigured {
        /// Configuration key.
        field: &'static str,
        /// Environment variable.
        env_var: &'static str,
    },
    /// The request could not be sent or its body read.
    #[error("box registry {operation} failed: {message}")]
    Http {
        /// Registry operation.
        operation: &'static str,
        /// Transport error.
        message: String,
    },
    /// The registry answered with an error status.
    #[error("box registry {operation} returned {status}: {body}")]
    Status {
        /// Registry operation.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// The upload URL response had no `upload_path`.
    #[error("box registry upload response has no upload_path")]
    MissingUploadPath,
}

/// Operations of the box registry used by the release stage.
pub trait BoxRegistry {
    /// Checks whether `version` exists.
    fn probe_version<'a>(&'a self, version: &'a str) -> ServiceFuture<'a, VersionProbe, RegistryError>;

    /// Creates `version` with `description`.
    fn create_version<'a>(
        &'a self,
        version: &'a str,
        description: &'a str,
    ) -> ServiceFuture<'a, (), RegistryError>;

    /// Registers `provider` under `version` with the box's sha-256. A
    /// provider that is already registered counts as success, so a version
    /// can be re-uploaded.
    fn create_provider<'a>(
        &'a self,
        version: &'a str,
        provider: &'a str,
        checksum: &'a str,
    ) -> ServiceFuture<'a, (), RegistryError>;

    /// Obtains the one-shot URL the box bytes are PUT to.
    fn upload_url<'a>(
        &'a self,
        version: &'a str,
        provider: &'a str,
    ) -> ServiceFuture<'a, String, RegistryError>;
}

/// [`BoxRegistry`] over the Vagrant Cloud REST API.
#[derive(Clone, Debug)]
pub struct VagrantCloudClient {
    base_url: String,
    box_name: Option<String>,
    token: Option<String>,
}

#[derive(Deserialize)]
struct UploadResponse {
    upload_path: Option<String>,
}

impl VagrantCloudClient {
    /// Creates a client rooted at `api_url` for `box_name` (`org/name`)
    /// authenticated by `token`.
    #[must_use]
    pub fn new(api_url: &str, box_name: Option<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url(api_url),
            box_name,
            token,
        }
    }

    fn box_url(&self) -> Result<String, RegistryError> {
        let box_name = self
            .box_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .ok_or(RegistryError::NotConfigured {
                field: "vagrant_box",
                env_var: "ALCIB_VAGRANT_BOX",
            })?;
        Ok(format!("{}/box/{box_name}", self.base_url))
    }

    fn token(&self) -> Result<&str, RegistryError> {
        self.token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or(RegistryError::NotConfigured {
                field: "vagrant_cloud_token",
                env_var: "ALCIB_VAGRANT_CLOUD_TOKEN",
            })
    }

    async fn send(
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RegistryError> {
        request.send().await.map_err(|err| RegistryError::Http {
            operation,
            message: err.to_string(),
        })
    }

    async fn expect_success(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, RegistryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RegistryError::Status {
            operation,
            status: status.as_u16(),
            body,
        })
    }
}

impl BoxRegistry for VagrantCloudClient {
    fn probe_version<'a>(&'a self, version: &'a str) -> ServiceFuture<'a, VersionProbe, RegistryError> {
        Box::pin(async move {
            let url = format!("{}/version/{version}", self.box_url()?);
            let response = Self::send(
                "probe version",
                HTTP_CLIENT.get(&url).bearer_auth(self.token()?),
            )
            .await?;
            let status = response.status();
            if status != StatusCode::NOT_FOUND && !status.is_success() {
                warn!(%url, status = status.as_u16(), "unexpected version probe status; assuming the version exists");
            }
            Ok(VersionProbe::from_status(status.as_u16()))
        })
    }

    fn create_version<'a>(
        &'a self,
        version: &'a str,
        description: &'a str,
    ) -> ServiceFuture<'a, (), RegistryError> {
        Box::pin(async move {
            let url = format!("{}/versions", self.box_url()?);
            info!(version, "creating box version");
            let response = Self::send(
                "create version",
                HTTP_CLIENT
                    .post(&url)
                    .bearer_auth(self.token()?)
                    .json(&json!({ "version": { "version": version, "description": description } })),
            )
            .await?;
            Self::expect_success("create version", response).await?;
            Ok(())
        })
    }

    fn create_provider<'a>(
        &'a self,
        version: &'a str,
        provider: &'a str,
        checksum: &'a str,
    ) -> ServiceFuture<'a, (), RegistryError> {
        Box::pin(async move {
            let url = format!("{}/version/{version}/providers", self.box_url()?);
            info!(version, provider, "registering box provider");
            let response = Self::send(
                "create provider",
                HTTP_CLIENT.post(&url).bearer_auth(self.token()?).json(&json!({
                    "provider": {
                        "name": provider,
                        "checksum_type": "sha256",
                        "checksum": checksum,
                    }
                })),
            )
            .await?;
            if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
                let body = response.text().await.unwrap_or_default();
                warn!(version, provider, %body, "box provider already registered; reusing it");
                return Ok(());
            }
            Self::expect_success("create provider", response).await?;
            Ok(())
        })
    }

    fn upload_url<'a>(
        &'a self,
        version: &'a str,
        provider: &'a str,
    ) -> ServiceFuture<'a, String, RegistryError> {
        Box::pin(async move {
            let url = format!(
                "{}/version/{version}/provider/{provider}/upload",
                self.box_url()?
            );
            let response = Self::send(
                "upload url",
                HTTP_CLIENT.get(&url).bearer_auth(self.token()?),
            )
            .await?;
            let body: UploadResponse = Self::expect_success("upload url", response)
                .await?
                .json()
                .await
                .map_err(|err| RegistryError::Http {
                    operation: "upload url",
                    message: err.to_string(),
                })?;
            body.upload_path
                .filter(|path| !path.is_empty())
                .ok_or(RegistryError::MissingUploadPath)
        })
    }
}
