//! Bucket storage for build artifacts.
//!
//! Uploads run on the build host: files are checksummed there with
//! `sha256sum` and copied with the checksum attached as object metadata.
//! Downloads run locally through the `aws` CLI with bounded retry.

use std::ffi::OsString;
use std::fmt;

use camino::Utf8Path;
use shell_escape::unix::escape;
use tracing::{info, warn};

use crate::retry::{RetryPolicy, retry};
use crate::session::{CommandRunner, RemoteCommand, RemoteSession};
use crate::target::{Architecture, BackendKind, ImageKind};

mod error;

pub use error::ArtifactError;

/// Bucket CLI on build hosts.
const REMOTE_AWS: &str = "aws";

/// Key prefix shared by every artifact of one build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactKey {
    /// CI build number.
    pub build_number: String,
    /// Image kind built.
    pub image: ImageKind,
    /// Backend built on.
    pub backend: BackendKind,
    /// Architecture built.
    pub arch: Architecture,
    /// Run date, `YYYYMMDD`.
    pub date: String,
}

impl ArtifactKey {
    /// Full object key of `file_name` under this prefix.
    #[must_use]
    pub fn object(&self, file_name: &str) -> String {
        format!("{self}/{file_name}")
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}-{}",
            self.build_number,
            self.image.slug(),
            self.backend,
            self.arch,
            self.date
        )
    }
}

/// One file copied to the bucket.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactDescriptor {
    /// Path on the build host.
    pub remote_path: String,
    /// Object key in the bucket.
    pub destination_key: String,
    /// Hex sha-256 computed on the build host.
    pub checksum: String,
}

/// What an upload batch did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UploadSummary {
    /// Files copied.
    pub uploaded: Vec<ArtifactDescriptor>,
    /// Patterns that matched nothing.
    pub skipped: Vec<String>,
}

/// Uploads to and downloads from one bucket.
#[derive(Clone, Debug)]
pub struct ArtifactStore<R: CommandRunner> {
    bucket: String,
    aws_bin: String,
    runner: R,
    retry: RetryPolicy,
}

impl<R: CommandRunner> ArtifactStore<R> {
    /// Creates a store for `bucket` using the local `aws_bin` for downloads.
    pub fn new(bucket: impl Into<String>, aws_bin: impl Into<String>, runner: R, retry: RetryPolicy) -> Self {
        Self {
            bucket: bucket.into(),
            aws_bin: aws_bin.into(),
            runner,
            retry,
        }
    }

    /// The bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Checksums and copies every file matching `patterns` (relative to
    /// `working_dir` on the session's host) under `key`.
    ///
    /// A pattern matching nothing is skipped with a warning; the rest of the
    /// batch continues.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Session`] when a copy fails or the session is
    /// unusable.
    pub fn upload<S: CommandRunner>(
        &self,
        session: &RemoteSession<S>,
        working_dir: &str,
        patterns: &[String],
        key: &ArtifactKey,
    ) -> Result<UploadSummary, ArtifactError> {
        let dir = escape(working_dir.into());
        let mut summary = UploadSummary::default();

        for pattern in patterns {
            let listing = session.execute(&RemoteCommand::posix(format!(
                "cd {dir} && sha256sum {pattern}"
            )))?;
            let checksums = parse_checksums(&listing.stdout);
            if !listing.is_success() || checksums.is_empty() {
                warn!(pattern = %pattern, dir = %working_dir, "no files match; skipping upload");
                summary.skipped.push(pattern.clone());
                continue;
            }

            for (checksum, relative) in checksums {
                let remote_path = format!("{working_dir}/{relative}");
                let file_name = relative.rsplit('/').next().unwrap_or(relative);
                let destination_key = key.object(file_name);
                session.execute_checked(&RemoteCommand::posix(format!(
                    "{REMOTE_AWS} s3 cp {} s3://{}/{}/ --metadata sha256={checksum}",
                    escape(remote_path.as_str().into()),
                    escape(self.bucket.as_str().into()),
                    escape(key.to_string().into()),
                )))?;
                info!(file = %remote_path, key = %destination_key, "uploaded artifact");
                summary.uploaded.push(ArtifactDescriptor {
                    remote_path,
                    destination_key,
                    checksum: checksum.to_owned(),
                });
            }
        }

        Ok(summary)
    }

    /// Names of the objects directly under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::List`] when the bucket CLI fails.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError> {
        let args = [
            OsString::from("s3"),
            OsString::from("ls"),
            OsString::from(format!("s3://{}/{prefix}/", self.bucket)),
        ];
        let output = self.runner.run(&self.aws_bin, &args)?;
        if !output.is_success() {
            return Err(ArtifactError::List {
                bucket: self.bucket.clone(),
                prefix: prefix.to_owned(),
                status_text: output.status_text(),
                stderr: output.stderr,
            });
        }
        Ok(parse_listing(&output.stdout))
    }

    /// Copies `object_key` from the bucket to `destination`, retrying per
    /// the store's policy. The caller owns cleanup of any partial file.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::DownloadExhausted`] when every attempt fails.
    pub async fn download(&self, object_key: &str, destination: &Utf8Path) -> Result<(), ArtifactError> {
        let source = format!("s3://{}/{object_key}", self.bucket);
        let args = [
            OsString::from("s3"),
            OsString::from("cp"),
            OsString::from(&source),
            OsString::from(destination.as_str()),
        ];

        retry(self.retry, "bucket download", |attempt| -> Result<(), ArtifactError> {
            info!(%source, %destination, attempt, "downloading artifact");
            let output = self.runner.run(&self.aws_bin, &args)?;
            if output.is_success() {
                return Ok(());
            }
            Err(ArtifactError::Download {
                key: object_key.to_owned(),
                status_text: output.status_text(),
                stderr: output.stderr,
            })
        })
        .await
        .map_err(|exhausted| ArtifactError::DownloadExhausted {
            key: object_key.to_owned(),
            attempts: exhausted.attempts,
            last: exhausted.last.to_string(),
        })
    }
}

/// Parses `aws s3 ls` output into object names, skipping `PRE` prefixes.
#[must_use]
pub fn parse_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| !line.trim_start().starts_with("PRE "))
        .filter_map(|line| line.split_whitespace().nth(3))
        .map(str::to_owned)
        .collect()
}

/// Parses `sha256sum` output into `(checksum, path)` pairs.
#[must_use]
pub fn parse_checksums(stdout: &str) -> Vec<(&str, &str)> {
    stdout
        .lines()
        .filter_map(|line| {
            let (checksum, rest) = line.trim().split_once(char::is_whitespace)?;
            let path = rest.trim_start().trim_start_matches('*');
            let valid = checksum.len() == 64 && checksum.chars().all(|ch| ch.is_ascii_hexdigit());
            (valid && !path.is_empty()).then_some((checksum, path))
        })
        .collect()
}
