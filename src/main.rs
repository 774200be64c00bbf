//! Binary entry point for the `alcib` CLI.

use std::io::{self, Write};
use std::process;

use camino::Utf8Path;
use chrono::Local;
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use alcib::config::BuildConfig;
use alcib::connection::{ConnectionFactory, Credential, FixedHosts};
use alcib::pipeline::{PipelineServices, Stage, StageError, StagePipeline};
use alcib::provision::TerraformProvisioner;
use alcib::session::{ProcessCommandRunner, SessionError, SshConfig};
use alcib::signing::SigningClient;
use alcib::target::{Architecture, BackendKind, BuildTarget, ParseKindError, TargetError};
use alcib::vagrant_cloud::VagrantCloudClient;

mod cli;

use cli::Cli;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Argument(#[from] ParseKindError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Credential(#[from] SessionError),
    #[error("{stage} stage failed: {source}")]
    Stage { stage: Stage, source: Box<StageError> },
}

#[tokio::main]
async fn main() {
    let cli = Cli::try_parse().unwrap_or_else(|err| {
        if !err.use_stderr() {
            err.exit();
        }
        err.print().ok();
        process::exit(1);
    });
    init_tracing();

    if let Err(err) = run(&cli).await {
        report_error(&err);
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: &Cli) -> Result<(), CliError> {
    let backend: BackendKind = cli.backend.parse()?;
    let arch: Architecture = cli.arch.parse()?;
    let stage: Stage = cli.stage.parse()?;

    let ssh =
        SshConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let config =
        BuildConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let image = config
        .image_kind()
        .map_err(|err| CliError::Config(err.to_string()))?;

    let runner = ProcessCommandRunner;
    let credential = Credential::from_config(&ssh)?;
    let target = BuildTarget::new(
        backend,
        arch,
        Utf8Path::new(&config.terraform_root),
        config.bare_metal_host.as_deref(),
        TerraformProvisioner::new(config.terraform_bin.as_str(), runner),
    )?;
    let services = PipelineServices {
        runner,
        connections: ConnectionFactory::new(
            ssh,
            credential,
            FixedHosts::from_config(&config),
            runner,
        ),
        registry: VagrantCloudClient::new(
            &config.vagrant_cloud_url,
            config.vagrant_box.clone(),
            config.vagrant_cloud_token.clone(),
        ),
        signer: SigningClient::new(config.signing_url.as_deref(), config.signing_token.clone()),
    };
    let date = Local::now().format("%Y%m%d").to_string();

    let mut pipeline = StagePipeline::new(&config, image, target, services, date).resume_at(stage);
    pipeline
        .run(stage)
        .await
        .map_err(|source| CliError::Stage {
            stage,
            source: Box::new(source),
        })?;
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "alcib: {err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hypervisor_is_an_alias_for_backend() {
        let cli = Cli::try_parse_from(["alcib", "--hypervisor", "kvm", "--stage", "build"])
            .expect("alias accepted");

        assert_eq!(cli.backend, "kvm");
        assert_eq!(cli.stage, "build");
        assert_eq!(cli.arch, "x86_64");
    }

    #[test]
    fn unknown_stage_is_rejected_by_the_parser() {
        let err = Cli::try_parse_from(["alcib", "--backend", "kvm", "--stage", "deploy"])
            .expect_err("unknown stage");

        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn every_cli_spelling_parses_to_a_kind() {
        for backend in cli::BACKENDS {
            assert!(backend.parse::<BackendKind>().is_ok(), "{backend}");
        }
        for stage in cli::STAGES {
            assert!(stage.parse::<Stage>().is_ok(), "{stage}");
        }
        for arch in cli::ARCHITECTURES {
            assert!(arch.parse::<Architecture>().is_ok(), "{arch}");
        }
    }

    #[test]
    fn write_error_prefixes_the_program_name() {
        let mut buf = Vec::new();
        let err = CliError::Config(String::from("missing build_number"));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");

        assert_eq!(rendered, "alcib: configuration error: missing build_number\n");
    }
}
