//! Command-line interface definitions for the `alcib` binary.
//!
//! The parser depends on clap alone so the build script can include it
//! when rendering the manual page.

use clap::Parser;
use clap::builder::PossibleValuesParser;

/// Backends accepted by `--backend`.
pub(crate) const BACKENDS: [&str; 6] = [
    "virtualbox",
    "vmware_desktop",
    "hyperv",
    "kvm",
    "aws-stage-2",
    "equinix",
];

/// Stages accepted by `--stage`.
pub(crate) const STAGES: [&str; 5] = ["init", "build", "test", "release", "destroy"];

/// Architectures accepted by `--arch`.
pub(crate) const ARCHITECTURES: [&str; 2] = ["x86_64", "aarch64"];

/// Runs one stage of the image lifecycle on one build target.
#[derive(Debug, Parser)]
#[command(
    name = "alcib",
    version,
    about = "Build, test, and release VM images on remote build hosts",
    long_about = "Build, test, and release VM images on remote build hosts.\n\n\
        Each invocation runs exactly one stage against one backend and \
        architecture. Settings come from alcib.toml and ALCIB_* variables."
)]
pub(crate) struct Cli {
    /// Virtualization or cloud backend that hosts the build.
    #[arg(
        long,
        visible_alias = "hypervisor",
        value_name = "BACKEND",
        value_parser = PossibleValuesParser::new(BACKENDS)
    )]
    pub(crate) backend: String,
    /// Lifecycle stage to run.
    #[arg(long, value_name = "STAGE", value_parser = PossibleValuesParser::new(STAGES))]
    pub(crate) stage: String,
    /// Architecture of the image.
    #[arg(
        long,
        value_name = "ARCH",
        default_value = "x86_64",
        value_parser = PossibleValuesParser::new(ARCHITECTURES)
    )]
    pub(crate) arch: String,
}
