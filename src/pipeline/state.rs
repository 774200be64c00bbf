//! Stages and the lifecycle they move a target through.

use std::fmt;
use std::str::FromStr;

use crate::target::ParseKindError;

use super::StageError;

/// One lifecycle phase.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Stage {
    /// Provision and prepare the build instance.
    Init,
    /// Run the image build and upload its outputs.
    Build,
    /// Run the test harness against the built image.
    Test,
    /// Publish the image.
    Release,
    /// Tear the build instance down.
    Destroy,
}

impl Stage {
    /// Every stage in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Init,
        Self::Build,
        Self::Test,
        Self::Release,
        Self::Destroy,
    ];

    /// CLI spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Build => "build",
            Self::Test => "test",
            Self::Release => "release",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ParseKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| ParseKindError {
                kind: "stage",
                value: value.to_owned(),
                expected: Self::ALL.map(Self::as_str).join(", "),
            })
    }
}

/// Where a target is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PipelineState {
    /// Nothing has run.
    Uninitialized,
    /// The build instance exists and is prepared.
    Provisioned,
    /// The image is built and its outputs are in the bucket.
    Built,
    /// The image passed its harness.
    Tested,
    /// The image is published.
    Released,
    /// The build instance is gone. Terminal.
    Destroyed,
}

impl PipelineState {
    /// State a target must be in for `stage` to run.
    #[must_use]
    pub const fn required_for(stage: Stage) -> Self {
        match stage {
            Stage::Init | Stage::Destroy => Self::Uninitialized,
            Stage::Build => Self::Provisioned,
            Stage::Test => Self::Built,
            Stage::Release => Self::Tested,
        }
    }

    /// The state reached when `stage` succeeds from `self`.
    ///
    /// `destroy` is accepted from every non-terminal state; every other
    /// stage only from its predecessor.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::InvalidTransition`] for any other move.
    pub const fn advance(self, stage: Stage) -> Result<Self, StageError> {
        let next = match (self, stage) {
            (Self::Destroyed, _) => None,
            (_, Stage::Destroy) => Some(Self::Destroyed),
            (Self::Uninitialized, Stage::Init) => Some(Self::Provisioned),
            (Self::Provisioned, Stage::Build) => Some(Self::Built),
            (Self::Built, Stage::Test) => Some(Self::Tested),
            (Self::Tested, Stage::Release) => Some(Self::Released),
            _ => None,
        };
        match next {
            Some(state) => Ok(state),
            None => Err(StageError::InvalidTransition { from: self, stage }),
        }
    }

    /// Whether no further stage can run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Provisioned => "provisioned",
            Self::Built => "built",
            Self::Tested => "tested",
            Self::Released => "released",
            Self::Destroyed => "destroyed",
        })
    }
}
