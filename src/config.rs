//! Run configuration.
//!
//! One immutable record resolved per invocation, threaded through the
//! scheduler to every task action. The CLI collaborator parses its own
//! flags and hands the result over here; unrecognized or absent flags
//! fall back to the documented defaults.

use serde::Deserialize;

/// Output profile. `Release` enables minified and compressed output,
/// `Dev` enables source maps. Individual actions decide what that means
/// for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Dev,
    Release,
}

/// Which publish actions a deploy run invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployTarget {
    /// Git-pages style publish only.
    #[default]
    Pages,
    /// Remote file transfer only.
    Remote,
    /// Both, pages first.
    Both,
}

impl DeployTarget {
    /// Resolve the `ftp` / `all` mode flags. `all` wins over `ftp`;
    /// neither means git-pages only.
    pub fn from_flags(ftp: bool, all: bool) -> Self {
        if all {
            DeployTarget::Both
        } else if ftp {
            DeployTarget::Remote
        } else {
            DeployTarget::Pages
        }
    }
}

/// What a finished run means for the surrounding process.
///
/// A one-shot build is expected to fail the process when the run failed;
/// an interactive watch session must never die on a task error — it
/// reports and waits for the next change event. The original system left
/// this asymmetry implicit (its lint failure path was not actually wired
/// to the process exit code); here it is a named choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Surface failure through [`crate::RunSummary::exit_code`]. The
    /// default for one-shot runs.
    #[default]
    ExitNonZero,
    /// Report and keep going. Watch mode always behaves like this,
    /// regardless of what the configuration says.
    KeepAlive,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub profile: Profile,
    /// Enhanced live-reload interaction (mirrored clicks, forms and
    /// scrolling in every connected client).
    pub sync: bool,
    pub deploy: DeployTarget,
    /// Commit message override for the git-pages publisher.
    pub message: Option<String>,
    /// Branch override for the git-pages publisher.
    pub branch: Option<String>,
    pub on_failure: FailurePolicy,
}

impl RunConfig {
    pub fn release() -> Self {
        Self {
            profile: Profile::Release,
            ..Self::default()
        }
    }
}
