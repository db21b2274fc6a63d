use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Function arguments as sent over the queue.
pub type InvocationArgs = HashMap<String, String>;

/// Status reported in `Code` when a call exceeds its budget.
pub const STATUS_TIMEOUT_OCCURRED: i32 = 524;
/// Status reported in `Code` when the runner exits mid-call.
pub const STATUS_RUNNER_EXITED: i32 = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub podtoken: Option<String>,
    /// Address of the owning instance; only meaningful to a proxy instance.
    #[serde(default)]
    pub podaddr: Option<String>,
    #[serde(default)]
    pub args: InvocationArgs,
}

/// What a runner sends back for every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerReply {
    #[serde(rename = "Code")]
    pub code: i32,
    #[serde(rename = "Return", default)]
    pub ret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunResult {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#return: Option<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Call duration in microseconds.
    #[serde(default)]
    pub time: u64,
}

impl RunResult {
    pub fn completed(reply: RunnerReply) -> Self {
        Self {
            code: reply.code,
            r#return: Some(reply.ret),
            ..Self::default()
        }
    }

    pub fn timed_out() -> Self {
        Self {
            code: STATUS_TIMEOUT_OCCURRED,
            r#return: Some("timeout".to_owned()),
            ..Self::default()
        }
    }

    pub fn exited() -> Self {
        Self {
            code: STATUS_RUNNER_EXITED,
            r#return: Some("exited".to_owned()),
            ..Self::default()
        }
    }

    /// Envelope for a toolchain run; builds carry no return value.
    pub fn build(code: i32, stdout: String, stderr: String) -> Self {
        Self {
            code,
            r#return: None,
            stdout,
            stderr,
            time: 0,
        }
    }

    pub fn return_value(&self) -> &str {
        self.r#return.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub sources: String,
    pub suff: String,
    /// Extra package search path, for toolchains that take one.
    pub packages: Option<String>,
}

impl BuildRequest {
    /// Build parameters travel inside `args` of the common request body.
    pub fn from_args(args: &InvocationArgs) -> Option<Self> {
        let sources = args.get("sources")?.clone();
        let suff = args.get("suff").cloned().unwrap_or_default();
        let packages = args.get("packages").filter(|p| !p.is_empty()).cloned();
        Some(Self {
            sources,
            suff,
            packages,
        })
    }
}

/// JSON half of a handoff message; the descriptors ride alongside it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerInfo {}
