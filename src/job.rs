//! Requests to the external compute service.

use std::fs;
use std::process::Command;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const METADATA_FUNCTION: &str = "metadata";
pub const CONVERT_FUNCTION: &str = "convert";

/// Parameters handed to the job; this is the input JSON the job reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParms {
    pub function: String,
    pub granule: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Execute-image request: run `command` inside `image` on `parms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub image: String,
    pub command: String,
    pub parms: JobParms,
}

/// On success `result` is the produced CSV block; on failure it is a
/// readable error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponse {
    pub status: bool,
    pub result: String,
}

impl JobResponse {
    pub fn ok(result: impl Into<String>) -> Self {
        JobResponse {
            status: true,
            result: result.into(),
        }
    }

    pub fn failed(result: impl Into<String>) -> Self {
        JobResponse {
            status: false,
            result: result.into(),
        }
    }
}

/// Boundary to the compute service. Both an `Err` and a response with
/// `status == false` are treated as retryable by the dispatcher.
pub trait JobClient: Send + Sync {
    fn invoke(&self, request: &JobRequest) -> Result<JobResponse>;
}

/// Runs `request.command <input json> <output json>` as a local process.
/// The command is expected to write a [`JobResponse`] to the output file.
#[derive(Debug, Clone, Default)]
pub struct CommandJobClient;

impl CommandJobClient {
    pub fn new() -> Self {
        CommandJobClient
    }
}

impl JobClient for CommandJobClient {
    fn invoke(&self, request: &JobRequest) -> Result<JobResponse> {
        let mut words = request.command.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| Error::Job("empty job command".to_string()))?;

        let workdir = tempfile::tempdir().map_err(|e| Error::io(std::env::temp_dir(), e))?;
        let input = workdir.path().join("input.json");
        let output = workdir.path().join("output.json");
        fs::write(&input, serde_json::to_vec(&request.parms)?).map_err(|e| Error::io(&input, e))?;

        debug!(
            "Running {} ({}) for {}",
            request.command, request.image, request.parms.granule
        );
        let status = Command::new(program)
            .args(words)
            .arg(&input)
            .arg(&output)
            .status()
            .map_err(|e| Error::Job(format!("failed to start '{}': {}", request.command, e)))?;
        if !status.success() {
            return Err(Error::Job(format!("'{}' exited with {}", request.command, status)));
        }

        let text = fs::read_to_string(&output).map_err(|e| Error::io(&output, e))?;
        Ok(serde_json::from_str(&text)?)
    }
}
