//! Dictionary-style results for callers not yet moved to `check_call`

use crate::{CheckCall, FleetError, Result, SshManager};
use fleetssh_ssh::{Endpoint, ExecResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Options for [`SshManager::execute_on_remote`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyOptions {
    /// Context prefixed to the failure message
    pub err_msg: Option<String>,
    /// Parse standard output as JSON; conflicts with `yamlify`
    pub jsonify: bool,
    /// Parse standard output as YAML; conflicts with `jsonify`
    pub yamlify: bool,
    /// Accepted exit codes
    pub assert_ec_equal: Vec<i32>,
    /// Return an error on an unexpected exit code
    pub raise_on_assert: bool,
    /// Privilege override
    pub sudo: Option<bool>,
}

impl Default for LegacyOptions {
    fn default() -> Self {
        Self {
            err_msg: None,
            jsonify: false,
            yamlify: false,
            assert_ec_equal: vec![0],
            raise_on_assert: true,
            sudo: None,
        }
    }
}

/// Flattened command result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyResult {
    /// Standard output lines
    pub stdout: Vec<String>,
    /// Standard error lines
    pub stderr: Vec<String>,
    /// Remote exit code
    pub exit_code: i32,
    /// Standard output joined and trimmed
    pub stdout_str: String,
    /// Standard error joined and trimmed
    pub stderr_str: String,
    /// Standard output parsed as JSON, if requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_json: Option<serde_json::Value>,
    /// Standard output parsed as YAML, if requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_yaml: Option<serde_yaml::Value>,
}

impl LegacyResult {
    fn from_exec(result: ExecResult, options: &LegacyOptions) -> Result<Self> {
        let stdout_str = result.stdout_str();
        let stdout_json = if options.jsonify {
            Some(serde_json::from_str(&stdout_str)?)
        } else {
            None
        };
        let stdout_yaml = if options.yamlify {
            Some(serde_yaml::from_str(&stdout_str)?)
        } else {
            None
        };

        Ok(Self {
            stderr_str: result.stderr_str(),
            stdout_str,
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            stdout_json,
            stdout_yaml,
        })
    }
}

impl SshManager {
    /// Run `command` and return a flattened result.
    #[deprecated(note = "use `SshManager::check_call` instead")]
    pub async fn execute_on_remote(
        &self,
        endpoint: &Endpoint,
        command: &str,
        options: &LegacyOptions,
    ) -> Result<LegacyResult> {
        warn!(
            "SshManager::execute_on_remote is deprecated in favor of SshManager::check_call; \
             do not use it in new code"
        );

        if options.jsonify && options.yamlify {
            return Err(FleetError::Configuration(
                "conflicting options: jsonify and yamlify".to_string(),
            ));
        }

        let check = CheckCall {
            error_info: options.err_msg.clone(),
            expected: options.assert_ec_equal.clone(),
            raise_on_err: options.raise_on_assert,
            sudo: options.sudo,
            ..CheckCall::default()
        };
        let result = self.check_call(endpoint, command, &check).await?;
        LegacyResult::from_exec(result, options)
    }
}
