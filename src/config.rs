use serde::Deserialize;

use crate::error::BridgeError;

/// Installed location of the sertop binary used when a create request does
/// not name one.
pub const DEFAULT_CHILD_PATH: &str = "/opt/waterproof/vendor/opam/default/bin/sertop";

/// Always passed to the child so it emits null-terminated frames.
pub const PRINT0_ARG: &str = "--print0";

#[derive(Debug, Deserialize)]
struct RawCreateOptions {
    path: String,
    args: Vec<String>,
}

/// Child binary and argument list for one worker, parsed from the content of
/// a create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    pub path: String,
    pub args: Vec<String>,
}

impl CreateOptions {
    /// Empty content selects the installed defaults; otherwise the content
    /// must be a JSON object with `path` and `args`, where an empty `path`
    /// still falls back to the default binary.
    pub fn parse(content: &str) -> Result<Self, BridgeError> {
        if content.is_empty() {
            return Ok(CreateOptions {
                path: DEFAULT_CHILD_PATH.to_string(),
                args: vec!["--implicit".to_string()],
            });
        }

        let raw: RawCreateOptions = serde_json::from_str(content)
            .map_err(|err| BridgeError::Protocol(format!("invalid create options: {err}")))?;

        let path = if raw.path.is_empty() {
            DEFAULT_CHILD_PATH.to_string()
        } else {
            raw.path
        };

        Ok(CreateOptions {
            path,
            args: raw.args,
        })
    }
}
