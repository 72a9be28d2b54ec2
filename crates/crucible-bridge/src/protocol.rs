//! Wire protocol for the file-resolver channel.
//!
//! Requests are `{"m": "isFile" | "readFile", "p": <path>, "i": <id>}`;
//! responses echo the id and carry a plain boolean or string in `r`.

use serde::{Deserialize, Serialize};

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    IsFile,
    ReadFile,
}

/// Request frame sent to the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequest {
    pub m: Method,
    pub p: String,
    pub i: u64,
}

/// Response frame from the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResponse {
    pub i: u64,

    /// Plain boolean (`isFile`) or string (`readFile`)
    #[serde(default)]
    pub r: serde_json::Value,

    /// Host-side failure, e.g. an ENOENT message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}
