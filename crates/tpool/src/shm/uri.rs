// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! SHM region URIs.
//!
//! The only accepted scheme is `shm:file`, with `|`-separated parameters:
//!
//! ```text
//! shm:file?path=/dev/shm/tp_10000_1_hdr|require_hugepages=false
//! ```
//!
//! `path` is mandatory and must be absolute. `require_hugepages` defaults
//! to false. Unknown parameters are rejected so a typo never silently
//! weakens a security-relevant option.

use crate::error::TpError;
use crate::types::URI_MAX_LENGTH;
use crate::Result;

const SCHEME_PREFIX: &str = "shm:file?";

/// Parsed form of an `shm:file` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmUri {
    pub path: String,
    pub require_hugepages: bool,
}

impl ShmUri {
    /// Parse and validate a URI string.
    pub fn parse(uri: &str) -> Result<Self> {
        if uri.len() > URI_MAX_LENGTH {
            return Err(TpError::Config(format!(
                "uri length {} exceeds max {URI_MAX_LENGTH}",
                uri.len()
            )));
        }

        let params = uri
            .strip_prefix(SCHEME_PREFIX)
            .ok_or_else(|| TpError::Config(format!("unsupported shm uri scheme: {uri}")))?;

        let mut path: Option<&str> = None;
        let mut require_hugepages = false;

        for param in params.split('|') {
            let (key, value) = param
                .split_once('=')
                .ok_or_else(|| TpError::Config(format!("malformed uri parameter: {param}")))?;

            match key {
                "path" => {
                    if value.is_empty() {
                        return Err(TpError::Config("empty path in shm uri".into()));
                    }
                    path = Some(value);
                }
                "require_hugepages" => {
                    require_hugepages = match value {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(TpError::Config(format!(
                                "require_hugepages must be true or false, got {other}"
                            )))
                        }
                    };
                }
                other => {
                    return Err(TpError::Config(format!("unknown shm uri parameter: {other}")));
                }
            }
        }

        let path = path.ok_or_else(|| TpError::Config("shm uri missing path".into()))?;
        if !path.starts_with('/') {
            return Err(TpError::Config(format!("shm path must be absolute: {path}")));
        }

        Ok(Self {
            path: path.to_string(),
            require_hugepages,
        })
    }

    /// Render back to the canonical URI string.
    #[must_use]
    pub fn to_uri(&self) -> String {
        format!(
            "{SCHEME_PREFIX}path={}|require_hugepages={}",
            self.path, self.require_hugepages
        )
    }
}
