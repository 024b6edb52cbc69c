//! Loading query documents from disk or inline JSON.

use std::path::Path;

use md5::{Digest, Md5};

use hqexport_query::{parse_query, Expr};

use crate::config::substitute_env_vars;
use crate::error::ExportError;

/// A parsed query plus the identity the checkpoint scope is keyed on.
#[derive(Debug, Clone)]
pub struct QueryFile {
    /// Original file name, when loaded from disk.
    pub name: Option<String>,
    /// Digest of the raw file contents. Stable across environment
    /// variable changes so checkpoints survive credential rotation.
    pub md5: String,
    pub expr: Expr,
}

impl QueryFile {
    pub fn load(path: &Path) -> Result<Self, ExportError> {
        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw)?;
        let expr =
            parse_query(&substituted).map_err(|e| ExportError::QueryParse(e.to_string()))?;
        Ok(Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            md5: md5_hex(&raw),
            expr,
        })
    }

    /// Parse a query passed inline on the command line.
    pub fn from_inline(src: &str) -> Result<Self, ExportError> {
        let substituted = substitute_env_vars(src)?;
        let expr =
            parse_query(&substituted).map_err(|e| ExportError::QueryParse(e.to_string()))?;
        Ok(Self {
            name: None,
            md5: md5_hex(src),
            expr,
        })
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
