//! Mount declarations

use serde::{Deserialize, Serialize};

/// A declared mount point, keyed by its container path in
/// [`ExecutionSpec::mounts`](super::request::ExecutionSpec).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mount {
    /// Content-addressed collection. Without a portable data hash it is an
    /// empty writable collection (used for the output path).
    Collection {
        #[serde(default)]
        portable_data_hash: Option<String>,
        /// Subpath inside the collection
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        writable: bool,
        #[serde(default)]
        exclude_from_output: bool,
    },
    /// Scratch directory
    Tmp {
        #[serde(default)]
        capacity: u64,
    },
    /// Inline JSON exposed as a read-only file
    Json { content: serde_json::Value },
    /// Tree fetched from an external git repository at a fixed commit
    GitTree {
        git_url: String,
        commit: String,
        #[serde(default)]
        path: Option<String>,
    },
    /// Regular file, used for stdout/stderr redirection
    File { path: String },
}

impl Mount {
    pub fn kind(&self) -> &'static str {
        match self {
            Mount::Collection { .. } => "collection",
            Mount::Tmp { .. } => "tmp",
            Mount::Json { .. } => "json",
            Mount::GitTree { .. } => "git_tree",
            Mount::File { .. } => "file",
        }
    }

    pub fn is_writable(&self) -> bool {
        match self {
            Mount::Collection { writable, .. } => *writable,
            Mount::Tmp { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_tagged_kinds() {
        let m: Mount = serde_json::from_str(
            r#"{"kind":"collection","portable_data_hash":"d41d8cd98f00b204e9800998ecf8427e+0"}"#,
        )
        .unwrap();
        assert_eq!(m.kind(), "collection");
        assert!(!m.is_writable());

        let m: Mount = serde_json::from_str(r#"{"kind":"tmp","capacity":1000}"#).unwrap();
        assert_eq!(m, Mount::Tmp { capacity: 1000 });
        assert!(m.is_writable());

        let m: Mount = serde_json::from_str(r#"{"kind":"json","content":{"a":[1,2]}}"#).unwrap();
        assert_eq!(m.kind(), "json");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result = serde_json::from_str::<Mount>(r#"{"kind":"keep"}"#);
        assert!(result.is_err());
    }
}
