//! Virtual filesystem paths for cluster state
//!
//! The config base, secret store and key store are addressed as URIs rather
//! than local paths, because their contents must be fetchable from any
//! cluster node without node-local credentials ("cluster readable"). The
//! engine itself only needs read/write of whole objects, so the surface here
//! is deliberately small.
//!
//! The context is threaded explicitly through the normalizer and reconciler;
//! there is no process-wide filesystem state. The in-memory scheme backs
//! deterministic tests.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::{Error, Result};

/// A parsed VFS location
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VfsPath {
    /// In-memory filesystem, used by tests (`memfs://bucket/key`)
    MemFs(String),
    /// Local file (`file:///path` or a bare path)
    File(PathBuf),
    /// Object storage (`s3://bucket/key`)
    S3 {
        /// Bucket name
        bucket: String,
        /// Object key prefix
        key: String,
    },
    /// HTTP(S) URL, read-only
    Http(String),
}

impl VfsPath {
    /// Parse a URI into a VFS path
    pub fn parse(uri: &str) -> Result<Self> {
        if let Some(rest) = uri.strip_prefix("memfs://") {
            Ok(Self::MemFs(rest.trim_end_matches('/').to_string()))
        } else if let Some(rest) = uri.strip_prefix("file://") {
            Ok(Self::File(PathBuf::from(rest)))
        } else if let Some(rest) = uri.strip_prefix("s3://") {
            let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(Error::validation(uri, "s3 URI is missing a bucket"));
            }
            Ok(Self::S3 {
                bucket: bucket.to_string(),
                key: key.trim_end_matches('/').to_string(),
            })
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            Ok(Self::Http(uri.trim_end_matches('/').to_string()))
        } else if uri.contains("://") {
            Err(Error::validation(uri, "unsupported VFS scheme"))
        } else {
            Ok(Self::File(PathBuf::from(uri)))
        }
    }

    /// Append a path component
    pub fn join(&self, component: &str) -> Self {
        match self {
            Self::MemFs(path) => Self::MemFs(format!("{path}/{component}")),
            Self::File(path) => Self::File(path.join(component)),
            Self::S3 { bucket, key } => Self::S3 {
                bucket: bucket.clone(),
                key: if key.is_empty() {
                    component.to_string()
                } else {
                    format!("{key}/{component}")
                },
            },
            Self::Http(url) => Self::Http(format!("{url}/{component}")),
        }
    }

    /// True iff this location is readable from cluster nodes without
    /// node-local credentials
    ///
    /// Local files never qualify. The in-memory scheme qualifies only when
    /// the context was built cluster-readable (tests).
    pub fn is_cluster_readable(&self, ctx: &VfsContext) -> bool {
        match self {
            Self::S3 { .. } | Self::Http(_) => true,
            Self::MemFs(_) => ctx.memfs_cluster_readable,
            Self::File(_) => false,
        }
    }
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemFs(path) => write!(f, "memfs://{path}"),
            Self::File(path) => write!(f, "file://{}", path.display()),
            Self::S3 { bucket, key } => write!(f, "s3://{bucket}/{key}"),
            Self::Http(url) => write!(f, "{url}"),
        }
    }
}

/// VFS state carried through a provisioning run
#[derive(Clone, Default)]
pub struct VfsContext {
    memfs: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    memfs_cluster_readable: bool,
}

impl VfsContext {
    /// A context whose in-memory filesystem counts as cluster readable
    ///
    /// Tests use this so `memfs://` stores satisfy the cluster-readable
    /// contract the same way `s3://` does in production.
    pub fn cluster_readable_memfs() -> Self {
        Self {
            memfs: Arc::default(),
            memfs_cluster_readable: true,
        }
    }

    /// Read the object at `path`
    pub async fn read_file(&self, path: &VfsPath) -> Result<Vec<u8>> {
        match path {
            VfsPath::MemFs(key) => {
                let files = self.memfs.lock().expect("memfs lock poisoned");
                files.get(key).cloned().ok_or_else(|| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("memfs://{key} not found"),
                    ))
                })
            }
            VfsPath::File(file) => Ok(tokio::fs::read(file).await?),
            VfsPath::Http(url) => {
                let response = reqwest::get(url)
                    .await
                    .map_err(|e| Error::cloud_api("HttpGet", e))?;
                if !response.status().is_success() {
                    return Err(Error::cloud_api(
                        "HttpGet",
                        format!("{url}: {}", response.status()),
                    ));
                }
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| Error::cloud_api("HttpGet", e))?;
                Ok(body.to_vec())
            }
            VfsPath::S3 { .. } => Err(Error::cloud_api(
                "S3Get",
                format!("object storage is not reachable from this process: {path}"),
            )),
        }
    }

    /// Write the object at `path`, replacing any existing content
    pub async fn write_file(&self, path: &VfsPath, data: &[u8]) -> Result<()> {
        match path {
            VfsPath::MemFs(key) => {
                let mut files = self.memfs.lock().expect("memfs lock poisoned");
                files.insert(key.clone(), data.to_vec());
                Ok(())
            }
            VfsPath::File(file) => {
                if let Some(parent) = file.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Ok(tokio::fs::write(file, data).await?)
            }
            VfsPath::S3 { .. } | VfsPath::Http(_) => Err(Error::cloud_api(
                "Put",
                format!("writes are not supported for {path}"),
            )),
        }
    }
}

impl fmt::Debug for VfsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfsContext")
            .field("memfs_cluster_readable", &self.memfs_cluster_readable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schemes() {
        assert_eq!(
            VfsPath::parse("memfs://tests/cluster").unwrap(),
            VfsPath::MemFs("tests/cluster".to_string())
        );
        assert_eq!(
            VfsPath::parse("s3://bucket/clusters/a").unwrap(),
            VfsPath::S3 {
                bucket: "bucket".to_string(),
                key: "clusters/a".to_string()
            }
        );
        assert!(matches!(
            VfsPath::parse("/tmp/state").unwrap(),
            VfsPath::File(_)
        ));
        assert!(VfsPath::parse("ftp://nope").is_err());
    }

    #[test]
    fn test_join_builds_nested_keys() {
        let base = VfsPath::parse("s3://bucket/clusters").unwrap();
        assert_eq!(
            base.join("minimal.example.com").join("config").to_string(),
            "s3://bucket/clusters/minimal.example.com/config"
        );
    }

    #[test]
    fn test_cluster_readability() {
        let plain = VfsContext::default();
        let test_ctx = VfsContext::cluster_readable_memfs();

        let s3 = VfsPath::parse("s3://bucket/key").unwrap();
        let file = VfsPath::parse("file:///tmp/x").unwrap();
        let mem = VfsPath::parse("memfs://tests/x").unwrap();

        assert!(s3.is_cluster_readable(&plain));
        assert!(!file.is_cluster_readable(&plain));
        assert!(!mem.is_cluster_readable(&plain));
        assert!(mem.is_cluster_readable(&test_ctx));
    }

    #[tokio::test]
    async fn test_memfs_roundtrip() {
        let ctx = VfsContext::cluster_readable_memfs();
        let path = VfsPath::parse("memfs://tests/hello").unwrap();

        assert!(ctx.read_file(&path).await.is_err());
        ctx.write_file(&path, b"world").await.unwrap();
        assert_eq!(ctx.read_file(&path).await.unwrap(), b"world");
    }
}
