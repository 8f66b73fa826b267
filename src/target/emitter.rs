//! Declarative infrastructure emitter
//!
//! Collects resource blocks and out-of-band data blobs during
//! reconciliation and writes them out in one pass at the end of the run.
//! Nothing reaches disk until [`EmitterTarget::commit`], so partial output
//! is never observed, and everything is keyed through ordered maps, so two
//! runs over the same inputs produce byte-identical files.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use tracing::info;

use crate::{Error, Result};

/// The directory data blobs are written under
const DATA_DIR: &str = "data";

/// Staging emitter for the declarative back-end
pub struct EmitterTarget {
    cluster_name: String,
    region: String,
    resources: BTreeMap<String, BTreeMap<String, Value>>,
    data_files: BTreeMap<String, Vec<u8>>,
    sealed: bool,
}

impl EmitterTarget {
    /// A fresh emitter for one run
    pub fn new(cluster_name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            region: region.into(),
            resources: BTreeMap::new(),
            data_files: BTreeMap::new(),
            sealed: false,
        }
    }

    /// Stage a resource block
    ///
    /// Blocks are keyed `(resource type, logical name)`; rendering the same
    /// resource twice is a task-model bug and fails loudly.
    pub fn render_resource(
        &mut self,
        resource_type: &str,
        name: &str,
        body: Value,
    ) -> Result<()> {
        let by_name = self.resources.entry(resource_type.to_string()).or_default();
        if by_name.contains_key(name) {
            return Err(Error::validation(
                format!("{resource_type}.{name}"),
                "resource rendered twice",
            ));
        }
        by_name.insert(name.to_string(), body);
        Ok(())
    }

    /// Stage an out-of-band data blob, returning the reference to embed in
    /// the resource block
    ///
    /// Blobs land in `data/` named `<resource-type>_<logical-name>_<field>`.
    pub fn write_data_file(
        &mut self,
        resource_type: &str,
        name: &str,
        field: &str,
        content: &[u8],
    ) -> String {
        let file_name = format!("{resource_type}_{name}_{field}");
        self.data_files.insert(file_name.clone(), content.to_vec());
        format!("${{file(\"{DATA_DIR}/{file_name}\")}}")
    }

    /// Mark the run complete; called by the reconciler
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// The rendered main file
    pub fn main_file(&self) -> Result<String> {
        let mut doc = BTreeMap::new();
        doc.insert(
            "provider".to_string(),
            serde_json::json!({ "aws": { "region": self.region } }),
        );
        doc.insert(
            "resource".to_string(),
            serde_json::to_value(&self.resources)?,
        );
        let mut text = serde_json::to_string_pretty(&doc)?;
        text.push('\n');
        Ok(text)
    }

    /// The file names this run produces, relative to the output directory
    pub fn file_names(&self) -> Vec<String> {
        let mut names = vec![format!("{}.tf", self.cluster_name)];
        names.extend(self.data_files.keys().map(|k| format!("{DATA_DIR}/{k}")));
        names
    }

    /// Read a staged data blob (tests)
    pub fn data_file(&self, name: &str) -> Option<&[u8]> {
        self.data_files.get(name).map(Vec::as_slice)
    }

    /// Write the staged output under `out_dir`
    ///
    /// Only a sealed emitter commits: the reconciler seals at end of run,
    /// so an aborted run never leaves files behind. Each file is written to
    /// a temporary sibling and renamed into place.
    pub async fn commit(&self, out_dir: &Path) -> Result<()> {
        if !self.sealed {
            return Err(Error::validation(
                out_dir.display().to_string(),
                "emitter output committed before the run finished",
            ));
        }

        tokio::fs::create_dir_all(out_dir.join(DATA_DIR)).await?;

        let main_path = out_dir.join(format!("{}.tf", self.cluster_name));
        write_atomic(&main_path, self.main_file()?.as_bytes()).await?;

        for (name, content) in &self.data_files {
            write_atomic(&out_dir.join(DATA_DIR).join(name), content).await?;
        }

        info!(
            dir = %out_dir.display(),
            files = self.data_files.len() + 1,
            "wrote infrastructure description"
        );
        Ok(())
    }
}

async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter() -> EmitterTarget {
        EmitterTarget::new("minimal.example.com", "us-test-1")
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let mut target = emitter();
        target
            .render_resource("aws_vpc", "main", serde_json::json!({"cidr_block": "172.20.0.0/16"}))
            .unwrap();
        let err = target
            .render_resource("aws_vpc", "main", serde_json::json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("rendered twice"));
    }

    #[test]
    fn test_data_file_reference_format() {
        let mut target = emitter();
        let reference = target.write_data_file(
            "aws_launch_configuration",
            "nodes.minimal.example.com",
            "user_data",
            b"#!/bin/bash\n",
        );
        assert_eq!(
            reference,
            "${file(\"data/aws_launch_configuration_nodes.minimal.example.com_user_data\")}"
        );
        assert_eq!(
            target.file_names(),
            vec![
                "minimal.example.com.tf".to_string(),
                "data/aws_launch_configuration_nodes.minimal.example.com_user_data".to_string(),
            ]
        );
    }

    #[test]
    fn test_main_file_is_deterministic() {
        let build = || {
            let mut target = emitter();
            target
                .render_resource("aws_subnet", "b", serde_json::json!({"cidr_block": "b"}))
                .unwrap();
            target
                .render_resource("aws_subnet", "a", serde_json::json!({"cidr_block": "a"}))
                .unwrap();
            target
                .render_resource("aws_vpc", "main", serde_json::json!({"cidr_block": "v"}))
                .unwrap();
            target.main_file().unwrap()
        };
        assert_eq!(build(), build());

        // Keys are emitted in sorted order regardless of insertion order.
        let text = build();
        let a = text.find("\"a\"").unwrap();
        let b = text.find("\"b\"").unwrap();
        assert!(a < b);
    }

    #[tokio::test]
    async fn test_commit_requires_sealed_run() {
        let target = emitter();
        let dir = tempfile::tempdir().unwrap();
        let err = target.commit(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("before the run finished"));
    }

    #[tokio::test]
    async fn test_commit_writes_main_and_data_files() {
        let mut target = emitter();
        target
            .render_resource("aws_vpc", "main", serde_json::json!({"cidr_block": "172.20.0.0/16"}))
            .unwrap();
        target.write_data_file("aws_iam_role", "masters.minimal.example.com", "policy", b"{}");
        target.seal();

        let dir = tempfile::tempdir().unwrap();
        target.commit(dir.path()).await.unwrap();

        let main = std::fs::read_to_string(dir.path().join("minimal.example.com.tf")).unwrap();
        assert_eq!(main, target.main_file().unwrap());
        let blob = std::fs::read(
            dir.path()
                .join("data/aws_iam_role_masters.minimal.example.com_policy"),
        )
        .unwrap();
        assert_eq!(blob, b"{}");
    }
}
