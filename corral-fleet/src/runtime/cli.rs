//! Command line container runtime
//!
//! Drives the `docker` (or a compatible `podman`) client binary:
//! - Checking the runtime is available
//! - Listing and inspecting images and containers
//! - Running, killing and removing worker containers
//! - Following container logs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_core::domain::image::ImageRecord;
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerSummary, ImageSummary, LogSink,
};
use crate::error::{FleetError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedImage {
    id: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    #[serde(default)]
    repo_digests: Option<Vec<String>>,
    created: String,
}

impl InspectedImage {
    fn created(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Content digest from `repo@sha256:...`, falling back to the image id
    fn digest(&self) -> String {
        self.repo_digests
            .as_ref()
            .and_then(|d| d.first())
            .and_then(|d| d.split_once('@'))
            .map(|(_, digest)| digest.to_string())
            .unwrap_or_else(|| self.id.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    id: String,
    #[serde(default)]
    name: String,
    state: InspectedState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    status: String,
}

/// Container runtime backed by a client binary on `PATH`
#[derive(Debug, Clone)]
pub struct CliRuntime {
    binary: String,
}

impl CliRuntime {
    /// Creates a runtime using the given client binary (e.g. "docker")
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Checks that the client binary is installed and working
    pub async fn check_available(&self) -> Result<String> {
        let version = self
            .run("version check", &self.binary, &["--version".to_string()])
            .await?;
        info!("Container runtime is available: {}", version.trim());
        Ok(version.trim().to_string())
    }

    /// Runs the client and returns its stdout
    ///
    /// A non-zero exit becomes a runtime error carrying the exit code and
    /// both output streams.
    async fn run(&self, operation: &'static str, target: &str, args: &[String]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                FleetError::runtime(
                    operation,
                    target,
                    format!("failed to execute {}: {}", self.binary, e),
                )
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stderr.trim().is_empty() {
            debug!("{} {} stderr: {}", self.binary, operation, stderr.trim());
        }

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(FleetError::runtime(
                operation,
                target,
                format!("exit_code={}, stderr='{}'", exit_code, stderr.trim()),
            ));
        }

        Ok(stdout)
    }

    async fn inspect_images(&self, references: &[String]) -> Result<Vec<InspectedImage>> {
        let mut args = vec!["image".to_string(), "inspect".to_string()];
        args.extend(references.iter().cloned());
        let target = references.join(" ");
        let stdout = self.run("inspect image", &target, &args).await?;
        serde_json::from_str(&stdout)
            .map_err(|e| FleetError::runtime("inspect image", target, e.to_string()))
    }
}

/// Builds the `run` arguments for a worker container
fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];
    for var in &spec.env {
        args.push("-e".to_string());
        args.push(var.clone());
    }
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    for bind in &spec.binds {
        args.push("--volume".to_string());
        args.push(bind.clone());
    }
    args.push(spec.image.clone());
    args.extend(spec.cmd.iter().cloned());
    args
}

/// Copies raw lines from one output stream into the shared sink
async fn forward_lines<R>(reader: R, sink: &Mutex<LogSink>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        if line.last() != Some(&b'\n') {
            line.push(b'\n');
        }
        sink.lock().await.write_all(&line).await?;
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let args: Vec<String> = ["images", "--all", "--quiet", "--no-trunc"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let stdout = self.run("list images", "local images", &args).await?;

        let mut ids: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        ids.sort();
        ids.dedup();

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let images = self.inspect_images(&ids).await?;
        Ok(images
            .into_iter()
            .filter_map(|image| match image.created() {
                Some(created) => Some(ImageSummary {
                    repo_tags: image.repo_tags.clone().unwrap_or_default(),
                    id: image.id,
                    created,
                }),
                None => {
                    warn!("Skipping image {} with unreadable creation time", image.id);
                    None
                }
            })
            .collect())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageRecord> {
        let images = self.inspect_images(&[reference.to_string()]).await?;
        let image = images
            .into_iter()
            .next()
            .ok_or_else(|| FleetError::runtime("inspect image", reference, "no such image"))?;
        let created = image.created().ok_or_else(|| {
            FleetError::runtime("inspect image", reference, "unreadable creation time")
        })?;
        Ok(ImageRecord::new(reference, created).with_digest(image.digest()))
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        self.run("pull", reference, &["pull".to_string(), reference.to_string()])
            .await?;
        Ok(())
    }

    async fn list_containers(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<ContainerSummary>> {
        let args = vec![
            "ps".to_string(),
            "--all".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            format!("label={}={}", label_key, label_value),
            "--format".to_string(),
            "{{.ID}}\t{{.Names}}".to_string(),
        ];
        let stdout = self.run("list containers", label_value, &args).await?;

        Ok(stdout
            .lines()
            .filter_map(|line| {
                let (id, name) = line.trim().split_once('\t')?;
                Some(ContainerSummary {
                    id: id.to_string(),
                    name: name.to_string(),
                })
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let args = vec![
            "container".to_string(),
            "inspect".to_string(),
            id.to_string(),
        ];
        let stdout = self.run("inspect", id, &args).await?;
        let containers: Vec<InspectedContainer> = serde_json::from_str(&stdout)
            .map_err(|e| FleetError::runtime("inspect", id, e.to_string()))?;
        let container = containers
            .into_iter()
            .next()
            .ok_or_else(|| FleetError::runtime("inspect", id, "no such container"))?;

        Ok(ContainerDetails {
            id: container.id,
            name: container.name.trim_start_matches('/').to_string(),
            status: container
                .state
                .status
                .parse()
                .unwrap_or_else(|never| match never {}),
        })
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        info!("Creating container {} from image {}", spec.name, spec.image);
        let stdout = self.run("run", &spec.name, &run_args(spec)).await?;
        let container_id = stdout.trim().to_string();
        if container_id.is_empty() {
            return Err(FleetError::runtime(
                "run",
                &spec.name,
                "runtime returned no container id",
            ));
        }
        debug!("Container {} started with ID: {}", spec.name, container_id);
        Ok(container_id)
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.run("kill", id, &["kill".to_string(), id.to_string()])
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.run("remove", id, &["rm".to_string(), id.to_string()])
            .await?;
        Ok(())
    }

    async fn stream_logs(&self, id: &str, sink: LogSink) -> Result<()> {
        let mut child = Command::new(&self.binary)
            .args(["logs", "--follow", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FleetError::runtime("logs", id, e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FleetError::runtime("logs", id, "stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FleetError::runtime("logs", id, "stderr not captured"))?;

        let sink = Mutex::new(sink);
        let (out, err) = tokio::join!(forward_lines(stdout, &sink), forward_lines(stderr, &sink));

        // The reader may have gone away first; reap the child either way.
        let _ = child.kill().await;
        out.map_err(|e| FleetError::runtime("logs", id, e.to_string()))?;
        err.map_err(|e| FleetError::runtime("logs", id, e.to_string()))?;

        sink.into_inner()
            .shutdown()
            .await
            .map_err(|e| FleetError::runtime("logs", id, e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_run_args_layout() {
        let spec = ContainerSpec {
            name: "fleet1_1".to_string(),
            image: "runner:latest".to_string(),
            env: vec!["WERCKER_RUNNER_TOKEN=abc".to_string()],
            labels: BTreeMap::from([("runner".to_string(), "/x".to_string())]),
            binds: vec!["/tmp:/tmp:rw".to_string()],
            cmd: vec!["/externalRunner.sh".to_string(), "--runner-all".to_string()],
        };
        assert_eq!(
            run_args(&spec),
            vec![
                "run",
                "--detach",
                "--name",
                "fleet1_1",
                "-e",
                "WERCKER_RUNNER_TOKEN=abc",
                "--label",
                "runner=/x",
                "--volume",
                "/tmp:/tmp:rw",
                "runner:latest",
                "/externalRunner.sh",
                "--runner-all",
            ]
        );
    }

    #[test]
    fn test_decode_image_inspect() {
        let body = r#"[{
            "Id": "sha256:abc",
            "RepoTags": ["iad.ocir.io/odx/wercker/wercker-runner:latest"],
            "RepoDigests": ["iad.ocir.io/odx/wercker/wercker-runner@sha256:def"],
            "Created": "2024-05-01T12:00:00.123456789Z"
        }]"#;
        let images: Vec<InspectedImage> = serde_json::from_str(body).unwrap();
        assert_eq!(images[0].digest(), "sha256:def");
        assert!(images[0].created().is_some());
    }

    #[test]
    fn test_decode_image_without_tags() {
        let body = r#"[{"Id": "sha256:abc", "RepoTags": null, "Created": "2024-05-01T12:00:00Z"}]"#;
        let images: Vec<InspectedImage> = serde_json::from_str(body).unwrap();
        assert!(images[0].repo_tags.is_none());
        assert_eq!(images[0].digest(), "sha256:abc");
    }

    #[test]
    fn test_decode_container_inspect() {
        let body = r#"[{"Id": "c0ffee", "Name": "/fleet1_1", "State": {"Status": "exited", "Running": false}}]"#;
        let containers: Vec<InspectedContainer> = serde_json::from_str(body).unwrap();
        assert_eq!(containers[0].id, "c0ffee");
        assert_eq!(containers[0].state.status, "exited");
    }

    #[tokio::test]
    async fn test_forward_lines_terminates_partial_line() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let sink: Mutex<LogSink> = Mutex::new(Box::new(writer));
        forward_lines(&b"one\ntwo"[..], &sink).await.unwrap();
        drop(sink);

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut out)
            .await
            .unwrap();
        assert_eq!(out, "one\ntwo\n");
    }
}
