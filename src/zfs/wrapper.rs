//! The ZFS command wrapper contract (spec.md §6's "ZFS command wrapper
//! contract (consumed)") and its production implementation.
//!
//! The teacher's `zfs.rs` shells out synchronously with `subprocess::Exec`
//! and parses tab-separated `-H` output (`call_read`/`call_do`,
//! `parse_snapshots`). This keeps exactly that shape -- build an argv,
//! run it, parse stdout -- but async, via `tokio::process::Command`, since
//! `send`/`receive` must stream multi-gigabyte payloads through composed
//! readers/writers without buffering the whole thing in memory.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::zfs::{Dataset, DatasetKind, PropertyName, Snapshot};

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub raw: bool,
    pub resumable: bool,
    pub include_properties: Vec<String>,
    pub incremental_base: Option<String>,
    pub compression_level: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    pub resumable: bool,
    pub properties: HashMap<String, String>,
}

/// Outcome of a streamed send/receive: how many bytes moved, and -- on a
/// partial receive -- the resume token ZFS left behind.
#[derive(Debug, Clone, Default)]
pub struct TransferResult {
    pub bytes: u64,
    pub resume_token: Option<String>,
}

/// The full ZFS command surface the core consumes (spec.md §6). Object
/// safe: every streaming method takes a boxed, type-erased reader/writer
/// rather than a generic parameter, so `Arc<dyn ZfsWrapper>` can be shared
/// across the Runner's spawned tasks.
#[async_trait]
pub trait ZfsWrapper: Send + Sync {
    async fn list_datasets(&self, parent: &str, kinds: &str) -> Result<Vec<Dataset>>;
    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<Snapshot>>;
    async fn list_with_property(&self, parent: &str, property: &str) -> Result<Vec<Dataset>>;
    async fn get_dataset(&self, name: &str) -> Result<Dataset>;

    async fn create_filesystem(&self, name: &str) -> Result<()>;
    async fn create_volume(&self, name: &str, size_bytes: u64) -> Result<()>;
    async fn snapshot(&self, dataset: &str, snap_name: &str) -> Result<Snapshot>;
    async fn clone_dataset(&self, snapshot: &str, target: &str) -> Result<()>;
    async fn destroy(&self, name: &str) -> Result<()>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()>;
    async fn get_property(&self, dataset: &str, key: &str) -> Result<Option<String>>;
    async fn inherit_property(&self, dataset: &str, key: &str) -> Result<()>;

    async fn send_snapshot(
        &self,
        snapshot: &str,
        opts: &SendOptions,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<TransferResult>;

    async fn receive_snapshot(
        &self,
        target: &str,
        opts: &ReceiveOptions,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<TransferResult>;

    async fn resume_send(
        &self,
        token: &str,
        opts: &SendOptions,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<TransferResult>;

    async fn rollback(&self, snapshot: &str) -> Result<()>;
    async fn mount(&self, dataset: &str) -> Result<()>;
    async fn unmount(&self, dataset: &str) -> Result<()>;
    async fn load_key(&self, dataset: &str) -> Result<()>;
    async fn unload_key(&self, dataset: &str) -> Result<()>;
    async fn children(&self, dataset: &str) -> Result<Vec<String>>;
}

/// Production implementation: shells out to the real `zfs(8)` binary.
pub struct SubprocessZfsWrapper {
    binary: String,
}

impl SubprocessZfsWrapper {
    pub fn new() -> Self {
        Self {
            binary: "zfs".to_string(),
        }
    }

    /// Builds and runs the command, returning trimmed stdout on success.
    /// Non-zero exit maps to `Error::Command`; ZFS's "dataset does not
    /// exist" message maps to `Error::DatasetNotFound` so list/get call
    /// sites can treat it as "nothing to do" per spec.md §7.
    async fn call_read(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            if stderr.contains("dataset does not exist")
                || stderr.contains("could not find any snapshots to destroy")
            {
                return Err(Error::DatasetNotFound(args.join(" ")));
            }
            if stderr.contains("already exists") {
                return Err(Error::DatasetExists(args.join(" ")));
            }
            return Err(Error::Command {
                command: format!("{} {}", self.binary, args.join(" ")),
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    async fn call_do(&self, args: &[&str]) -> Result<()> {
        self.call_read(args).await.map(|_| ())
    }

    fn parse_dataset_line(line: &str) -> Option<Dataset> {
        // `zfs list -Hpo name,type,origin,used,avail,refer,mountpoint,compression ...`
        let mut fields = line.split('\t');
        let name = fields.next()?.to_string();
        let kind = match fields.next()? {
            "volume" => DatasetKind::Volume,
            "snapshot" => DatasetKind::Snapshot,
            _ => DatasetKind::Filesystem,
        };
        let origin = fields.next().filter(|s| !super::is_unset(s)).map(String::from);
        let used = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let available = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let referenced = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let mountpoint = fields.next().filter(|s| !super::is_unset(s)).map(String::from);
        let compression = fields.next().filter(|s| !super::is_unset(s)).map(String::from);
        Some(Dataset {
            name,
            kind,
            origin,
            space: super::SpaceUsage {
                used,
                available,
                referenced,
                ..Default::default()
            },
            mountpoint,
            compression,
            extra_props: HashMap::new(),
        })
    }

    fn parse_snapshot_line(line: &str) -> Option<Snapshot> {
        // `zfs list -Hpo name,guid,creation,used -t snapshot ...`
        let mut fields = line.split('\t');
        let name = fields.next()?.to_string();
        let guid = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let created_epoch: i64 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let used_bytes = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let created = DateTime::<Utc>::from_timestamp(created_epoch, 0).unwrap_or_else(Utc::now);
        Some(Snapshot {
            name,
            guid,
            created,
            used_bytes,
        })
    }
}

impl Default for SubprocessZfsWrapper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ZfsWrapper for SubprocessZfsWrapper {
    async fn list_datasets(&self, parent: &str, kinds: &str) -> Result<Vec<Dataset>> {
        let output = self
            .call_read(&[
                "list",
                "-Hp",
                "-r",
                "-t",
                kinds,
                "-o",
                "name,type,origin,used,avail,refer,mountpoint,compression",
                parent,
            ])
            .await?;
        Ok(output.lines().filter_map(Self::parse_dataset_line).collect())
    }

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<Snapshot>> {
        let output = self
            .call_read(&[
                "list",
                "-Hp",
                "-r",
                "-t",
                "snapshot",
                "-o",
                "name,guid,creation,used",
                "-s",
                "creation",
                dataset,
            ])
            .await?;
        Ok(output.lines().filter_map(Self::parse_snapshot_line).collect())
    }

    async fn list_with_property(&self, parent: &str, property: &str) -> Result<Vec<Dataset>> {
        let output = self
            .call_read(&[
                "list",
                "-Hp",
                "-r",
                "-o",
                "name,type,origin,used,avail,refer,mountpoint,compression",
                "-s",
                "name",
                parent,
            ])
            .await?;
        let mut datasets = Vec::new();
        for line in output.lines() {
            if let Some(dataset) = Self::parse_dataset_line(line) {
                if self
                    .get_property(&dataset.name, property)
                    .await?
                    .is_some()
                {
                    datasets.push(dataset);
                }
            }
        }
        Ok(datasets)
    }

    async fn get_dataset(&self, name: &str) -> Result<Dataset> {
        let output = self
            .call_read(&[
                "list",
                "-Hp",
                "-o",
                "name,type,origin,used,avail,refer,mountpoint,compression",
                name,
            ])
            .await?;
        output
            .lines()
            .next()
            .and_then(Self::parse_dataset_line)
            .ok_or_else(|| Error::DatasetNotFound(name.to_string()))
    }

    async fn create_filesystem(&self, name: &str) -> Result<()> {
        self.call_do(&["create", name]).await
    }

    async fn create_volume(&self, name: &str, size_bytes: u64) -> Result<()> {
        self.call_do(&["create", "-V", &size_bytes.to_string(), name])
            .await
    }

    async fn snapshot(&self, dataset: &str, snap_name: &str) -> Result<Snapshot> {
        let full = format!("{dataset}@{snap_name}");
        self.call_do(&["snapshot", &full]).await?;
        let output = self
            .call_read(&["list", "-Hp", "-o", "name,guid,creation,used", &full])
            .await?;
        output
            .lines()
            .next()
            .and_then(Self::parse_snapshot_line)
            .ok_or_else(|| Error::DatasetNotFound(full))
    }

    async fn clone_dataset(&self, snapshot: &str, target: &str) -> Result<()> {
        self.call_do(&["clone", snapshot, target]).await
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        self.call_do(&["destroy", name]).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.call_do(&["rename", from, to]).await
    }

    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()> {
        self.call_do(&["set", &format!("{key}={value}"), dataset])
            .await
    }

    async fn get_property(&self, dataset: &str, key: &str) -> Result<Option<String>> {
        let output = self
            .call_read(&["get", "-Hp", "-o", "value", key, dataset])
            .await?;
        let value = output.lines().next().unwrap_or(super::UNSET);
        if super::is_unset(value) {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }

    async fn inherit_property(&self, dataset: &str, key: &str) -> Result<()> {
        self.call_do(&["inherit", key, dataset]).await
    }

    async fn send_snapshot(
        &self,
        snapshot: &str,
        opts: &SendOptions,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<TransferResult> {
        let mut args = vec!["send".to_string()];
        if opts.raw {
            args.push("-w".to_string());
        }
        if opts.resumable {
            args.push("-s".to_string());
        }
        for prop in &opts.include_properties {
            args.push("-p".to_string());
            args.push(prop.clone());
        }
        if let Some(base) = &opts.incremental_base {
            args.push("-i".to_string());
            args.push(base.clone());
        }
        args.push(snapshot.to_string());
        run_streamed_send(&self.binary, &args, sink).await
    }

    async fn receive_snapshot(
        &self,
        target: &str,
        opts: &ReceiveOptions,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<TransferResult> {
        let mut args = vec!["receive".to_string()];
        if opts.resumable {
            args.push("-s".to_string());
        }
        for (key, value) in &opts.properties {
            args.push("-o".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(target.to_string());
        run_streamed_receive(&self.binary, &args, source).await
    }

    async fn resume_send(
        &self,
        token: &str,
        _opts: &SendOptions,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<TransferResult> {
        let args = vec!["send".to_string(), "-t".to_string(), token.to_string()];
        run_streamed_send(&self.binary, &args, sink).await
    }

    async fn rollback(&self, snapshot: &str) -> Result<()> {
        self.call_do(&["rollback", snapshot]).await
    }

    async fn mount(&self, dataset: &str) -> Result<()> {
        self.call_do(&["mount", dataset]).await
    }

    async fn unmount(&self, dataset: &str) -> Result<()> {
        self.call_do(&["unmount", dataset]).await
    }

    async fn load_key(&self, dataset: &str) -> Result<()> {
        self.call_do(&["load-key", dataset]).await
    }

    async fn unload_key(&self, dataset: &str) -> Result<()> {
        self.call_do(&["unload-key", dataset]).await
    }

    async fn children(&self, dataset: &str) -> Result<Vec<String>> {
        let output = self
            .call_read(&["list", "-Hp", "-r", "-d", "1", "-o", "name", dataset])
            .await?;
        Ok(output
            .lines()
            .map(String::from)
            .filter(|name| name != dataset)
            .collect())
    }
}

/// Runs `zfs send ...`, copying stdout into `sink` while the child runs,
/// and classifies a resumable-send stderr message into `TransferResult`'s
/// `resume_token` rather than a bare error, per spec.md §6's
/// `ResumableStreamError`.
async fn run_streamed_send(
    binary: &str,
    args: &[String],
    sink: &mut (dyn AsyncWrite + Unpin + Send),
) -> Result<TransferResult> {
    let mut child = Command::new(binary)
        .args(args)
        .kill_on_drop(true)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdout = child.stdout.take().expect("piped stdout");
    let bytes = tokio::io::copy(&mut stdout, sink).await?;

    let status = child.wait().await?;
    let mut stderr = String::new();
    if let Some(mut err) = child.stderr.take() {
        use tokio::io::AsyncReadExt;
        let _ = err.read_to_string(&mut stderr).await;
    }

    if !status.success() {
        if let Some(token) = extract_resume_token(&stderr) {
            return Ok(TransferResult {
                bytes,
                resume_token: Some(token),
            });
        }
        return Err(Error::Command {
            command: format!("{binary} {}", args.join(" ")),
            stderr,
        });
    }
    Ok(TransferResult {
        bytes,
        resume_token: None,
    })
}

async fn run_streamed_receive(
    binary: &str,
    args: &[String],
    source: &mut (dyn AsyncRead + Unpin + Send),
) -> Result<TransferResult> {
    let mut child = Command::new(binary)
        .args(args)
        .kill_on_drop(true)
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdin = child.stdin.take().expect("piped stdin");
    let bytes = tokio::io::copy(source, &mut stdin).await?;
    drop(stdin);

    let status = child.wait().await?;
    let mut stderr = String::new();
    if let Some(mut err) = child.stderr.take() {
        use tokio::io::AsyncReadExt;
        let _ = err.read_to_string(&mut stderr).await;
    }

    if !status.success() {
        if let Some(token) = extract_resume_token(&stderr) {
            return Err(Error::ResumableStream { token });
        }
        return Err(Error::Command {
            command: format!("{binary} {}", args.join(" ")),
            stderr,
        });
    }
    Ok(TransferResult {
        bytes,
        resume_token: None,
    })
}

/// `zfs receive` reports a resume token on stderr as
/// `... contains partially-complete state. Resuming with: <token>`.
fn extract_resume_token(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .find_map(|line| line.trim().strip_prefix("Resuming with: "))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dataset_line() {
        let line = "tank/data\tfilesystem\t-\t1024\t2048\t512\t/tank/data\tlz4";
        let ds = SubprocessZfsWrapper::parse_dataset_line(line).unwrap();
        assert_eq!(ds.name, "tank/data");
        assert_eq!(ds.kind, DatasetKind::Filesystem);
        assert_eq!(ds.space.used, 1024);
        assert_eq!(ds.compression.as_deref(), Some("lz4"));
    }

    #[test]
    fn parses_snapshot_line() {
        let line = "tank/data@backup_1\t12345\t1700000000\t4096";
        let snap = SubprocessZfsWrapper::parse_snapshot_line(line).unwrap();
        assert_eq!(snap.name, "tank/data@backup_1");
        assert_eq!(snap.guid, 12345);
        assert_eq!(snap.used_bytes, 4096);
    }

    #[test]
    fn extracts_resume_token_from_stderr() {
        let stderr = "cannot receive new filesystem stream: destination 'tank/data' contains partially-complete state.\nResuming with: 1-abc123def\n";
        assert_eq!(
            extract_resume_token(stderr),
            Some("1-abc123def".to_string())
        );
    }

    #[test]
    fn no_resume_token_in_ordinary_error() {
        assert_eq!(extract_resume_token("dataset does not exist\n"), None);
    }
}
