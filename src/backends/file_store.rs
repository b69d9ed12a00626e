//! Directory-backed store
//!
//! Layout below the configured root:
//!
//! ```text
//! agents/<encoded agent key>/agent.json
//! agents/<encoded agent key>/batches/<batch id>.json
//! <prefix>/<image id>.json
//! ```
//!
//! Image ids containing `/` land in nested directories below the prefix.
//! Documents are plain JSON so a backup can be inspected by hand.

use crate::backends::{stack_key, Agent, Container, ContainerGroup, ImageStack, Store};
use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const AGENTS_DIR: &str = "agents";
const BATCHES_DIR: &str = "batches";
const AGENT_FILE: &str = "agent.json";

/// [`Store`] persisting JSON documents in a directory tree
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    // Serializes read-modify-write of batch files
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a store rooted at `root`; the directory is created on first write
    pub fn new(root: &str) -> Result<Self> {
        if root.trim().is_empty() {
            return Err(anyhow!("file store requires a directory as endpoint"));
        }
        Ok(Self {
            root: PathBuf::from(root),
            write_lock: Mutex::new(()),
        })
    }

    fn agent_dir(&self, agent: &Agent) -> PathBuf {
        self.root.join(AGENTS_DIR).join(agent.encoded_key())
    }

    fn batch_path(&self, agent: &Agent, batch_id: i64) -> PathBuf {
        self.agent_dir(agent)
            .join(BATCHES_DIR)
            .join(format!("{}.json", batch_id))
    }

    /// Map a store key onto a path below the root, refusing to escape it
    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(anyhow!("invalid store key '{}'", key));
        }
        Ok(self.root.join(relative))
    }

    async fn batch_ids(&self, agent: &Agent) -> Result<Vec<i64>> {
        let dir = self.agent_dir(agent).join(BATCHES_DIR);
        let mut ids = Vec::new();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(ids);
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match stem.parse::<i64>() {
                Ok(id) => ids.push(id),
                Err(_) => debug!(path = %path.display(), "Ignoring unexpected file in batch directory"),
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[async_trait::async_trait]
impl Store for FileStore {
    async fn store_container(&self, container: &Container, agent: &Agent) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        write_json(&self.agent_dir(agent).join(AGENT_FILE), agent).await?;

        let path = self.batch_path(agent, container.timestamp.timestamp());
        let mut batch: Vec<Container> = if fs::try_exists(&path).await.unwrap_or(false) {
            read_json(&path).await?
        } else {
            Vec::new()
        };
        match batch.iter_mut().find(|c| c.id == container.id) {
            Some(existing) => *existing = container.clone(),
            None => batch.push(container.clone()),
        }
        write_json(&path, &batch).await
    }

    async fn store_image_stack(&self, stack: &ImageStack, prefix: &str) -> Result<()> {
        let key = stack_key(prefix, &stack.metadata.image_id);
        write_json(&self.key_path(&format!("{}.json", key))?, stack).await
    }

    async fn load_agents(&self) -> Result<Vec<Agent>> {
        let dir = self.root.join(AGENTS_DIR);
        let mut agents = Vec::new();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(agents);
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let agent_file = path.join(AGENT_FILE);
            if !fs::try_exists(&agent_file).await.unwrap_or(false) {
                debug!(path = %path.display(), "Agent directory without descriptor, skipping");
                continue;
            }

            let name = entry.file_name();
            let identity = match Agent::decode_key(&name.to_string_lossy()) {
                Ok(identity) => identity,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Agent directory is not an agent key, skipping");
                    continue;
                }
            };
            let agent = match read_json::<Agent>(&agent_file).await {
                Ok(agent) => agent,
                Err(e) => {
                    warn!(path = %agent_file.display(), error = %e, "Unreadable agent descriptor, skipping");
                    continue;
                }
            };
            if agent.key() != identity.key() {
                warn!(
                    path = %agent_file.display(),
                    directory = %identity,
                    descriptor = %agent,
                    "Agent descriptor does not match its directory, skipping"
                );
                continue;
            }
            agents.push(agent);
        }
        agents.sort_by_key(|a| a.key());
        Ok(agents)
    }

    async fn load_container_group(&self, agent: &Agent) -> Result<ContainerGroup> {
        let latest = self
            .batch_ids(agent)
            .await?
            .last()
            .copied()
            .ok_or_else(|| anyhow!("agent {} has not published any containers", agent))?;
        let containers: Vec<Container> = read_json(&self.batch_path(agent, latest)).await?;

        Ok(ContainerGroup {
            id: latest,
            date: Utc.timestamp_opt(latest, 0).single().unwrap_or_else(Utc::now),
            containers,
        })
    }

    async fn load_image_stacks(&self, prefix: &str) -> Result<Vec<ImageStack>> {
        let dir = self.key_path(prefix)?;
        let mut stacks = Vec::new();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(stacks);
        }

        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .with_context(|| format!("Failed to list {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    stacks.push(read_json::<ImageStack>(&path).await?);
                }
            }
        }
        stacks.sort_by(|a, b| a.metadata.image_id.cmp(&b.metadata.image_id));
        Ok(stacks)
    }

    async fn maintain(&self, agent: &Agent, latest_batch_id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        for id in self.batch_ids(agent).await? {
            if id != latest_batch_id {
                let path = self.batch_path(agent, id);
                fs::remove_file(&path)
                    .await
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }

    async fn delete_agent(&self, agent: &Agent) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let dir = self.agent_dir(agent);
        if fs::try_exists(&dir).await.unwrap_or(false) {
            fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        let document = self.key_path(&format!("{}.json", key.trim_end_matches('/')))?;
        if fs::try_exists(&document).await.unwrap_or(false) {
            fs::remove_file(&document)
                .await
                .with_context(|| format!("Failed to remove {}", document.display()))?;
        }
        if fs::try_exists(&path).await.unwrap_or(false) {
            fs::remove_dir_all(&path)
                .await
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}
