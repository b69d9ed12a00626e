//! In-process store
//!
//! Keeps agents, their published batches and persisted image stacks in
//! memory. Useful for local runs and as the reference behaviour for the
//! [`Store`] contract in tests.

use crate::backends::{stack_key, Agent, Container, ContainerGroup, ImageStack, Store};
use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone)]
struct AgentRecord {
    agent: Agent,
    batches: BTreeMap<i64, Vec<Container>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    agents: HashMap<String, AgentRecord>,
    documents: BTreeMap<String, ImageStack>,
}

/// [`Store`] backed by process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches currently held for an agent
    pub fn batch_count(&self, agent: &Agent) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .agents
            .get(&agent.key())
            .map(|record| record.batches.len())
            .unwrap_or(0)
    }

    /// Keys of every persisted image stack
    pub fn document_keys(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.documents.keys().cloned().collect()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn store_container(&self, container: &Container, agent: &Agent) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let record = state
            .agents
            .entry(agent.key())
            .or_insert_with(|| AgentRecord {
                agent: agent.clone(),
                batches: BTreeMap::new(),
            });
        // Lifetime may change between agent restarts
        record.agent.lifetime = agent.lifetime;

        let batch = record
            .batches
            .entry(container.timestamp.timestamp())
            .or_default();
        match batch.iter_mut().find(|c| c.id == container.id) {
            Some(existing) => *existing = container.clone(),
            None => batch.push(container.clone()),
        }
        Ok(())
    }

    async fn store_image_stack(&self, stack: &ImageStack, prefix: &str) -> Result<()> {
        let key = stack_key(prefix, &stack.metadata.image_id);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.documents.insert(key, stack.clone());
        Ok(())
    }

    async fn load_agents(&self) -> Result<Vec<Agent>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut agents: Vec<Agent> = state.agents.values().map(|r| r.agent.clone()).collect();
        agents.sort_by_key(|a| a.key());
        Ok(agents)
    }

    async fn load_container_group(&self, agent: &Agent) -> Result<ContainerGroup> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let record = state
            .agents
            .get(&agent.key())
            .ok_or_else(|| anyhow!("agent {} not found", agent))?;
        let (id, containers) = record
            .batches
            .iter()
            .next_back()
            .ok_or_else(|| anyhow!("agent {} has not published any containers", agent))?;

        Ok(ContainerGroup {
            id: *id,
            date: Utc.timestamp_opt(*id, 0).single().unwrap_or_else(Utc::now),
            containers: containers.clone(),
        })
    }

    async fn load_image_stacks(&self, prefix: &str) -> Result<Vec<ImageStack>> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .documents
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, stack)| stack.clone())
            .collect())
    }

    async fn maintain(&self, agent: &Agent, latest_batch_id: i64) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = state.agents.get_mut(&agent.key()) {
            record.batches.retain(|id, _| *id == latest_batch_id);
        }
        Ok(())
    }

    async fn delete_agent(&self, agent: &Agent) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.agents.remove(&agent.key());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let nested = format!("{}/", key.trim_end_matches('/'));
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .documents
            .retain(|k, _| k != key && !k.starts_with(&nested));
        Ok(())
    }
}
