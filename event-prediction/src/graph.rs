use anyhow::{Context, Result};
use async_trait::async_trait;
use neo4rs::{query, Graph};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

/// Position of an event in the causal event graph
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphContext {
    /// Distinct causes and effects linked to the event
    pub connected_events: usize,
    /// Events recorded as causing this one
    pub impacting_events: usize,
    pub cluster_size: usize,
    pub importance_rank: f64,
}

/// Read side of the causal graph store
#[async_trait]
pub trait GraphContextProvider: Send + Sync {
    async fn event_context(&self, event_id: Uuid) -> Result<GraphContext>;
}

#[derive(Debug, Deserialize)]
struct ContextRow {
    causes: i64,
    impacts: i64,
    cluster_size: i64,
    importance_rank: f64,
}

/// Causal graph in Neo4j
pub struct Neo4jGraphContext {
    graph: Graph,
}

impl Neo4jGraphContext {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        let graph = Graph::new(uri, user, password)
            .await
            .context("Failed to connect to Neo4j")?;

        info!("Connected to causal event graph");

        Ok(Self { graph })
    }

    pub async fn init_schema(&self) -> Result<()> {
        self.graph
            .run(query(
                "CREATE INDEX event_id IF NOT EXISTS FOR (e:Event) ON (e.id)",
            ))
            .await
            .context("Failed to create event index")?;

        Ok(())
    }
}

#[async_trait]
impl GraphContextProvider for Neo4jGraphContext {
    async fn event_context(&self, event_id: Uuid) -> Result<GraphContext> {
        let mut rows = self
            .graph
            .execute(
                query(
                    "
                MATCH (e:Event {id: $id})
                OPTIONAL MATCH (cause:Event)-[:CAUSES]->(e)
                WITH e, collect(DISTINCT cause.id) AS causes
                OPTIONAL MATCH (e)-[:CAUSES]->(effect:Event)
                WITH e, causes, collect(DISTINCT effect.id) AS impacts
                RETURN size(causes) AS causes,
                       size(impacts) AS impacts,
                       coalesce(e.cluster_size, 0) AS cluster_size,
                       toFloat(coalesce(e.importance_rank, 0.0)) AS importance_rank
                ",
                )
                .param("id", event_id.to_string()),
            )
            .await
            .context("Graph context query failed")?;

        let Some(row) = rows.next().await? else {
            return Ok(GraphContext::default());
        };
        let row: ContextRow = row.to().context("Unexpected graph context row")?;

        Ok(GraphContext {
            connected_events: (row.causes + row.impacts).max(0) as usize,
            impacting_events: row.causes.max(0) as usize,
            cluster_size: row.cluster_size.max(0) as usize,
            importance_rank: row.importance_rank,
        })
    }
}

/// Fixed contexts keyed by event id (for testing and offline runs)
#[derive(Debug, Default)]
pub struct StaticGraphContext {
    contexts: HashMap<Uuid, GraphContext>,
}

impl StaticGraphContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, event_id: Uuid, context: GraphContext) -> Self {
        self.contexts.insert(event_id, context);
        self
    }
}

#[async_trait]
impl GraphContextProvider for StaticGraphContext {
    async fn event_context(&self, event_id: Uuid) -> Result<GraphContext> {
        Ok(self.contexts.get(&event_id).copied().unwrap_or_default())
    }
}
