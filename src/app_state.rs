use std::sync::Arc;

use anyhow::{Context, Result};

use crate::{
    config::{AppConfig, VectorBackend},
    embeddings, insight, neo4j_client,
    rag::RagService,
    vector_store::{InMemoryIndex, Neo4jIndex, VectorIndex},
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub service: Arc<RagService>,
}

impl AppState {
    /// Conecta los colaboradores indicados en la configuración. El índice
    /// queda sin construir; ver `RagService::rebuild_from_paths`.
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let embedder = embeddings::from_config(&config);

        let index: Arc<dyn VectorIndex> = match (&config.vector_backend, &config.neo4j) {
            (VectorBackend::Neo4j, Some(neo4j_cfg)) => {
                let graph = neo4j_client::connect_from_config(neo4j_cfg)
                    .await
                    .context("Error conectando a Neo4j")?;
                neo4j_client::ensure_schema(&graph, config.embedding_dim)
                    .await
                    .context("Error asegurando el esquema de Neo4j")?;
                Arc::new(Neo4jIndex::new(Arc::new(graph)))
            }
            (VectorBackend::Neo4j, None) => {
                anyhow::bail!("VECTOR_BACKEND=neo4j requiere NEO4J_URI, NEO4J_USER y NEO4J_PASSWORD")
            }
            (VectorBackend::Memory, _) => Arc::new(InMemoryIndex::new()),
        };

        let insight = insight::from_config(&config);

        let service = RagService::new(embedder, index, insight)
            .with_limits(config.default_top_k, config.max_top_k)
            .with_batch_size(config.embed_batch_size);

        Ok(Self {
            config,
            service: Arc::new(service),
        })
    }
}
