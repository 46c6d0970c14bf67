use anyhow::Result;
use neo4rs::{query, Graph};
use tracing::info;
use url::Url;

use crate::config::Neo4jConfig;

/// Nombre del índice vectorial sobre `:LogEntry(embedding)`.
pub const LOG_ENTRY_INDEX: &str = "logEntryEmbeddingIndex";

pub async fn connect_from_config(cfg: &Neo4jConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.user, &cfg.password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea el constraint de unicidad de `:LogEntry(id)` y el índice vectorial
/// coseno con la dimensión del embedder configurado.
pub async fn ensure_schema(graph: &Graph, dimensions: usize) -> Result<()> {
    graph
        .run(query(
            "CREATE CONSTRAINT log_entry_id IF NOT EXISTS
             FOR (l:LogEntry)
             REQUIRE l.id IS UNIQUE",
        ))
        .await?;

    let mut cursor = graph
        .execute(
            query("SHOW VECTOR INDEXES YIELD name WHERE name = $name RETURN name")
                .param("name", LOG_ENTRY_INDEX),
        )
        .await?;

    if cursor.next().await?.is_some() {
        info!("Índice vectorial '{LOG_ENTRY_INDEX}' ya existe.");
        return Ok(());
    }

    let cypher = format!(
        "\
CREATE VECTOR INDEX {LOG_ENTRY_INDEX}
FOR (l:LogEntry)
ON (l.embedding)
OPTIONS {{
  indexConfig: {{
    `vector.dimensions`: {dimensions},
    `vector.similarity_function`: 'cosine'
  }}
}}"
    );

    graph.run(query(&cypher)).await?;
    info!("Índice vectorial '{LOG_ENTRY_INDEX}' creado ({dimensions} dimensiones).");
    Ok(())
}
