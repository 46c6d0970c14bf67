//! Índice vectorial de entradas de log.
//!
//! API pública:
//!   - trait `VectorIndex` (`upsert`, `replace_all`, `search`, `len`)
//!   - `InMemoryIndex`: coseno exacto en memoria.
//!   - `Neo4jIndex`: nodos `:LogEntry` con índice vectorial nativo de Neo4j.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::anyhow;
use async_trait::async_trait;
use neo4rs::{query, Graph, Row};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{parse_timestamp, IndexEntry, LogRecord};
use crate::neo4j_client::LOG_ENTRY_INDEX;

/// Resultado de una búsqueda: puntuación coseno, id y documento indexado.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub score: f64,
    pub id: String,
    pub document: String,
    pub record: LogRecord,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Inserta o sobrescribe por id.
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), StoreError>;

    /// Sustituye todo el contenido de forma atómica: los lectores ven la
    /// generación anterior hasta que la nueva está completa.
    async fn replace_all(&self, entries: Vec<IndexEntry>) -> Result<(), StoreError>;

    /// Hasta `k` resultados por coseno descendente; empates por orden de inserción.
    async fn search(&self, query_vector: &[f64], k: usize) -> Result<Vec<SearchHit>, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ---------------------------------------------------------------------
// MEMORIA
// ---------------------------------------------------------------------

#[derive(Debug, Default)]
struct Generation {
    entries: Vec<IndexEntry>,
    positions: HashMap<String, usize>,
    dim: Option<usize>,
}

impl Generation {
    fn check_dim(&mut self, actual: usize) -> Result<(), StoreError> {
        match self.dim {
            Some(expected) if expected != actual => {
                Err(StoreError::DimensionMismatch { expected, actual })
            }
            Some(_) => Ok(()),
            None => {
                self.dim = Some(actual);
                Ok(())
            }
        }
    }

    fn insert(&mut self, entry: IndexEntry) -> Result<(), StoreError> {
        self.check_dim(entry.embedding.len())?;
        match self.positions.get(&entry.id) {
            Some(&pos) => self.entries[pos] = entry,
            None => {
                self.positions.insert(entry.id.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
        Ok(())
    }
}

/// Índice exacto en memoria. Las lecturas comparten el lock; sólo
/// `upsert`/`replace_all` lo toman en exclusiva.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    inner: RwLock<Generation>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), StoreError> {
        let mut generation = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        // Validar antes de mutar para no dejar el lote a medias.
        let mut dim = generation.dim;
        for entry in &entries {
            let actual = entry.embedding.len();
            match dim {
                Some(expected) if expected != actual => {
                    return Err(StoreError::DimensionMismatch { expected, actual })
                }
                _ => dim = Some(actual),
            }
        }
        for entry in entries {
            generation.insert(entry)?;
        }
        Ok(())
    }

    async fn replace_all(&self, entries: Vec<IndexEntry>) -> Result<(), StoreError> {
        let mut fresh = Generation::default();
        for entry in entries {
            fresh.insert(entry)?;
        }
        let count = fresh.entries.len();
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        debug!("Índice en memoria reemplazado con {count} entradas.");
        Ok(())
    }

    async fn search(&self, query_vector: &[f64], k: usize) -> Result<Vec<SearchHit>, StoreError> {
        let generation = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if generation.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if let Some(expected) = generation.dim {
            if expected != query_vector.len() {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: query_vector.len(),
                });
            }
        }

        let mut scored: Vec<(f64, &IndexEntry)> = generation
            .entries
            .iter()
            .map(|entry| (cosine_similarity(query_vector, &entry.embedding), entry))
            .collect();
        scored.sort_by(|(sa, ea), (sb, eb)| sb.total_cmp(sa).then(ea.seq.cmp(&eb.seq)));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, entry)| SearchHit {
                score,
                id: entry.id.clone(),
                document: entry.searchable_text.clone(),
                record: entry.metadata.clone(),
            })
            .collect())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().unwrap_or_else(PoisonError::into_inner).entries.len())
    }
}

// ---------------------------------------------------------------------
// NEO4J
// ---------------------------------------------------------------------

/// Índice respaldado por Neo4j. Cada entrada es un nodo `:LogEntry` con
/// el registro original como propiedades y el embedding en `embedding`.
pub struct Neo4jIndex {
    graph: Arc<Graph>,
}

impl Neo4jIndex {
    /// El esquema (constraint + índice vectorial) debe existir ya;
    /// ver `neo4j_client::ensure_schema`.
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }
}

fn merge_entry_query(entry: &IndexEntry) -> neo4rs::Query {
    let record = &entry.metadata;
    query(
        "MERGE (l:LogEntry {id: $id})
         SET l.seq = $seq, l.document = $document, l.embedding = $embedding,
             l.timestamp = $timestamp, l.equipment_id = $equipment_id,
             l.equipment_type = $equipment_type, l.severity = $severity,
             l.message = $message, l.facility = $facility, l.operator = $operator",
    )
    .param("id", entry.id.clone())
    .param("seq", entry.seq as i64)
    .param("document", entry.searchable_text.clone())
    .param("embedding", entry.embedding.clone())
    .param("timestamp", record.timestamp.to_rfc3339())
    .param("equipment_id", record.equipment_id.clone())
    .param("equipment_type", record.equipment_type.as_str())
    .param("severity", record.severity.as_str())
    .param("message", record.message.clone())
    .param("facility", record.facility.clone().unwrap_or_default())
    .param("operator", record.operator.clone().unwrap_or_default())
}

fn missing(name: &str) -> StoreError {
    StoreError::Backend(anyhow!("Falta campo '{name}' en resultado de Neo4j"))
}

fn text_field(row: &Row, name: &str) -> Result<String, StoreError> {
    row.get::<String>(name).ok_or_else(|| missing(name))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn hit_from_row(row: &Row) -> Result<SearchHit, StoreError> {
    let invalid = |msg: String| StoreError::Backend(anyhow!(msg));

    let timestamp = text_field(row, "timestamp")?;
    let equipment_type = text_field(row, "equipment_type")?;
    let severity = text_field(row, "severity")?;

    let record = LogRecord {
        timestamp: parse_timestamp(&timestamp).map_err(invalid)?,
        equipment_id: text_field(row, "equipment_id")?,
        equipment_type: equipment_type.parse().map_err(invalid)?,
        severity: severity.parse().map_err(invalid)?,
        message: text_field(row, "message")?,
        facility: non_empty(row.get::<String>("facility")),
        operator: non_empty(row.get::<String>("operator")),
    };

    Ok(SearchHit {
        score: row.get::<f64>("score").ok_or_else(|| missing("score"))?,
        id: text_field(row, "id")?,
        document: text_field(row, "document")?,
        record,
    })
}

#[async_trait]
impl VectorIndex for Neo4jIndex {
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), StoreError> {
        let tx = self.graph.start_txn().await?;
        for entry in &entries {
            tx.run(merge_entry_query(entry)).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_all(&self, entries: Vec<IndexEntry>) -> Result<(), StoreError> {
        let tx = self.graph.start_txn().await?;
        tx.run(query("MATCH (l:LogEntry) DETACH DELETE l")).await?;
        for entry in &entries {
            tx.run(merge_entry_query(entry)).await?;
        }
        tx.commit().await?;
        info!("Neo4j: generación reemplazada con {} :LogEntry.", entries.len());
        Ok(())
    }

    async fn search(&self, query_vector: &[f64], k: usize) -> Result<Vec<SearchHit>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut cursor = self
            .graph
            .execute(
                query(
                    "CALL db.index.vector.queryNodes($index_name, $k, $embedding)
                     YIELD node, score
                     RETURN node.id AS id, score, node.seq AS seq, node.document AS document,
                            node.timestamp AS timestamp, node.equipment_id AS equipment_id,
                            node.equipment_type AS equipment_type, node.severity AS severity,
                            node.message AS message, node.facility AS facility,
                            node.operator AS operator
                     ORDER BY score DESC, seq ASC",
                )
                .param("index_name", LOG_ENTRY_INDEX)
                .param("k", k as i64)
                .param("embedding", query_vector.to_vec()),
            )
            .await?;

        let mut hits = Vec::new();
        while let Some(row) = cursor.next().await? {
            hits.push(hit_from_row(&row)?);
        }
        hits.truncate(k);
        Ok(hits)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let mut cursor = self
            .graph
            .execute(query("MATCH (l:LogEntry) RETURN count(l) AS n"))
            .await?;
        let count = match cursor.next().await? {
            Some(row) => row.get::<i64>("n").ok_or_else(|| missing("n"))?,
            None => 0,
        };
        Ok(count.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EquipmentType, Severity};
    use chrono::Utc;
    use tokio_test::{assert_err, assert_ok};

    fn entry(id: &str, seq: u64, embedding: Vec<f64>, message: &str) -> IndexEntry {
        let metadata = LogRecord {
            timestamp: Utc::now(),
            equipment_id: "pump_01".to_string(),
            equipment_type: EquipmentType::Pump,
            severity: Severity::Info,
            message: message.to_string(),
            facility: None,
            operator: None,
        };
        IndexEntry {
            id: id.to_string(),
            seq,
            searchable_text: metadata.searchable_text(),
            embedding,
            metadata,
        }
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[2.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn search_orders_by_score_then_insertion() {
        let index = InMemoryIndex::new();
        assert_ok!(
            index
                .upsert(vec![
                    entry("0", 0, vec![0.0, 1.0], "a"),
                    entry("1", 1, vec![1.0, 0.0], "b"),
                    entry("2", 2, vec![1.0, 0.0], "c"),
                    entry("3", 3, vec![1.0, 1.0], "d"),
                ])
                .await
        );

        let hits = index.search(&[1.0, 0.0], 3).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn upsert_overwrites_by_id_in_place() {
        let index = InMemoryIndex::new();
        index.upsert(vec![entry("0", 0, vec![1.0, 0.0], "old")]).await.unwrap();
        index.upsert(vec![entry("0", 0, vec![1.0, 0.0], "new")]).await.unwrap();

        assert_eq!(index.len().await.unwrap(), 1);
        let hits = index.search(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits[0].record.message, "new");
    }

    #[tokio::test]
    async fn rejects_mixed_dimensions() {
        let index = InMemoryIndex::new();
        index.upsert(vec![entry("0", 0, vec![1.0, 0.0], "a")]).await.unwrap();
        assert_err!(index.upsert(vec![entry("1", 1, vec![1.0, 0.0, 0.0], "b")]).await);
        assert_err!(index.search(&[1.0], 1).await);
        assert_eq!(index.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replace_all_swaps_generation() {
        let index = InMemoryIndex::new();
        index
            .upsert(vec![entry("0", 0, vec![1.0, 0.0], "a"), entry("1", 1, vec![0.0, 1.0], "b")])
            .await
            .unwrap();
        index
            .replace_all(vec![entry("0", 0, vec![1.0, 0.0, 0.0], "fresh")])
            .await
            .unwrap();

        assert_eq!(index.len().await.unwrap(), 1);
        let hits = index.search(&[1.0, 0.0, 0.0], 5).await.unwrap();
        assert_eq!(hits[0].record.message, "fresh");
    }

    #[tokio::test]
    async fn empty_index_returns_no_hits() {
        let index = InMemoryIndex::new();
        assert!(index.search(&[1.0, 0.0], 5).await.unwrap().is_empty());
    }
}
