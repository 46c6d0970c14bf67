//! Servicio de consulta RAG sobre los logs de mantenimiento.
//!
//! Flujo:
//!   1. Embedding de la consulta con el mismo embedder usado al indexar.
//!   2. Búsqueda de los `top_k` logs más similares (coseno).
//!   3. Insight a partir de la consulta y los logs recuperados.
//!   4. Ensamblado del `QueryResult`.
//!
//! El índice tiene un ciclo de vida explícito
//! (`Uninitialized → Building → Ready`). Durante una reconstrucción se
//! sigue respondiendo con la generación anterior.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    embeddings::{EmbedderDescriptor, Embedder},
    error::{IndexError, QueryError},
    ingest::{self, IngestionSummary},
    insight::InsightGenerator,
    models::{LogRecord, QueryResult},
    vector_store::VectorIndex,
};

pub const NO_RESULTS_INSIGHT: &str = "No relevant logs found for this query.";

/// Generación del índice lista para consultas.
#[derive(Debug, Clone)]
pub struct ReadyIndex {
    pub generation: u64,
    pub entries: usize,
    pub embedder: EmbedderDescriptor,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum IndexState {
    Uninitialized,
    Building { previous: Option<ReadyIndex> },
    Ready(ReadyIndex),
}

impl IndexState {
    /// Generación que puede atender consultas ahora mismo.
    fn serving(&self) -> Option<&ReadyIndex> {
        match self {
            Self::Uninitialized => None,
            Self::Building { previous } => previous.as_ref(),
            Self::Ready(ready) => Some(ready),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Building { .. } => "building",
            Self::Ready(_) => "ready",
        }
    }
}

/// Estado visible desde `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: &'static str,
    pub generation: u64,
    pub indexed_entries: usize,
    pub embedding_model: String,
    pub insight_provider: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub built_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct Lifecycle {
    state: IndexState,
    last_error: Option<String>,
}

const INTERRUPTED_BUILD: &str = "la construcción del índice se interrumpió antes de terminar";

fn write_lock(lock: &RwLock<Lifecycle>) -> RwLockWriteGuard<'_, Lifecycle> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn restore(previous: Option<ReadyIndex>) -> IndexState {
    match previous {
        Some(ready) => IndexState::Ready(ready),
        None => IndexState::Uninitialized,
    }
}

/// Reserva exclusiva del estado `Building`. Si se descarta sin cerrarse
/// (pánico o tarea cancelada) vuelve a la generación anterior.
pub struct BuildReservation {
    lifecycle: Arc<RwLock<Lifecycle>>,
    previous: Option<ReadyIndex>,
    settled: bool,
}

impl BuildReservation {
    fn generation(&self) -> u64 {
        self.previous.as_ref().map(|p| p.generation).unwrap_or(0) + 1
    }

    fn settle(&mut self, state: IndexState, last_error: Option<String>) {
        let mut lifecycle = write_lock(&self.lifecycle);
        lifecycle.state = state;
        lifecycle.last_error = last_error;
        self.settled = true;
    }

    fn complete(mut self, ready: ReadyIndex) {
        self.settle(IndexState::Ready(ready), None);
    }

    fn abort(mut self, err: &IndexError) {
        let previous = self.previous.take();
        self.settle(restore(previous), Some(err.to_string()));
    }
}

impl Drop for BuildReservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        error!("{INTERRUPTED_BUILD}; se restaura el estado anterior.");
        let previous = self.previous.take();
        let mut lifecycle = write_lock(&self.lifecycle);
        lifecycle.state = restore(previous);
        lifecycle.last_error = Some(INTERRUPTED_BUILD.to_string());
    }
}

pub struct RagService {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    insight: Arc<dyn InsightGenerator>,
    default_top_k: usize,
    max_top_k: usize,
    embed_batch_size: usize,
    lifecycle: Arc<RwLock<Lifecycle>>,
}

impl RagService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        insight: Arc<dyn InsightGenerator>,
    ) -> Self {
        Self {
            embedder,
            index,
            insight,
            default_top_k: 5,
            max_top_k: 50,
            embed_batch_size: 64,
            lifecycle: Arc::new(RwLock::new(Lifecycle {
                state: IndexState::Uninitialized,
                last_error: None,
            })),
        }
    }

    pub fn with_limits(mut self, default_top_k: usize, max_top_k: usize) -> Self {
        self.default_top_k = default_top_k.max(1);
        self.max_top_k = max_top_k.max(self.default_top_k);
        self
    }

    pub fn with_batch_size(mut self, embed_batch_size: usize) -> Self {
        self.embed_batch_size = embed_batch_size.max(1);
        self
    }

    fn read_lifecycle(&self) -> RwLockReadGuard<'_, Lifecycle> {
        self.lifecycle.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` si hay una generación capaz de responder.
    pub fn is_initialized(&self) -> bool {
        self.read_lifecycle().state.serving().is_some()
    }

    /// Embedder de la generación activa, si tiene entradas.
    fn serving_embedder(&self) -> Option<EmbedderDescriptor> {
        self.read_lifecycle()
            .state
            .serving()
            .filter(|ready| ready.entries > 0)
            .map(|ready| ready.embedder.clone())
    }

    /// Estado del ciclo de vida. El número de entradas se pide al backend.
    pub async fn status(&self) -> Status {
        let mut status = {
            let lifecycle = self.read_lifecycle();
            let serving = lifecycle.state.serving();
            Status {
                state: lifecycle.state.label(),
                generation: serving.map(|r| r.generation).unwrap_or(0),
                indexed_entries: serving.map(|r| r.entries).unwrap_or(0),
                embedding_model: self.embedder.descriptor().to_string(),
                insight_provider: self.insight.name(),
                built_at: serving.map(|r| r.built_at),
                last_error: lifecycle.last_error.clone(),
            }
        };

        if status.generation > 0 {
            match self.index.len().await {
                Ok(count) => status.indexed_entries = count,
                Err(err) => warn!("No se pudo contar el índice en el backend: {err}"),
            }
        }
        status
    }

    // ---------------------------------------------------------------------
    // INDEXACIÓN
    // ---------------------------------------------------------------------

    /// Pasa a `Building`; falla si ya hay una construcción en curso.
    pub fn reserve_build(&self) -> Result<BuildReservation, IndexError> {
        let mut lifecycle = write_lock(&self.lifecycle);
        let previous = match &lifecycle.state {
            IndexState::Building { .. } => return Err(IndexError::AlreadyBuilding),
            IndexState::Uninitialized => None,
            IndexState::Ready(ready) => Some(ready.clone()),
        };
        lifecycle.state = IndexState::Building {
            previous: previous.clone(),
        };
        Ok(BuildReservation {
            lifecycle: Arc::clone(&self.lifecycle),
            previous,
            settled: false,
        })
    }

    /// Indexa `records` como nueva generación, reemplazando la anterior.
    pub async fn index(&self, records: Vec<LogRecord>) -> Result<IngestionSummary, IndexError> {
        let reservation = self.reserve_build()?;
        self.index_reserved(reservation, records).await
    }

    pub async fn index_reserved(
        &self,
        reservation: BuildReservation,
        records: Vec<LogRecord>,
    ) -> Result<IngestionSummary, IndexError> {
        let generation = reservation.generation();
        info!("Construyendo generación {generation} del índice con {} registros...", records.len());

        let result = ingest::index_records(
            self.embedder.as_ref(),
            self.index.as_ref(),
            records,
            self.embed_batch_size,
        )
        .await;

        match result {
            Ok(summary) => {
                reservation.complete(ReadyIndex {
                    generation,
                    entries: summary.records_indexed,
                    embedder: self.embedder.descriptor(),
                    built_at: Utc::now(),
                });
                info!("Generación {generation} lista. {summary}");
                Ok(summary)
            }
            Err(err) => {
                error!("Fallo construyendo la generación {generation}: {err}");
                reservation.abort(&err);
                Err(err)
            }
        }
    }

    /// Carga el corpus desde disco y lo indexa.
    pub async fn rebuild_from_paths(
        &self,
        candidates: &[PathBuf],
    ) -> Result<IngestionSummary, IndexError> {
        let reservation = self.reserve_build()?;
        self.rebuild_reserved(reservation, candidates.to_vec()).await
    }

    /// Como `rebuild_from_paths`, con el estado `Building` ya reservado.
    pub async fn rebuild_reserved(
        &self,
        reservation: BuildReservation,
        candidates: Vec<PathBuf>,
    ) -> Result<IngestionSummary, IndexError> {
        let corpus = match ingest::read_corpus(candidates).await {
            Ok(corpus) => corpus,
            Err(err) => {
                error!("No se pudo cargar el corpus: {err}");
                reservation.abort(&err);
                return Err(err);
            }
        };
        if !corpus.sources.is_empty() {
            info!("Corpus cargado desde {:?}", corpus.sources);
        }
        self.index_reserved(reservation, corpus.records).await
    }

    // ---------------------------------------------------------------------
    // RECUPERACIÓN
    // ---------------------------------------------------------------------

    /// Hasta `top_k` registros, del más al menos similar. Un índice vacío o
    /// sin construir devuelve una lista vacía.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<LogRecord>, QueryError> {
        if top_k == 0 || top_k > self.max_top_k {
            return Err(QueryError::InvalidTopK {
                requested: top_k,
                max: self.max_top_k,
            });
        }

        let Some(indexed_with) = self.serving_embedder() else {
            return Ok(Vec::new());
        };
        let current = self.embedder.descriptor();
        if indexed_with != current {
            return Err(QueryError::EmbeddingSpaceMismatch {
                indexed: indexed_with.to_string(),
                current: current.to_string(),
            });
        }

        let query_vector = self.embedder.embed(query).await?;
        let hits = self.index.search(&query_vector, top_k).await?;
        for hit in &hits {
            debug!(id = %hit.id, score = hit.score, document = %hit.document, "Log recuperado");
        }
        Ok(hits.into_iter().take(top_k).map(|hit| hit.record).collect())
    }

    // ---------------------------------------------------------------------
    // CONSULTAS
    // ---------------------------------------------------------------------

    /// Recuperación + insight para una consulta libre.
    pub async fn handle_query(
        &self,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<QueryResult, QueryError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("query", %request_id);
        async {
            let result = self.run_query(query, top_k).await;
            if let Err(err) = &result {
                match err {
                    QueryError::NotInitialized => {
                        warn!(query, "Consulta recibida antes de construir el índice.")
                    }
                    _ => error!(query, error = %err, "La consulta falló."),
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_query(&self, query: &str, top_k: Option<usize>) -> Result<QueryResult, QueryError> {
        if !self.is_initialized() {
            return Err(QueryError::NotInitialized);
        }
        let top_k = top_k.unwrap_or(self.default_top_k);
        info!(query, top_k, "Procesando consulta");

        let relevant_logs = self.retrieve(query, top_k).await?;
        if relevant_logs.is_empty() {
            return Ok(QueryResult {
                query: query.to_string(),
                insight: NO_RESULTS_INSIGHT.to_string(),
                relevant_logs,
                timestamp: Utc::now(),
            });
        }

        let insight = self
            .insight
            .generate(query, &relevant_logs)
            .await
            .map_err(QueryError::Insight)?;

        Ok(QueryResult {
            query: query.to_string(),
            insight,
            relevant_logs,
            timestamp: Utc::now(),
        })
    }

    /// Convierte una anomalía en consulta. La búsqueda usa
    /// `"{equipment_id} {anomaly_type} {severity}"`; el campo `query` de la
    /// respuesta se sustituye por una etiqueta legible.
    pub async fn handle_anomaly_report(
        &self,
        equipment_id: &str,
        anomaly_type: &str,
        severity: Option<&str>,
    ) -> Result<QueryResult, QueryError> {
        let severity = severity.unwrap_or("WARNING");
        let search_text = format!("{equipment_id} {anomaly_type} {severity}");

        let mut result = self.handle_query(&search_text, None).await?;
        result.query = anomaly_label(equipment_id, anomaly_type);
        Ok(result)
    }
}

pub fn anomaly_label(equipment_id: &str, anomaly_type: &str) -> String {
    format!("Anomaly analysis for {equipment_id}: {anomaly_type}")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::insight::RuleEngine;
    use crate::models::{EquipmentType, Severity};
    use crate::vector_store::InMemoryIndex;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_test::assert_ok;

    pub(crate) fn record(id: &str, severity: Severity, message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            equipment_id: id.to_string(),
            equipment_type: EquipmentType::infer_from_id(id).unwrap(),
            severity,
            message: message.to_string(),
            facility: Some("Plant_A".to_string()),
            operator: None,
        }
    }

    pub(crate) fn scenario_records() -> Vec<LogRecord> {
        vec![
            record("pump_01", Severity::Error, "Temperature reading 88.0°C exceeds normal range"),
            record("motor_02", Severity::Warning, "Vibration levels elevated"),
            record("pump_01", Severity::Info, "Operating within normal parameters"),
        ]
    }

    pub(crate) fn service() -> RagService {
        RagService::new(
            Arc::new(HashingEmbedder::new(384)),
            Arc::new(InMemoryIndex::new()),
            Arc::new(RuleEngine::default()),
        )
    }

    /// Embedder local que falla con `down` y entra en pánico con `panics`.
    #[derive(Default)]
    struct FlakyEmbedder {
        down: AtomicBool,
        panics: AtomicBool,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn descriptor(&self) -> EmbedderDescriptor {
            HashingEmbedder::new(384).descriptor()
        }

        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> Result<Vec<Vec<f64>>, crate::error::EmbeddingError> {
            if self.panics.load(Ordering::SeqCst) {
                panic!("embedder roto");
            }
            if self.down.load(Ordering::SeqCst) {
                return Err(crate::error::EmbeddingError::Provider {
                    model: "flaky".to_string(),
                    source: anyhow!("servicio caído"),
                });
            }
            HashingEmbedder::new(384).embed_batch(texts).await
        }
    }

    #[tokio::test]
    async fn query_before_build_is_not_initialized() {
        let service = service();
        let err = service.handle_query("pump_01", None).await.unwrap_err();
        assert!(matches!(err, QueryError::NotInitialized));
        assert_eq!(service.status().await.state, "uninitialized");
    }

    #[tokio::test]
    async fn retrieve_on_uninitialized_index_is_empty() {
        let service = service();
        assert!(service.retrieve("pump_01", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_index_returns_no_results_message() {
        let service = service();
        assert_ok!(service.index(Vec::new()).await);

        let result = service.handle_query("pump temperature issues", None).await.unwrap();
        assert!(result.relevant_logs.is_empty());
        assert_eq!(result.insight, NO_RESULTS_INSIGHT);
        assert_eq!(result.query, "pump temperature issues");
    }

    #[tokio::test]
    async fn scenario_ranks_error_above_info() {
        let service = service();
        service.index(scenario_records()).await.unwrap();

        let logs = service.retrieve("pump_01 temperature", 2).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].severity, Severity::Error);
        assert_eq!(logs[1].severity, Severity::Info);

        let result = service.handle_query("pump_01 temperature", Some(2)).await.unwrap();
        assert!(result.insight.starts_with("Temperature anomaly detected."));
    }

    #[tokio::test]
    async fn exact_message_query_finds_its_record() {
        let service = service();
        let records = scenario_records();
        service.index(records.clone()).await.unwrap();

        for record in &records {
            let logs = service.retrieve(&record.message, 3).await.unwrap();
            assert_eq!(&logs[0], record);
        }
    }

    #[tokio::test]
    async fn retrieve_respects_top_k_bounds() {
        let service = service().with_limits(5, 10);
        service.index(scenario_records()).await.unwrap();

        assert_eq!(service.retrieve("pump", 1).await.unwrap().len(), 1);
        assert_eq!(service.retrieve("pump", 10).await.unwrap().len(), 3);
        assert!(matches!(
            service.retrieve("pump", 0).await,
            Err(QueryError::InvalidTopK { .. })
        ));
        assert!(matches!(
            service.retrieve("pump", 11).await,
            Err(QueryError::InvalidTopK { .. })
        ));
    }

    #[tokio::test]
    async fn anomaly_report_overwrites_query_label() {
        let service = service();
        service.index(scenario_records()).await.unwrap();

        let result = service
            .handle_anomaly_report("pump_01", "bearing_wear", None)
            .await
            .unwrap();
        assert_eq!(result.query, "Anomaly analysis for pump_01: bearing_wear");
        assert!(!result.relevant_logs.is_empty());
    }

    #[tokio::test]
    async fn reindex_replaces_previous_generation() {
        let service = service();
        service.index(scenario_records()).await.unwrap();
        service
            .index(vec![record("turbine_03", Severity::Warning, "Blade Erosion detected during routine check")])
            .await
            .unwrap();

        let status = service.status().await;
        assert_eq!(status.generation, 2);
        assert_eq!(status.indexed_entries, 1);
        let logs = service.retrieve("pump_01 temperature", 5).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].equipment_id, "turbine_03");
    }

    #[tokio::test]
    async fn failed_build_keeps_previous_generation() {
        let service = service();
        service.index(scenario_records()).await.unwrap();

        let mut bad = record("pump_02", Severity::Info, "ok");
        bad.equipment_id = "motor_09".to_string();
        assert!(service.index(vec![bad]).await.is_err());

        let status = service.status().await;
        assert_eq!(status.state, "ready");
        assert_eq!(status.generation, 1);
        assert!(status.last_error.is_some());
        assert_eq!(service.retrieve("vibration", 1).await.unwrap()[0].equipment_id, "motor_02");
    }

    #[tokio::test]
    async fn embedding_failure_aborts_build() {
        let embedder = Arc::new(FlakyEmbedder::default());
        embedder.down.store(true, Ordering::SeqCst);
        let service = RagService::new(
            embedder,
            Arc::new(InMemoryIndex::new()),
            Arc::new(RuleEngine::default()),
        );
        let err = service.index(scenario_records()).await.unwrap_err();
        assert!(matches!(err, IndexError::Embedding(_)));
        assert!(!service.is_initialized());
    }

    #[tokio::test]
    async fn embedding_failure_at_query_time_is_a_query_error() {
        let embedder = Arc::new(FlakyEmbedder::default());
        let service = RagService::new(
            embedder.clone(),
            Arc::new(InMemoryIndex::new()),
            Arc::new(RuleEngine::default()),
        );
        service.index(scenario_records()).await.unwrap();

        embedder.down.store(true, Ordering::SeqCst);
        let err = service.handle_query("pump_01", None).await.unwrap_err();
        assert!(matches!(err, QueryError::Embedding(_)));
        assert!(err.to_string().contains("servicio caído"));
    }

    #[tokio::test]
    async fn rebuild_from_missing_paths_builds_empty_index() {
        let service = service();
        let dir = tempfile::tempdir().unwrap();
        let summary = service
            .rebuild_from_paths(&[dir.path().join("nope.csv")])
            .await
            .unwrap();
        assert_eq!(summary.records_indexed, 0);
        assert!(service.is_initialized());
    }

    fn flaky_service(embedder: Arc<FlakyEmbedder>) -> RagService {
        RagService::new(
            embedder,
            Arc::new(InMemoryIndex::new()),
            Arc::new(RuleEngine::default()),
        )
    }

    #[tokio::test]
    async fn panicked_build_restores_previous_generation() {
        let embedder = Arc::new(FlakyEmbedder::default());
        let service = Arc::new(flaky_service(embedder.clone()));
        service.index(scenario_records()).await.unwrap();

        embedder.panics.store(true, Ordering::SeqCst);
        let task = tokio::spawn({
            let service = service.clone();
            async move { service.index(scenario_records()).await }
        });
        assert!(task.await.unwrap_err().is_panic());

        let status = service.status().await;
        assert_eq!(status.state, "ready");
        assert_eq!(status.generation, 1);
        assert_eq!(status.last_error.as_deref(), Some(INTERRUPTED_BUILD));

        embedder.panics.store(false, Ordering::SeqCst);
        service.index(scenario_records()).await.unwrap();
        assert_eq!(service.status().await.generation, 2);
    }

    #[tokio::test]
    async fn panicked_first_build_leaves_service_uninitialized() {
        let embedder = Arc::new(FlakyEmbedder::default());
        embedder.panics.store(true, Ordering::SeqCst);
        let service = Arc::new(flaky_service(embedder.clone()));

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.index(scenario_records()).await }
        });
        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(service.status().await.state, "uninitialized");

        embedder.panics.store(false, Ordering::SeqCst);
        assert_ok!(service.index(scenario_records()).await);
        assert!(service.is_initialized());
    }

    #[tokio::test]
    async fn reservation_excludes_a_second_build() {
        let service = service();
        service.index(scenario_records()).await.unwrap();

        let reservation = service.reserve_build().unwrap();
        assert_eq!(service.status().await.state, "building");
        assert!(matches!(
            service.index(Vec::new()).await,
            Err(IndexError::AlreadyBuilding)
        ));
        // Durante la construcción se sigue sirviendo la generación 1.
        assert_eq!(service.retrieve("vibration", 1).await.unwrap().len(), 1);

        let summary = service
            .index_reserved(reservation, vec![record("motor_01", Severity::Info, "ok")])
            .await
            .unwrap();
        assert_eq!(summary.records_indexed, 1);
        assert_eq!(service.status().await.generation, 2);
    }

    #[tokio::test]
    async fn status_counts_entries_in_the_backend() {
        let index = Arc::new(InMemoryIndex::new());
        let service = RagService::new(
            Arc::new(HashingEmbedder::new(384)),
            index.clone(),
            Arc::new(RuleEngine::default()),
        );
        assert_eq!(service.status().await.indexed_entries, 0);
        service.index(scenario_records()).await.unwrap();
        assert_eq!(service.status().await.indexed_entries, 3);

        index.replace_all(Vec::new()).await.unwrap();
        assert_eq!(service.status().await.indexed_entries, 0);
    }
}
