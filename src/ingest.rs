//! Ingesta de logs de mantenimiento (CSV o JSON-lines) y construcción de
//! las entradas del índice vectorial con sus embeddings.

use std::{
    fs::File,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    time::Instant,
};

use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{
    embeddings::Embedder,
    error::{IndexError, RowRejection},
    models::{parse_timestamp, EquipmentType, IndexEntry, LogRecord},
    vector_store::VectorIndex,
};

/// Lotes de embeddings en vuelo a la vez.
const EMBED_CONCURRENCY: usize = 4;

/// Resumen de los resultados de una construcción del índice.
#[derive(Debug, Default, Clone)]
pub struct IngestionSummary {
    pub records_indexed: usize,
    pub batches: usize,
    pub elapsed_ms: u128,
}

impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} registros indexados en {} lotes ({} ms).",
            self.records_indexed, self.batches, self.elapsed_ms
        )
    }
}

/// Ficheros de origen y registros ya validados.
#[derive(Debug, Default)]
pub struct Corpus {
    pub sources: Vec<PathBuf>,
    pub records: Vec<LogRecord>,
}

/// Fila tal cual llega del fichero; todo opcional hasta validar.
#[derive(Debug, Default, Deserialize)]
struct RawLogRow {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    equipment_id: Option<String>,
    #[serde(default)]
    equipment_type: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    facility: Option<String>,
    #[serde(default)]
    operator: Option<String>,
}

fn present(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl TryFrom<RawLogRow> for LogRecord {
    type Error = String;

    fn try_from(raw: RawLogRow) -> Result<Self, Self::Error> {
        let timestamp = present(raw.timestamp);
        let equipment_id = present(raw.equipment_id);
        let severity = present(raw.severity);
        let message = present(raw.message);

        let missing: Vec<&str> = [
            ("timestamp", timestamp.is_none()),
            ("equipment_id", equipment_id.is_none()),
            ("severity", severity.is_none()),
            ("message", message.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();
        if !missing.is_empty() {
            return Err(format!("faltan campos obligatorios: {}", missing.join(", ")));
        }

        // Los `unwrap_or_default` no se alcanzan: ya se comprobó que existen.
        let equipment_id = equipment_id.unwrap_or_default();
        let equipment_type = match present(raw.equipment_type) {
            Some(declared) => declared.parse::<EquipmentType>()?,
            None => EquipmentType::infer_from_id(&equipment_id).ok_or_else(|| {
                format!("no se puede deducir equipment_type de '{equipment_id}'")
            })?,
        };

        let record = LogRecord {
            timestamp: parse_timestamp(&timestamp.unwrap_or_default())?,
            equipment_id,
            equipment_type,
            severity: severity.unwrap_or_default().parse()?,
            message: message.unwrap_or_default(),
            facility: present(raw.facility),
            operator: present(raw.operator),
        };
        record.validate()?;
        Ok(record)
    }
}

fn finish(
    source_name: &str,
    records: Vec<LogRecord>,
    rejected: Vec<RowRejection>,
) -> Result<Vec<LogRecord>, IndexError> {
    if rejected.is_empty() {
        Ok(records)
    } else {
        Err(IndexError::InvalidRecords {
            source_name: source_name.to_string(),
            rejected,
        })
    }
}

/// Lee un CSV con cabecera. Todas las filas se validan; si alguna falla
/// se devuelve el informe completo de rechazos.
pub fn parse_csv<R: Read>(reader: R, source_name: &str) -> Result<Vec<LogRecord>, IndexError> {
    let load_err = |e: csv::Error| IndexError::Load {
        path: PathBuf::from(source_name),
        source: e.into(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let headers = reader.headers().map_err(load_err)?.clone();

    let mut records = Vec::new();
    let mut rejected = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row.map_err(load_err)?;
        let line = row
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(idx + 2);
        let parsed = row
            .deserialize::<RawLogRow>(Some(&headers))
            .map_err(|e| e.to_string())
            .and_then(LogRecord::try_from);
        match parsed {
            Ok(record) => records.push(record),
            Err(reason) => rejected.push(RowRejection { line, reason }),
        }
    }
    finish(source_name, records, rejected)
}

/// Lee JSON-lines: un objeto por línea, líneas en blanco ignoradas.
pub fn parse_jsonl<R: BufRead>(reader: R, source_name: &str) -> Result<Vec<LogRecord>, IndexError> {
    let mut records = Vec::new();
    let mut rejected = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| IndexError::Load {
            path: PathBuf::from(source_name),
            source: e.into(),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<RawLogRow>(&line)
            .map_err(|e| e.to_string())
            .and_then(LogRecord::try_from);
        match parsed {
            Ok(record) => records.push(record),
            Err(reason) => rejected.push(RowRejection { line: idx + 1, reason }),
        }
    }
    finish(source_name, records, rejected)
}

fn is_supported(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(std::ffi::OsStr::to_str)
            .map(str::to_lowercase)
            .as_deref(),
        Some("csv" | "jsonl" | "ndjson" | "json")
    )
}

/// Carga un fichero eligiendo el formato por extensión.
pub fn load_records(path: &Path) -> Result<Vec<LogRecord>, IndexError> {
    let extension = path
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("")
        .to_lowercase();
    let source_name = path.display().to_string();
    let open = || {
        File::open(path).map_err(|e| IndexError::Load {
            path: path.to_path_buf(),
            source: e.into(),
        })
    };

    match extension.as_str() {
        "csv" => parse_csv(open()?, &source_name),
        "jsonl" | "ndjson" | "json" => parse_jsonl(BufReader::new(open()?), &source_name),
        _ => Err(IndexError::UnsupportedFormat(path.to_path_buf())),
    }
}

/// La primera ruta existente gana. Un directorio aporta todos sus ficheros
/// soportados, en orden alfabético.
pub fn discover_sources(candidates: &[PathBuf]) -> Vec<PathBuf> {
    for candidate in candidates {
        if candidate.is_file() {
            return vec![candidate.clone()];
        }
        if candidate.is_dir() {
            let mut files: Vec<PathBuf> = WalkDir::new(candidate)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && is_supported(e.path()))
                .map(|e| e.into_path())
                .collect();
            if !files.is_empty() {
                files.sort();
                return files;
            }
        }
    }
    Vec::new()
}

/// Descubre y carga el corpus. Sin ficheros, el corpus queda vacío.
pub fn load_corpus(candidates: &[PathBuf]) -> Result<Corpus, IndexError> {
    let sources = discover_sources(candidates);
    if sources.is_empty() {
        warn!(
            "No se encontró ningún fichero de logs en {:?}. El índice quedará vacío.",
            candidates
        );
        return Ok(Corpus::default());
    }

    let mut records = Vec::new();
    for source in &sources {
        let loaded = load_records(source)?;
        info!("Cargados {} registros desde {}", loaded.len(), source.display());
        records.extend(loaded);
    }
    Ok(Corpus { sources, records })
}

/// `load_corpus` en el pool de tareas bloqueantes de tokio: la lectura de
/// ficheros grandes no ocupa un worker del runtime.
pub async fn read_corpus(candidates: Vec<PathBuf>) -> Result<Corpus, IndexError> {
    tokio::task::spawn_blocking(move || load_corpus(&candidates))
        .await
        .map_err(IndexError::LoadTask)?
}

/// Valida los registros y calcula sus embeddings por lotes, asignando ids
/// secuenciales en el orden de entrada.
pub async fn build_entries(
    embedder: &dyn Embedder,
    records: Vec<LogRecord>,
    batch_size: usize,
) -> Result<(Vec<IndexEntry>, usize), IndexError> {
    let rejected: Vec<RowRejection> = records
        .iter()
        .enumerate()
        .filter_map(|(idx, record)| {
            record.validate().err().map(|reason| RowRejection {
                line: idx + 1,
                reason,
            })
        })
        .collect();
    if !rejected.is_empty() {
        return Err(IndexError::InvalidRecords {
            source_name: "lote de indexación".to_string(),
            rejected,
        });
    }

    let texts: Vec<String> = records.iter().map(LogRecord::searchable_text).collect();
    let batches: Vec<Vec<String>> = texts
        .chunks(batch_size.max(1))
        .map(<[String]>::to_vec)
        .collect();
    let batch_count = batches.len();

    let vectors: Vec<Vec<Vec<f64>>> = futures::stream::iter(batches)
        .map(|batch| async move { embedder.embed_batch(&batch).await })
        .buffered(EMBED_CONCURRENCY)
        .try_collect()
        .await?;
    let vectors: Vec<Vec<f64>> = vectors.into_iter().flatten().collect();

    if vectors.len() != records.len() {
        return Err(crate::error::EmbeddingError::CountMismatch {
            expected: records.len(),
            actual: vectors.len(),
        }
        .into());
    }

    let entries = records
        .into_iter()
        .zip(texts)
        .zip(vectors)
        .enumerate()
        .map(|(seq, ((metadata, searchable_text), embedding))| IndexEntry {
            id: seq.to_string(),
            seq: seq as u64,
            embedding,
            searchable_text,
            metadata,
        })
        .collect();

    Ok((entries, batch_count))
}

/// Indexador del corpus: embeddings + sustitución atómica del contenido
/// del índice. Reindexar reemplaza la generación anterior por completo.
pub async fn index_records(
    embedder: &dyn Embedder,
    index: &dyn VectorIndex,
    records: Vec<LogRecord>,
    batch_size: usize,
) -> Result<IngestionSummary, IndexError> {
    let started = Instant::now();
    let (entries, batches) = build_entries(embedder, records, batch_size).await?;
    let records_indexed = entries.len();
    index.replace_all(entries).await?;

    Ok(IngestionSummary {
        records_indexed,
        batches,
        elapsed_ms: started.elapsed().as_millis(),
    })
}
