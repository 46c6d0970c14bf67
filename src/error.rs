//! Taxonomía de errores del pipeline de indexación y consulta.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Fallo de la función de embedding.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("el proveedor de embeddings '{model}' falló: {source}")]
    Provider {
        model: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("dimensión de embedding inesperada: esperada {expected}, recibida {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("número de embeddings ({actual}) distinto al número de textos ({expected})")]
    CountMismatch { expected: usize, actual: usize },
}

/// Fallo del índice vectorial (memoria o Neo4j).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("dimensión de vector incompatible con el índice: esperada {expected}, recibida {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("error del backend vectorial: {0}")]
    Backend(#[source] anyhow::Error),
}

impl From<neo4rs::Error> for StoreError {
    fn from(err: neo4rs::Error) -> Self {
        Self::Backend(err.into())
    }
}

/// Fila rechazada durante la ingesta.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRejection {
    /// Número de línea en el fichero de origen (1 = cabecera en CSV).
    pub line: usize,
    pub reason: String,
}

impl fmt::Display for RowRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "línea {}: {}", self.line, self.reason)
    }
}

/// Fallo de la construcción del índice.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("{} registros rechazados en {source_name}: {}", .rejected.len(), summarize(.rejected))]
    InvalidRecords {
        source_name: String,
        rejected: Vec<RowRejection>,
    },
    #[error("no se pudo leer {}: {source}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("formato de fichero no soportado: {}", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("la tarea de carga del corpus terminó de forma anómala: {0}")]
    LoadTask(#[source] tokio::task::JoinError),
    #[error("ya hay una construcción del índice en curso")]
    AlreadyBuilding,
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn summarize(rejected: &[RowRejection]) -> String {
    const SHOWN: usize = 5;
    let mut text = rejected
        .iter()
        .take(SHOWN)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    if rejected.len() > SHOWN {
        text.push_str(&format!("; ... y {} más", rejected.len() - SHOWN));
    }
    text
}

/// Fallo de una consulta en el límite del servicio.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("RAG system not initialized")]
    NotInitialized,
    #[error("top_k debe estar entre 1 y {max}, recibido {requested}")]
    InvalidTopK { requested: usize, max: usize },
    #[error(
        "el índice se construyó con '{indexed}' pero la consulta usa '{current}'; espacios de embedding incompatibles"
    )]
    EmbeddingSpaceMismatch { indexed: String, current: String },
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error("fallo en la búsqueda vectorial: {0}")]
    Search(#[from] StoreError),
    #[error("fallo generando el insight: {0}")]
    Insight(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_records_message_lists_first_rejections() {
        let rejected: Vec<RowRejection> = (2..10)
            .map(|line| RowRejection {
                line,
                reason: "message vacío".to_string(),
            })
            .collect();
        let err = IndexError::InvalidRecords {
            source_name: "logs.csv".to_string(),
            rejected,
        };
        let text = err.to_string();
        assert!(text.starts_with("8 registros rechazados en logs.csv"));
        assert!(text.contains("línea 2: message vacío"));
        assert!(text.contains("... y 3 más"));
    }
}
