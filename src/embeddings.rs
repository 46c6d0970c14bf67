//! Función de embedding: texto → vector de dimensión fija.
//!
//! Dos implementaciones detrás del trait `Embedder`:
//!   - `HashingEmbedder`: local, determinista, sin red (por defecto).
//!   - `OpenAiEmbedder`: embeddings de OpenAI a través de Rig.

use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::config::{AppConfig, EmbeddingProvider};
use crate::error::EmbeddingError;

/// Identifica el espacio de embedding: modelo + dimensión.
/// Indexar y consultar con descriptores distintos no tiene sentido.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedderDescriptor {
    pub model: String,
    pub dim: usize,
}

impl fmt::Display for EmbedderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.dim)
    }
}

#[async_trait]
pub trait Embedder: Send + Sync {
    fn descriptor(&self) -> EmbedderDescriptor;

    /// Calcula embeddings en bloque, en el mismo orden que `texts`.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, EmbeddingError>;

    async fn embed(&self, text: &str) -> Result<Vec<f64>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        if vectors.len() != 1 {
            return Err(EmbeddingError::CountMismatch {
                expected: 1,
                actual: vectors.len(),
            });
        }
        Ok(vectors.remove(0))
    }
}

/// Construye el embedder indicado en la configuración.
pub fn from_config(cfg: &AppConfig) -> Arc<dyn Embedder> {
    match cfg.embedding_provider {
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(cfg.embedding_dim)),
        EmbeddingProvider::OpenAI => Arc::new(OpenAiEmbedder::new(
            cfg.llm_embedding_model.clone(),
            cfg.embedding_dim,
        )),
    }
}

// ---------------------------------------------------------------------
// HASHING (local)
// ---------------------------------------------------------------------

/// Bolsa de palabras con *feature hashing* (FNV-1a de 64 bits) normalizada
/// en L2. Textos que comparten términos quedan cerca en coseno.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub const MODEL: &'static str = "hashing-bow";

    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f64> {
        let mut vector = vec![0.0; self.dim];
        for token in tokenize(text) {
            let bucket = (fnv1a(token.as_bytes()) % self.dim as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn descriptor(&self) -> EmbedderDescriptor {
        EmbedderDescriptor {
            model: Self::MODEL.to_string(),
            dim: self.dim,
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Minúsculas y corte en todo lo que no sea alfanumérico o `_`,
/// de modo que `pump_01` se mantiene como un único término.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

// ---------------------------------------------------------------------
// OPENAI (Rig)
// ---------------------------------------------------------------------

/// Embeddings de OpenAI. Requiere `OPENAI_API_KEY` en el entorno.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    model: String,
    dim: usize,
}

impl OpenAiEmbedder {
    pub fn new(model: String, dim: usize) -> Self {
        Self { model, dim }
    }

    fn model_name(&self) -> &str {
        use rig::providers::openai::TEXT_EMBEDDING_3_SMALL;
        if self.model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.model.as_str()
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn descriptor(&self) -> EmbedderDescriptor {
        EmbedderDescriptor {
            model: format!("openai:{}", self.model_name()),
            dim: self.dim,
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, EmbeddingError> {
        use rig::client::EmbeddingsClient as _;
        use rig::embeddings::EmbeddingModel as _;
        use rig::providers::openai;

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let client = openai::Client::from_env();
        let embedding_model = client.embedding_model(self.model_name());

        let embeddings = embedding_model
            .embed_texts(texts.to_vec())
            .await
            .map_err(|e| EmbeddingError::Provider {
                model: self.model_name().to_string(),
                source: anyhow!(e),
            })?;

        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: embeddings.len(),
            });
        }

        embeddings
            .into_iter()
            .map(|emb| {
                if emb.vec.len() == self.dim {
                    Ok(emb.vec)
                } else {
                    Err(EmbeddingError::DimensionMismatch {
                        expected: self.dim,
                        actual: emb.vec.len(),
                    })
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn tokenizer_keeps_equipment_ids_whole() {
        assert_eq!(
            tokenize("pump_01: Temperature 88.0°C"),
            vec!["pump_01", "temperature", "88", "0", "c"]
        );
    }

    #[test]
    fn fnv1a_matches_reference_values() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn hashing_embedding_is_normalized_and_deterministic() {
        let embedder = HashingEmbedder::new(384);
        let a = embedder.embed_text("pump_01 pump ERROR Temperature reading high");
        let b = embedder.embed_text("pump_01 pump ERROR Temperature reading high");
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        assert!(embedder.embed_text("  ...  ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn shared_terms_score_higher() {
        let embedder = HashingEmbedder::new(384);
        let query = embedder.embed_text("pump_01 temperature");
        let hot = embedder.embed_text("pump_01 pump ERROR Temperature reading 88.0°C exceeds normal range");
        let idle = embedder.embed_text("pump_01 pump INFO Operating within normal parameters");
        let other = embedder.embed_text("motor_02 motor WARNING Vibration levels elevated");
        assert!(cosine(&query, &hot) > cosine(&query, &idle));
        assert!(cosine(&query, &idle) > cosine(&query, &other));
    }

    #[tokio::test]
    async fn embed_returns_single_vector() {
        let embedder = HashingEmbedder::new(32);
        let vector = embedder.embed("vibration").await.unwrap();
        assert_eq!(vector.len(), 32);
        assert_eq!(embedder.descriptor().to_string(), "hashing-bow/32");
    }
}
