//! Carga y gestión de configuración de la aplicación (embeddings, índice
//! vectorial, generador de insights y servidor).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// Embedding local por hashing de términos, sin red.
    Hashing,
    OpenAI,
}

impl EmbeddingProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hashing" | "local" => Ok(Self::Hashing),
            "openai" => Ok(Self::OpenAI),
            other => Err(anyhow!("Proveedor de embeddings no soportado: {other}")),
        }
    }

    fn default_dim(&self) -> usize {
        match self {
            Self::Hashing => 384,
            Self::OpenAI => 1536,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VectorBackend {
    Memory,
    Neo4j,
}

impl VectorBackend {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "neo4j" => Ok(Self::Neo4j),
            other => Err(anyhow!("Backend vectorial no soportado: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsightProvider {
    Rules,
    OpenAI,
}

impl InsightProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rules" => Ok(Self::Rules),
            "openai" => Ok(Self::OpenAI),
            other => Err(anyhow!("Proveedor de insights no soportado: {other}")),
        }
    }
}

/// Credenciales de Neo4j; sólo se exigen con `VECTOR_BACKEND=neo4j`.
#[derive(Clone, Debug)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub log_data_paths: Vec<PathBuf>,

    pub embedding_provider: EmbeddingProvider,
    pub llm_embedding_model: String,
    pub embedding_dim: usize,
    pub embed_batch_size: usize,

    pub vector_backend: VectorBackend,
    pub neo4j: Option<Neo4jConfig>,

    pub insight_provider: InsightProvider,
    pub llm_chat_model: String,

    pub default_top_k: usize,
    pub max_top_k: usize,

    pub frontend_dir: PathBuf,
    pub open_browser: bool,
}

const DEFAULT_DATA_PATHS: &str =
    "industrial_logs.csv,data/industrial_logs.csv,data/industrial_logs.jsonl,data";

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8000".to_string());

        let log_data_paths = parse_path_list(
            &env::var("LOG_DATA_PATHS").unwrap_or_else(|_| DEFAULT_DATA_PATHS.to_string()),
        );

        let embedding_provider = EmbeddingProvider::from_str(
            &env::var("EMBEDDING_PROVIDER").unwrap_or_else(|_| "hashing".to_string()),
        )?;
        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let embedding_dim = match env::var("EMBEDDING_DIM") {
            Ok(raw) => parse_positive("EMBEDDING_DIM", &raw)?,
            Err(_) => embedding_provider.default_dim(),
        };
        let embed_batch_size = env_positive("EMBED_BATCH_SIZE", 64)?;

        let vector_backend = VectorBackend::from_str(
            &env::var("VECTOR_BACKEND").unwrap_or_else(|_| "memory".to_string()),
        )?;
        let neo4j = match vector_backend {
            VectorBackend::Neo4j => Some(Neo4jConfig {
                uri: env::var("NEO4J_URI").map_err(|_| anyhow!("Falta NEO4J_URI en el entorno"))?,
                user: env::var("NEO4J_USER")
                    .map_err(|_| anyhow!("Falta NEO4J_USER en el entorno"))?,
                password: env::var("NEO4J_PASSWORD")
                    .map_err(|_| anyhow!("Falta NEO4J_PASSWORD en el entorno"))?,
            }),
            VectorBackend::Memory => None,
        };

        let insight_provider = InsightProvider::from_str(
            &env::var("INSIGHT_PROVIDER").unwrap_or_else(|_| "rules".to_string()),
        )?;
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        require_openai_key(
            &embedding_provider,
            &insight_provider,
            env::var("OPENAI_API_KEY").ok().as_deref(),
        )?;

        let default_top_k = env_positive("DEFAULT_TOP_K", 5)?;
        let max_top_k = env_positive("MAX_TOP_K", 50)?;
        if default_top_k > max_top_k {
            return Err(anyhow!(
                "DEFAULT_TOP_K ({default_top_k}) no puede superar MAX_TOP_K ({max_top_k})"
            ));
        }

        let frontend_dir =
            PathBuf::from(env::var("FRONTEND_DIR").unwrap_or_else(|_| "frontend".to_string()));
        let open_browser = match env::var("OPEN_BROWSER") {
            Ok(raw) => bool::from_str(raw.trim().to_lowercase().as_str())
                .with_context(|| format!("OPEN_BROWSER no es un booleano: '{raw}'"))?,
            Err(_) => false,
        };

        Ok(Self {
            server_addr,
            log_data_paths,
            embedding_provider,
            llm_embedding_model,
            embedding_dim,
            embed_batch_size,
            vector_backend,
            neo4j,
            insight_provider,
            llm_chat_model,
            default_top_k,
            max_top_k,
            frontend_dir,
            open_browser,
        })
    }

    /// Configuración sin red ni ficheros, usada por los tests.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            server_addr: "127.0.0.1:0".to_string(),
            log_data_paths: Vec::new(),
            embedding_provider: EmbeddingProvider::Hashing,
            llm_embedding_model: String::new(),
            embedding_dim: 384,
            embed_batch_size: 2,
            vector_backend: VectorBackend::Memory,
            neo4j: None,
            insight_provider: InsightProvider::Rules,
            llm_chat_model: String::new(),
            default_top_k: 5,
            max_top_k: 50,
            frontend_dir: PathBuf::from("frontend"),
            open_browser: false,
        }
    }
}

fn parse_path_list(raw: &str) -> Vec<PathBuf> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// El cliente de OpenAI lee la clave del entorno en cada uso; sin ella no
/// se puede arrancar ningún proveedor `openai`.
fn require_openai_key(
    embedding: &EmbeddingProvider,
    insight: &InsightProvider,
    key: Option<&str>,
) -> Result<()> {
    let needs_key =
        *embedding == EmbeddingProvider::OpenAI || *insight == InsightProvider::OpenAI;
    if needs_key && key.map_or(true, |k| k.trim().is_empty()) {
        return Err(anyhow!(
            "OPENAI_API_KEY es obligatoria con EMBEDDING_PROVIDER=openai o INSIGHT_PROVIDER=openai"
        ));
    }
    Ok(())
}

fn env_positive(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(raw) => parse_positive(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_positive(name: &str, raw: &str) -> Result<usize> {
    let value: usize = raw
        .trim()
        .parse()
        .with_context(|| format!("{name} no es un entero válido: '{raw}'"))?;
    if value == 0 {
        return Err(anyhow!("{name} debe ser mayor que cero"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_names_case_insensitively() {
        assert_eq!(EmbeddingProvider::from_str("OpenAI").unwrap(), EmbeddingProvider::OpenAI);
        assert_eq!(VectorBackend::from_str("NEO4J").unwrap(), VectorBackend::Neo4j);
        assert_eq!(InsightProvider::from_str("rules").unwrap(), InsightProvider::Rules);
        assert!(VectorBackend::from_str("chroma").is_err());
    }

    #[test]
    fn path_list_skips_blanks() {
        let paths = parse_path_list(" a.csv , ,data ");
        assert_eq!(paths, vec![PathBuf::from("a.csv"), PathBuf::from("data")]);
    }

    #[test]
    fn openai_providers_require_an_api_key() {
        use EmbeddingProvider as E;
        use InsightProvider as I;
        assert!(require_openai_key(&E::Hashing, &I::Rules, None).is_ok());
        assert!(require_openai_key(&E::OpenAI, &I::Rules, None).is_err());
        assert!(require_openai_key(&E::Hashing, &I::OpenAI, Some("  ")).is_err());
        assert!(require_openai_key(&E::OpenAI, &I::OpenAI, Some("sk-test")).is_ok());
    }

    #[test]
    fn positive_numbers_reject_zero_and_garbage() {
        assert_eq!(parse_positive("X", " 7 ").unwrap(), 7);
        assert!(parse_positive("X", "0").is_err());
        assert!(parse_positive("X", "siete").is_err());
    }
}
