//! Generación del insight a partir de la consulta y los logs recuperados.
//!
//! Contrato común `(query, logs) -> insight`. La implementación por defecto
//! es una tabla de reglas por palabra clave, ordenada por prioridad; la
//! alternativa usa un modelo de chat de OpenAI vía Rig.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rig::completion::Prompt;
use tracing::debug;

use crate::config::{AppConfig, InsightProvider};
use crate::models::LogRecord;

/// Número de logs (los más similares) que se examinan.
pub const CONTEXT_LOGS: usize = 3;

pub const FALLBACK_INSIGHT: &str =
    "Multiple equipment events detected. Recommend comprehensive system review.";

#[async_trait]
pub trait InsightGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, query: &str, logs: &[LogRecord]) -> Result<String>;
}

pub fn from_config(cfg: &AppConfig) -> Arc<dyn InsightGenerator> {
    match cfg.insight_provider {
        InsightProvider::Rules => Arc::new(RuleEngine::default()),
        InsightProvider::OpenAI => Arc::new(LlmInsight::new(cfg.llm_chat_model.clone())),
    }
}

// ---------------------------------------------------------------------
// REGLAS
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsightCategory {
    Temperature,
    Vibration,
    Pressure,
}

/// Regla: si algún mensaje contiene `keyword` (sin distinguir mayúsculas),
/// se responde con `response`.
#[derive(Debug, Clone)]
pub struct InsightRule {
    pub category: InsightCategory,
    pub keyword: String,
    pub response: String,
}

impl InsightRule {
    pub fn new(category: InsightCategory, keyword: &str, response: &str) -> Self {
        Self {
            category,
            keyword: keyword.to_lowercase(),
            response: response.to_string(),
        }
    }

    fn matches(&self, logs: &[LogRecord]) -> bool {
        logs.iter()
            .any(|log| log.message.to_lowercase().contains(&self.keyword))
    }
}

/// Tabla de reglas evaluada en orden; gana la primera que encaja.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<InsightRule>,
    fallback: String,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(
            vec![
                InsightRule::new(
                    InsightCategory::Temperature,
                    "temperature",
                    "Temperature anomaly detected. Recommend immediate inspection of cooling systems and thermal sensors.",
                ),
                InsightRule::new(
                    InsightCategory::Vibration,
                    "vibration",
                    "Vibration patterns suggest mechanical wear. Schedule bearing inspection and lubrication check.",
                ),
                InsightRule::new(
                    InsightCategory::Pressure,
                    "pressure",
                    "Pressure variations detected. Check for leaks, blockages, or pump performance issues.",
                ),
            ],
            FALLBACK_INSIGHT,
        )
    }
}

impl RuleEngine {
    pub fn new(rules: Vec<InsightRule>, fallback: &str) -> Self {
        Self {
            rules,
            fallback: fallback.to_string(),
        }
    }

    /// Primera regla que encaja con los `CONTEXT_LOGS` primeros logs.
    pub fn classify(&self, logs: &[LogRecord]) -> Option<&InsightRule> {
        let window = &logs[..logs.len().min(CONTEXT_LOGS)];
        self.rules.iter().find(|rule| rule.matches(window))
    }

    /// Función pura: mismas entradas, mismo resultado. La consulta no
    /// interviene en las reglas actuales.
    pub fn generate_insight(&self, _query: &str, logs: &[LogRecord]) -> String {
        self.classify(logs)
            .map(|rule| rule.response.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl InsightGenerator for RuleEngine {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn generate(&self, query: &str, logs: &[LogRecord]) -> Result<String> {
        match self.classify(logs) {
            Some(rule) => debug!(category = ?rule.category, "Regla de insight aplicada"),
            None => debug!("Ninguna regla aplica; insight genérico"),
        }
        Ok(self.generate_insight(query, logs))
    }
}

// ---------------------------------------------------------------------
// LLM (Rig / OpenAI)
// ---------------------------------------------------------------------

/// Mismo contrato que `RuleEngine`, pero redactado por un modelo de chat.
#[derive(Debug, Clone)]
pub struct LlmInsight {
    chat_model: String,
}

impl LlmInsight {
    pub fn new(chat_model: String) -> Self {
        Self { chat_model }
    }

    fn model_name(&self) -> &str {
        if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        }
    }
}

/// Contexto para el modelo: una línea `- {timestamp}: {message}` por log.
pub fn format_context(logs: &[LogRecord]) -> String {
    logs.iter()
        .take(CONTEXT_LOGS)
        .map(|log| format!("- {}: {}", log.timestamp.to_rfc3339(), log.message))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl InsightGenerator for LlmInsight {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate(&self, query: &str, logs: &[LogRecord]) -> Result<String> {
        use rig::client::CompletionClient as _;
        use rig::providers::openai;

        const SYSTEM_PROMPT: &str = r#"
You are a maintenance engineer reviewing industrial equipment logs.
Answer with a single concise diagnostic sentence followed by a recommended action.
Only use the log entries supplied in the context.
"#;

        let client = openai::Client::from_env();
        let context = format!(
            "Relevant Log Entries:\n{}\n\nQuery: {}",
            format_context(logs),
            query
        );

        let agent = client
            .agent(self.model_name())
            .preamble(SYSTEM_PROMPT)
            .context(&context)
            .build();

        let answer = agent
            .prompt("Based on the industrial equipment logs above, provide a concise analysis.")
            .await?;
        Ok(answer.trim().to_string())
    }
}
