//! Modelos de dominio: eventos de mantenimiento, entradas del índice
//! vectorial y la respuesta de un ciclo de recuperación + insight.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tipos de equipo soportados. El `equipment_id` siempre empieza por el
/// nombre del tipo (`pump_01`, `heat_exchanger_03`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentType {
    Pump,
    Motor,
    Compressor,
    Turbine,
    HeatExchanger,
}

impl EquipmentType {
    pub const ALL: [EquipmentType; 5] = [
        EquipmentType::Pump,
        EquipmentType::Motor,
        EquipmentType::Compressor,
        EquipmentType::Turbine,
        EquipmentType::HeatExchanger,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pump => "pump",
            Self::Motor => "motor",
            Self::Compressor => "compressor",
            Self::Turbine => "turbine",
            Self::HeatExchanger => "heat_exchanger",
        }
    }

    /// Deduce el tipo a partir del prefijo del identificador.
    /// `heat_exchanger` se comprueba antes que cualquier prefijo más corto.
    pub fn infer_from_id(equipment_id: &str) -> Option<Self> {
        let mut candidates = Self::ALL;
        candidates.sort_by_key(|t| std::cmp::Reverse(t.as_str().len()));
        candidates
            .into_iter()
            .find(|t| t.matches_id(equipment_id))
    }

    /// `true` si `equipment_id` es `<tipo>` o `<tipo>_<sufijo>`.
    pub fn matches_id(&self, equipment_id: &str) -> bool {
        match equipment_id.strip_prefix(self.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('_'),
            None => false,
        }
    }
}

impl fmt::Display for EquipmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EquipmentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("tipo de equipo desconocido: '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INFO" => Ok(Self::Info),
            "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            _ => Err(format!("severidad desconocida: '{s}'")),
        }
    }
}

/// Un evento de mantenimiento. Inmutable una vez creado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub equipment_id: String,
    pub equipment_type: EquipmentType,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
}

impl LogRecord {
    /// Comprueba los invariantes que el tipo no puede garantizar por sí solo.
    pub fn validate(&self) -> Result<(), String> {
        if self.equipment_id.trim().is_empty() {
            return Err("equipment_id vacío".to_string());
        }
        if self.message.trim().is_empty() {
            return Err("message vacío".to_string());
        }
        if !self.equipment_type.matches_id(&self.equipment_id) {
            return Err(format!(
                "equipment_id '{}' no corresponde al tipo '{}'",
                self.equipment_id, self.equipment_type
            ));
        }
        Ok(())
    }

    /// Texto indexado: id, tipo, severidad y mensaje separados por un espacio.
    pub fn searchable_text(&self) -> String {
        format!(
            "{} {} {} {}",
            self.equipment_id, self.equipment_type, self.severity, self.message
        )
    }
}

/// Acepta RFC 3339 o ISO-8601 sin zona (interpretado como UTC).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("timestamp no válido: '{raw}'"))
}

/// Entrada del índice vectorial derivada de un `LogRecord`.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub id: String,
    /// Orden de inserción dentro de la generación; desempata puntuaciones.
    pub seq: u64,
    pub embedding: Vec<f64>,
    pub searchable_text: String,
    pub metadata: LogRecord,
}

/// Respuesta de un ciclo de recuperación + insight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query: String,
    pub insight: String,
    pub relevant_logs: Vec<LogRecord>,
    pub timestamp: DateTime<Utc>,
}
