// Módulos de la aplicación
mod api;
mod app_state;
mod config;
mod embeddings;
mod error;
mod generator;
mod ingest;
mod insight;
mod models;
mod neo4j_client;
mod rag;
mod vector_store;

use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::Router;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::generator::OutputFormat;

#[derive(Parser)]
#[command(name = "industrial-log-insight", version, about = "Insights RAG sobre logs de mantenimiento industrial")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Arranca la API HTTP y la consola web (por defecto).
    Serve,
    /// Genera un dataset sintético de logs.
    Generate {
        #[arg(long, default_value_t = 4000)]
        count: usize,
        /// Ruta de salida; la extensión se ajusta al formato.
        #[arg(long, default_value = "data/industrial_logs.csv")]
        output: PathBuf,
        #[arg(long, value_enum, default_value_t = OutputFormat::Both)]
        format: OutputFormat,
        /// Semilla para una salida reproducible.
        #[arg(long)]
        seed: Option<u64>,
        /// Fin de la ventana de 30 días (RFC 3339).
        #[arg(long, value_parser = parse_end)]
        end: Option<DateTime<Utc>>,
    },
    /// Indexa `LOG_DATA_PATHS` y responde una consulta sin levantar el servidor.
    Query {
        text: String,
        #[arg(long)]
        top_k: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Generate {
            count,
            output,
            format,
            seed,
            end,
        } => generate(count, &output, format, seed, end),
        Command::Query { text, top_k } => query_once(&text, top_k).await,
    }
}

fn parse_end(raw: &str) -> Result<DateTime<Utc>, String> {
    models::parse_timestamp(raw)
}

fn generate(
    count: usize,
    output: &std::path::Path,
    format: OutputFormat,
    seed: Option<u64>,
    end: Option<DateTime<Utc>>,
) -> Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("No se pudo crear el directorio {}", parent.display()))?;
    }

    let logs = generator::generate_dataset(count, seed, end);
    if matches!(format, OutputFormat::Csv | OutputFormat::Both) {
        let path = output.with_extension("csv");
        generator::write_csv(&logs, &path)?;
        info!("{} logs escritos en {}", logs.len(), path.display());
    }
    if matches!(format, OutputFormat::Jsonl | OutputFormat::Both) {
        let path = output.with_extension("jsonl");
        generator::write_jsonl(&logs, &path)?;
        info!("{} logs escritos en {}", logs.len(), path.display());
    }
    Ok(())
}

async fn query_once(text: &str, top_k: Option<usize>) -> Result<()> {
    let cfg = config::AppConfig::from_env().context("Error al cargar la configuración")?;
    let state = AppState::from_config(cfg).await?;
    state
        .service
        .rebuild_from_paths(&state.config.log_data_paths)
        .await?;

    let result = state.service.handle_query(text, top_k).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn serve() -> Result<()> {
    // 2. Cargar configuración y conectar colaboradores
    let cfg = config::AppConfig::from_env().context("Error al cargar la configuración")?;
    let app_state = AppState::from_config(cfg).await?;

    // 3. Construcción inicial del índice en segundo plano; hasta que termine
    //    las consultas responden 503.
    let reservation = app_state.service.reserve_build()?;
    let build_state = app_state.clone();
    tokio::spawn(async move {
        if let Err(err) = build_state
            .service
            .rebuild_reserved(reservation, build_state.config.log_data_paths.clone())
            .await
        {
            error!("Error en la indexación inicial: {err}");
        }
    });

    // 4. Router de la API + consola estática
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .fallback_service(ServeDir::new(&app_state.config.frontend_dir))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 5. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {server_addr}"))?;
    let server_url = format!("http://{}", server_addr);
    info!("🚀 Servidor escuchando en {}", &server_url);

    if app_state.config.open_browser && webbrowser::open(&server_url).is_err() {
        info!("No se pudo abrir el navegador. Por favor, accede a {} manualmente.", server_url);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
