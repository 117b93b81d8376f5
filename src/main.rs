// Módulos de la aplicación
mod api;
mod app_state;
mod config;
mod data_model;
mod job_poller;
mod jobs;
mod lims;
mod models;
mod openbis_client;
mod tree_builder;

#[cfg(test)]
mod testing;

use crate::app_state::{lock, AppState};
use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().context("Error al cargar la configuración")?;

    // 3. Abrir la sesión con openBIS
    let client = openbis_client::connect_from_config(&cfg)
        .await
        .context("Error conectando a openBIS")?;

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 4. Crear estado compartido de la aplicación
    let app_state = AppState::new(cfg.clone(), Arc::new(client));
    *lock(&app_state.shutdown_sender) = Some(shutdown_tx);

    // 5. Configurar el router de la API y el servicio de ficheros estáticos
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .fallback_service(ServeDir::new("frontend"))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 6. Iniciar el servidor
    let server_addr = &cfg.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {server_addr}"))?;
    let server_url = format!("http://{}", server_addr);
    info!("🚀 Visor escuchando en {}", &server_url);

    // Abrir el frontend en el navegador por defecto
    if webbrowser::open(&server_url).is_err() {
        info!("No se pudo abrir el navegador. Por favor, accede a {} manualmente.", server_url);
    }

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .context("Error en el servidor HTTP")?;

    // Los trabajos pendientes terminan como cancelados antes de salir.
    let pending = app_state.cancel_all_jobs();
    if !pending.is_empty() {
        info!("Esperando a {} trabajo(s) cancelado(s)...", pending.len());
    }
    for result in futures::future::join_all(pending).await {
        if let Err(err) = result {
            warn!("Un trabajo terminó de forma anómala: {}", err);
        }
    }

    info!("✅ Visor cerrado correctamente.");
    Ok(())
}
