//! Carga y gestión de configuración de la aplicación (openBIS + visor).

use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

/// Credenciales para abrir una sesión en openBIS.
#[derive(Clone, Debug)]
pub enum Credentials {
    /// Usuario y contraseña: se hace login al arrancar.
    Login { user: String, password: String },
    /// Token de sesión ya emitido (p. ej. por el contexto de la webapp).
    SessionToken(String),
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub openbis_url: Url,
    pub credentials: Credentials,
    pub server_addr: String,

    pub data_store_server_id: String,
    pub enable_export_to_user_folder: bool,
    /// Intervalo fijo entre consultas a un servicio de larga duración.
    pub poll_interval: Duration,
    pub experiment_latest_version: u32,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env`, pero con una fuente de variables arbitraria.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_url = lookup("OPENBIS_URL").ok_or_else(|| anyhow!("Falta OPENBIS_URL en el entorno"))?;
        let openbis_url =
            Url::parse(&raw_url).with_context(|| format!("OPENBIS_URL no es una URL válida: {raw_url}"))?;

        let credentials = match lookup("OPENBIS_SESSION_TOKEN").filter(|t| !t.is_empty()) {
            Some(token) => Credentials::SessionToken(token),
            None => {
                let user = lookup("OPENBIS_USER")
                    .ok_or_else(|| anyhow!("Falta OPENBIS_USER (u OPENBIS_SESSION_TOKEN) en el entorno"))?;
                let password = lookup("OPENBIS_PASSWORD")
                    .ok_or_else(|| anyhow!("Falta OPENBIS_PASSWORD en el entorno"))?;
                Credentials::Login { user, password }
            }
        };

        let server_addr = lookup("SERVER_ADDR").unwrap_or_else(|| "127.0.0.1:3322".to_string());
        let data_store_server_id = lookup("DATA_STORE_SERVER_ID").unwrap_or_else(|| "DSS1".to_string());

        let enable_export_to_user_folder = match lookup("ENABLE_EXPORT_TO_USER_FOLDER") {
            Some(v) => parse_bool(&v)
                .ok_or_else(|| anyhow!("ENABLE_EXPORT_TO_USER_FOLDER no es un booleano: {v}"))?,
            None => false,
        };

        let poll_ms: u64 = match lookup("QUERY_PLUGIN_STATUS_INTERVAL") {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("QUERY_PLUGIN_STATUS_INTERVAL no es un entero: {v}"))?,
            None => 4000,
        };

        let experiment_latest_version = match lookup("EXPERIMENT_LATEST_VERSION") {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("EXPERIMENT_LATEST_VERSION no es un entero: {v}"))?,
            None => 2,
        };

        Ok(Self {
            openbis_url,
            credentials,
            server_addr,
            data_store_server_id,
            enable_export_to_user_folder,
            poll_interval: Duration::from_millis(poll_ms),
            experiment_latest_version,
        })
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
