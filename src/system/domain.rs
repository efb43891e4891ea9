//! Módulo de configuración central y gestión del entorno de ejecución.
//!
//! Fuente única de verdad para la identidad del dispositivo y los límites de
//! recursos. Lee variables de entorno, aplica valores por defecto seguros y
//! configura el subsistema de logs.
//!
//! # Funcionalidades Principales
//! * **Carga de Configuración:** Lee de `.env` en desarrollo y variables de sistema en producción.
//! * **Observabilidad:** Configura `tracing_subscriber` para logs estructurados o legibles.


use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use crate::config::queue;
use crate::fota::domain::Version;


#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("la variable {name} tiene un valor inválido: {value}")]
    Invalid { name: &'static str, value: String },
}


/// Configuración global del sistema y estado del entorno.
#[derive(Debug, Clone)]
pub struct System {
    /// Número de serie del dispositivo. Se compara contra el `aud` de los comandos SRF.
    pub serial_number: String,

    /// Identificador de marca usado en los tópicos MQTT.
    pub brand_id: String,

    /// Directorio donde se persisten el shadow y el registro de FOTA.
    pub data_dir: PathBuf,

    /// Bytes de payload admitidos por la cola de salida.
    pub queue_capacity_bytes: usize,

    /// Tamaño máximo de un mensaje individual.
    pub max_message_bytes: usize,

    /// Versión del firmware de la aplicación en ejecución.
    pub app_version: Version,

    /// Entorno de ejecución actual (`development`, `staging`, `production`).
    pub environment: String,

    /// Nivel de detalle de los logs. Se autoconfigura según el `environment`.
    pub rust_log: String,
}


impl System {

    /// Carga la configuración desde las variables de entorno.
    ///
    /// # Comportamiento
    /// * Si `ENVIRONMENT` es "development", intenta cargar un archivo `.env`.
    /// * Variables ausentes toman su valor por defecto.
    ///
    /// # Errores
    /// * `ConfigError::Invalid` si una variable numérica o de versión no se puede interpretar.
    pub fn new() -> Result<Self, ConfigError> {

        info!("Info: creando objeto system");

        let environment = env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "development".into());

        if environment == "development" {
            dotenv::dotenv().ok();
        }

        let app_version = env::var("APP_VERSION").unwrap_or_else(|_| "1.0.0".to_string());
        let app_version = Version::from_str(&app_version)
            .map_err(|_| ConfigError::Invalid { name: "APP_VERSION", value: app_version.clone() })?;

        Ok(System {
            serial_number: env::var("DEVICE_SERIAL")
                .unwrap_or_else(|_| "C0000001".to_string()),

            brand_id: env::var("MQTT_BRAND_ID")
                .unwrap_or_else(|_| "1".to_string()),

            data_dir: PathBuf::from(env::var("DATA_DIR")
                .unwrap_or_else(|_| "./data".to_string())),

            queue_capacity_bytes: parse_var("QUEUE_CAPACITY_BYTES", queue::CAPACITY_BYTES)?,

            max_message_bytes: parse_var("MAX_MESSAGE_BYTES", queue::MAX_MESSAGE_BYTES)?,

            app_version,

            rust_log: env::var("RUST_LOG")
                .unwrap_or_else(|_| {
                    match environment.as_str() {
                        "development" => "debug".to_string(),
                        "staging" => "info".to_string(),
                        _ => "warn".to_string(),
                    }
                }),

            environment,
        })
    }

    /// Identificador de máquina que viaja en cada mensaje (`{brand}_{serial}`).
    pub fn machine_id(&self) -> String {
        format!("{}_{}", self.brand_id, self.serial_number)
    }
}


fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}


/// Inicializa el sistema de trazabilidad y logs (Tracing).
///
/// * **Production**: Salida JSON.
/// * **Development/Otros**: Salida "Pretty".
pub fn init_tracing(system: &System) {

    let filter = EnvFilter::try_new(&system.rust_log)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = fmt().with_env_filter(filter).with_target(false);

    if system.environment == "production" {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}


#[cfg(test)]
impl System {
    /// Configuración fija para pruebas.
    pub fn for_tests() -> Self {
        System {
            serial_number: "C0001234".to_string(),
            brand_id: "7".to_string(),
            data_dir: PathBuf::from("."),
            queue_capacity_bytes: queue::CAPACITY_BYTES,
            max_message_bytes: queue::MAX_MESSAGE_BYTES,
            app_version: Version::new(2, 4, 1),
            environment: "test".to_string(),
            rust_log: "debug".to_string(),
        }
    }
}
