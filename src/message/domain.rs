//! Dominio de Mensajería y Modelos de Datos.
//!
//! Tópicos y cuerpos de los mensajes que el collar intercambia con la nube.
//! Todos los mensajes de salida comparten el sobre `{T, MID, TS, M}` y los de
//! entrada traen al menos `{T, M}`.


use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::fota::domain::Version;
use crate::queue::domain::QueueError;
use crate::radio::domain::RadioKind;
use crate::schedule::domain::FmdExit;


/// Tópico MQTT de un mensaje. El número viaja en el campo `T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Telemetry,
    Alert,
    Onboarding,
    Fota,
    FotaLifecycle,
    ConnTest,
    ShadowProxy,
    SrfNonce,
    SrfFunc,
    Pairing,
}


impl Topic {
    pub fn number(self) -> u8 {
        match self {
            Topic::Telemetry => 1,
            Topic::Alert => 2,
            Topic::Onboarding => 3,
            Topic::Fota => 4,
            Topic::FotaLifecycle => 5,
            Topic::ConnTest => 6,
            Topic::ShadowProxy => 7,
            Topic::SrfNonce => 8,
            Topic::SrfFunc => 9,
            Topic::Pairing => 10,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        Some(match n {
            1 => Topic::Telemetry,
            2 => Topic::Alert,
            3 => Topic::Onboarding,
            4 => Topic::Fota,
            5 => Topic::FotaLifecycle,
            6 => Topic::ConnTest,
            7 => Topic::ShadowProxy,
            8 => Topic::SrfNonce,
            9 => Topic::SrfFunc,
            10 => Topic::Pairing,
            _ => return None,
        })
    }

    /// Segmento usado en la ruta MQTT celular.
    pub fn path_segment(self) -> &'static str {
        match self {
            Topic::Telemetry => "telemetry",
            Topic::Alert => "alert",
            Topic::Onboarding => "onboarding",
            Topic::Fota => "fota",
            Topic::FotaLifecycle => "fota_lifecycle",
            Topic::ConnTest => "conn_test",
            Topic::ShadowProxy => "shadow",
            Topic::SrfNonce => "srf_nonce",
            Topic::SrfFunc => "srf_func",
            Topic::Pairing => "pairing",
        }
    }
}


#[derive(Debug, Error)]
pub enum MessageError {
    #[error("error de serialización: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tipo de mensaje desconocido: {0}")]
    UnknownTopic(u8),
    #[error(transparent)]
    Queue(#[from] QueueError),
}


#[derive(Debug, Serialize)]
pub struct Envelope<'a, B> {
    #[serde(rename = "T")]
    pub kind: u8,
    #[serde(rename = "MID")]
    pub machine_id: &'a str,
    #[serde(rename = "TS")]
    pub timestamp: i64,
    #[serde(rename = "M")]
    pub body: B,
}


/// Mensaje entrante de la nube.
#[derive(Debug, Deserialize)]
pub struct CloudMessage {
    #[serde(rename = "T")]
    pub kind: u8,
    #[serde(rename = "M", default)]
    pub body: serde_json::Value,
}


#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SsidEntry {
    pub ssid: String,
    pub rssi: i32,
}


#[derive(Debug, Serialize)]
pub struct TelemetryBody {
    pub batt: u8,
    pub usb: bool,
    pub radio: RadioKind,
    pub ap: String,
    pub safe: Option<bool>,
    pub rssi: i32,
    #[serde(rename = "wifiVer", skip_serializing_if = "Option::is_none")]
    pub wifi_version: Option<Version>,
    pub part: usize,
    pub parts: usize,
    pub ssids: Vec<SsidEntry>,
}


/// Telemetría de modo FMD y reporte "where is my dog".
#[derive(Debug, Serialize)]
pub struct LocateBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    pub fmd: bool,
    pub exit: FmdExit,
    pub batt: u8,
    pub radio: RadioKind,
    pub ap: String,
    pub safe: Option<bool>,
    pub ssids: Vec<SsidEntry>,
}


#[derive(Debug, Serialize)]
pub struct AlertBody {
    pub sub: u8,
    pub msg: String,
}


#[derive(Debug, Serialize)]
pub struct SafeZoneAlertBody {
    pub sub: u8,
    pub ssid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}


#[derive(Debug, Serialize)]
pub struct OnboardingBody {
    pub fw: Version,
}


#[derive(Debug, Serialize)]
pub struct PairingBody {
    pub nonce: String,
}


#[derive(Debug, Serialize)]
pub struct ConnectivityBody {
    pub echo: String,
}


#[derive(Debug, Serialize)]
pub struct SrfNonceBody {
    pub nonce: String,
}


#[derive(Debug, Serialize)]
pub struct SrfResponseBody {
    pub rid: String,
    pub st: &'static str,
    pub res: String,
}


#[derive(Debug, Serialize)]
pub struct FotaCheckBody {
    pub dt: &'static str,
    pub ver: Version,
    pub seq: u32,
}


#[derive(Debug, Serialize)]
pub struct FotaFeedbackBody {
    pub dt: &'static str,
    pub rid: String,
    pub stage: &'static str,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ver: Option<Version>,
}


/// Estado térmico reportado por el PMIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureStatus {
    TooCold,
    Normal,
    TooHot,
}


impl TemperatureStatus {
    pub fn alert_text(self) -> &'static str {
        match self {
            TemperatureStatus::TooCold => "Battery temperature too cold, charging suspended",
            TemperatureStatus::Normal => "Battery temperature back to normal",
            TemperatureStatus::TooHot => "Battery temperature too hot, charging suspended",
        }
    }
}


/// Sub-tipos del tópico de alertas.
pub mod alert_kind {
    pub const GENERIC: u8 = 0;
    pub const SAFE_ZONE_ENTER: u8 = 1;
    pub const SAFE_ZONE_EXIT: u8 = 2;
    pub const TEMPERATURE: u8 = 3;
    pub const SHUTDOWN: u8 = 4;
}
