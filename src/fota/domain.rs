//! Dominio del orquestador FOTA.
//!
//! Tres dispositivos con versionado independiente se actualizan estrictamente en
//! orden: módem celular → chip WiFi → MCU de aplicación. Cada uno lleva su
//! propio `DeviceUpdateState`; el ciclo completo termina cuando los tres están
//! `complete`.


use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::config::fota;
use crate::device::domain::{DeviceError, StorageError};
use crate::message::domain::MessageError;
use crate::radio::domain::RadioKind;


/// Versión `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}


#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("versión inválida: {0}")]
pub struct VersionParseError(pub String);


impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }

    pub fn from_parts(major: &str, minor: &str, patch: &str) -> Result<Self, VersionParseError> {
        let part = |s: &str| s.trim().parse::<u8>().map_err(|_| VersionParseError(format!("{major}.{minor}.{patch}")));
        Ok(Self::new(part(major)?, part(minor)?, part(patch)?))
    }
}


impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}


impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [major, minor, patch] => Self::from_parts(major, minor, patch),
            _ => Err(VersionParseError(s.to_string())),
        }
    }
}


impl TryFrom<String> for Version {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}


impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}


/// Dispositivos actualizables, en el orden en que se procesan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceKind {
    CellularModem,
    WifiChip,
    AppMcu,
}


impl DeviceKind {
    pub const ORDER: [DeviceKind; 3] = [DeviceKind::CellularModem, DeviceKind::WifiChip, DeviceKind::AppMcu];

    pub fn index(self) -> usize {
        match self {
            DeviceKind::CellularModem => 0,
            DeviceKind::WifiChip => 1,
            DeviceKind::AppMcu => 2,
        }
    }

    /// Etiqueta que aparece en el tipo y en el nombre de archivo de la imagen.
    pub fn file_tag(self) -> &'static str {
        match self {
            DeviceKind::CellularModem => "nrf9160",
            DeviceKind::WifiChip => "da16200",
            DeviceKind::AppMcu => "nrf5340",
        }
    }

    /// Radio que tiene que estar activa para actualizar este dispositivo.
    pub fn required_radio(self) -> Option<RadioKind> {
        match self {
            DeviceKind::CellularModem => None,
            DeviceKind::WifiChip | DeviceKind::AppMcu => Some(RadioKind::Wifi),
        }
    }

    /// Periodo del paso mientras hay una actualización en curso.
    pub fn in_progress_poll(self) -> Duration {
        match self {
            DeviceKind::WifiChip => fota::STEP_IN_PROGRESS_WIFI,
            _ => fota::STEP_IN_PROGRESS,
        }
    }

    /// Espera tras el 100% antes de comparar la versión reportada.
    pub fn version_check_delay(self) -> Duration {
        match self {
            DeviceKind::CellularModem => fota::VERSION_CHECK_CELLULAR,
            _ => fota::VERSION_CHECK_WIFI,
        }
    }

    /// Código de reporte fijo para una causa de error del actualizador.
    /// Hoy los tres dispositivos comparten la tabla.
    pub fn reporting_code(self, cause: UpdateErrorCause) -> i32 {
        match cause {
            UpdateErrorCause::NoError => 0,
            UpdateErrorCause::DownloadFailed => -301,
            UpdateErrorCause::InvalidUpdate | UpdateErrorCause::TypeMismatch | UpdateErrorCause::Internal => -600,
            UpdateErrorCause::Unknown => -99,
        }
    }
}


impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_tag())
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateErrorCause {
    NoError,
    DownloadFailed,
    InvalidUpdate,
    TypeMismatch,
    Internal,
    Unknown,
}


impl UpdateErrorCause {
    pub fn from_detail(detail: i32) -> Self {
        match detail {
            0 => UpdateErrorCause::NoError,
            1 => UpdateErrorCause::DownloadFailed,
            2 => UpdateErrorCause::InvalidUpdate,
            3 => UpdateErrorCause::TypeMismatch,
            4 => UpdateErrorCause::Internal,
            _ => UpdateErrorCause::Unknown,
        }
    }
}


/// Notificación de progreso o terminal del actualizador.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FotaStatus {
    /// `state=1`.
    Downloading { percent: u8 },
    /// `state=2`.
    Failed(UpdateErrorCause),
    /// `state=3`. Sólo tras una verificación de versión exitosa.
    Complete,
    /// `state=99`.
    Cancelled,
}


impl FotaStatus {
    pub fn from_raw(state: i32, detail: i32) -> Option<Self> {
        match state {
            1 => Some(FotaStatus::Downloading { percent: detail.clamp(0, 100) as u8 }),
            2 => Some(FotaStatus::Failed(UpdateErrorCause::from_detail(detail))),
            3 => Some(FotaStatus::Complete),
            99 => Some(FotaStatus::Cancelled),
            _ => None,
        }
    }
}


/// Etapas del mensaje de ciclo de vida FOTA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    Validation,
    Download,
    AssetVerification,
    Done,
    Execute,
}


impl LifecycleStage {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleStage::Validation => "VALIDATION",
            LifecycleStage::Download => "DOWNLOAD",
            LifecycleStage::AssetVerification => "ASSET_VERIFICATION",
            LifecycleStage::Done => "DONE",
            LifecycleStage::Execute => "EXECUTE",
        }
    }
}


/// Cómo terminó un dispositivo dentro del ciclo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOutcome {
    UpToDate,
    Updated,
    Failed(UpdateErrorCause),
    Cancelled,
    TimedOut,
    /// La respuesta traía una imagen para otro dispositivo.
    NotOffered,
    /// No se pudo intentar (radio equivocada, versión desconocida).
    Skipped,
}


#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdateState {
    pub request_id: String,
    pub target: Option<Version>,
    pub requested: bool,
    pub response_received: bool,
    pub in_progress: bool,
    pub complete: bool,
    pub last_state_change_ms: u64,
    /// Primer intento de encolar el pedido de versión.
    pub check_attempt_ms: Option<u64>,
    pub outcome: Option<DeviceOutcome>,
}


impl DeviceUpdateState {
    pub fn finish(&mut self, outcome: DeviceOutcome) {
        self.complete = true;
        self.in_progress = false;
        self.outcome = Some(outcome);
    }
}


/// Qué debe hacer el siguiente paso del ciclo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    RequestCheck(DeviceKind),
    Expire(DeviceKind),
    Wait(Duration),
    Finished,
}


#[derive(Debug, Default)]
pub struct FotaOrchestrator {
    devices: [DeviceUpdateState; 3],
    started: [bool; 3],
    pub cycle_active: bool,
    pub last_download_bytes: usize,
    pub check_counter: u32,
}


impl FotaOrchestrator {
    pub fn device(&self, kind: DeviceKind) -> &DeviceUpdateState {
        &self.devices[kind.index()]
    }

    pub fn device_mut(&mut self, kind: DeviceKind) -> &mut DeviceUpdateState {
        &mut self.devices[kind.index()]
    }

    pub fn reset_devices(&mut self) {
        self.devices = Default::default();
        self.last_download_bytes = 0;
    }

    pub fn all_complete(&self) -> bool {
        self.devices.iter().all(|d| d.complete)
    }

    /// Primer dispositivo pedido que todavía no recibió respuesta.
    pub fn awaiting_response(&self) -> Option<DeviceKind> {
        DeviceKind::ORDER.into_iter().find(|k| {
            let d = self.device(*k);
            d.requested && !d.response_received && !d.complete
        })
    }

    pub fn in_progress_device(&self) -> Option<DeviceKind> {
        DeviceKind::ORDER.into_iter().find(|k| self.device(*k).in_progress)
    }

    pub fn set_started(&mut self, kind: DeviceKind, started: bool) {
        self.started[kind.index()] = started;
    }

    pub fn is_started(&self, kind: DeviceKind) -> bool {
        self.started[kind.index()]
    }

    /// Algún dispositivo tiene una actualización iniciada.
    pub fn any_started(&self) -> bool {
        self.started.iter().any(|s| *s)
    }

    /// Decide el paso siguiente recorriendo los dispositivos en orden.
    pub fn next_step(&self, now_ms: u64) -> StepAction {
        for kind in DeviceKind::ORDER {
            let d = self.device(kind);
            if d.complete {
                continue;
            }
            let max_ms = fota::STATE_MAX_TIME.as_millis() as u64;
            if !d.requested {
                return match d.check_attempt_ms {
                    Some(since) if now_ms.saturating_sub(since) >= max_ms => StepAction::Expire(kind),
                    _ => StepAction::RequestCheck(kind),
                };
            }
            if now_ms.saturating_sub(d.last_state_change_ms) >= max_ms {
                return StepAction::Expire(kind);
            }
            if d.response_received && d.in_progress {
                return StepAction::Wait(kind.in_progress_poll());
            }
            return StepAction::Wait(fota::STEP_IDLE);
        }
        StepAction::Finished
    }
}


/// Cuerpo de la respuesta FOTA de la nube.
#[derive(Debug, Deserialize)]
pub struct FotaResponse {
    #[serde(rename = "STR")]
    pub status: String,
    #[serde(rename = "RID", default)]
    pub request_id: Option<String>,
    #[serde(rename = "AL", default)]
    pub list: Option<Vec<FotaListEntry>>,
}


#[derive(Debug, Deserialize)]
pub struct FotaListEntry {
    #[serde(rename = "DT")]
    pub device_type: String,
    #[serde(rename = "MTD")]
    pub metadata: Option<FotaMetadata>,
    #[serde(rename = "CH", default)]
    pub urls: Vec<String>,
}


#[derive(Debug, Deserialize)]
pub struct FotaMetadata {
    pub major: String,
    pub minor: String,
    pub build: String,
    #[serde(default)]
    pub alturl: Option<String>,
}


impl FotaListEntry {
    /// `alturl` tiene prioridad sobre la primera URL del canal.
    pub fn download_url(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.alturl.as_deref())
            .filter(|u| !u.is_empty())
            .or_else(|| self.urls.first().map(String::as_str))
    }

    pub fn version(&self) -> Result<Version, FotaError> {
        let m = self.metadata.as_ref().ok_or_else(|| FotaError::Malformed("MTD ausente".to_string()))?;
        Version::from_parts(&m.major, &m.minor, &m.build).map_err(|e| FotaError::Malformed(e.to_string()))
    }

    /// Dispositivo al que apunta la entrada: la etiqueta tiene que estar en el tipo y en la URL.
    pub fn target_device(&self) -> Option<DeviceKind> {
        let url = self.download_url()?;
        DeviceKind::ORDER
            .into_iter()
            .find(|k| self.device_type.contains(k.file_tag()) && url.contains(k.file_tag()))
    }
}


/// Registro persistido antes de aplicar la imagen de la MCU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgressRecord {
    pub request_id: String,
    pub target: Version,
}


#[derive(Debug, Error)]
pub enum FotaError {
    #[error("la nube respondió con estado {0}")]
    Rejected(String),
    #[error("respuesta FOTA mal formada: {0}")]
    Malformed(String),
    #[error("ya hay un ciclo FOTA en curso")]
    CycleActive,
    #[error("no hay un pedido de versión pendiente")]
    NoPendingRequest,
    #[error("la entrada para {0} no tiene URL")]
    MissingUrl(DeviceKind),
    #[error("{0} requiere otra radio activa")]
    RadioUnavailable(DeviceKind),
    #[error("versión actual de {0} desconocida")]
    VersionUnknown(DeviceKind),
    #[error("{0} no tiene una actualización en curso")]
    NotInProgress(DeviceKind),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
