//! Documento shadow: configuración persistida y reportada a la nube.


use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::device::domain::{DeviceError, StorageError};
use crate::fota::domain::Version;
use crate::schedule::domain::{ScheduleVars, VarsError};


pub const NUM_ZONES: usize = 5;


#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeZone {
    pub ssid: String,
    pub safe: bool,
}


#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowDocument {
    #[serde(flatten)]
    pub vars: ScheduleVars,
    #[serde(rename = "ths")]
    pub motion_threshold: u16,
    #[serde(rename = "motDet")]
    pub motion_detection: bool,
    #[serde(rename = "dur")]
    pub motion_duration: u16,
    #[serde(rename = "fotaDur")]
    pub fota_in_progress_secs: u32,
    #[serde(rename = "gpsPoll")]
    pub gps_poll_secs: u32,
    pub zones: Vec<SafeZone>,
    #[serde(rename = "mcuVer", default)]
    pub mcu_version: Version,
}


impl Default for ShadowDocument {
    fn default() -> Self {
        Self {
            vars: ScheduleVars::default(),
            motion_threshold: 40,
            motion_detection: true,
            motion_duration: 5,
            fota_in_progress_secs: 60,
            gps_poll_secs: 0,
            zones: vec![SafeZone::default(); NUM_ZONES],
            mcu_version: Version::default(),
        }
    }
}


impl ShadowDocument {
    /// Zona guardada con ese SSID.
    pub fn zone_for(&self, ssid: &str) -> Option<&SafeZone> {
        if ssid.is_empty() {
            return None;
        }
        self.zones.iter().find(|z| z.ssid == ssid)
    }

    /// Garantiza exactamente `NUM_ZONES` entradas.
    pub fn normalize(&mut self) {
        self.zones.resize(NUM_ZONES, SafeZone::default());
    }
}


/// Entrada de zona en un documento entrante; la posición en la lista es el índice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ZoneDelta {
    pub ssid: Option<String>,
    pub safe: Option<bool>,
}


/// Documento deseado que llega de la nube. Los campos ausentes no cambian.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShadowDelta {
    #[serde(rename = "S_Norm")]
    pub s_norm: Option<u32>,
    #[serde(rename = "S_FMD")]
    pub s_fmd: Option<u32>,
    #[serde(rename = "T_Norm")]
    pub t_norm: Option<u32>,
    #[serde(rename = "T_FMD")]
    pub t_fmd: Option<u32>,
    #[serde(rename = "Rec")]
    pub rec: Option<u32>,
    #[serde(rename = "Q")]
    pub q: Option<u32>,
    #[serde(rename = "ths")]
    pub motion_threshold: Option<u16>,
    #[serde(rename = "motDet")]
    pub motion_detection: Option<bool>,
    #[serde(rename = "dur")]
    pub motion_duration: Option<u16>,
    #[serde(rename = "fotaDur")]
    pub fota_in_progress_secs: Option<u32>,
    #[serde(default)]
    pub zones: Vec<ZoneDelta>,
}


impl ShadowDelta {
    /// Documento candidato: el actual con los campos presentes reemplazados.
    pub fn candidate(&self, current: &ShadowDocument) -> ShadowDocument {
        let mut doc = current.clone();
        let v = &mut doc.vars;
        v.s_norm = self.s_norm.unwrap_or(v.s_norm);
        v.s_fmd = self.s_fmd.unwrap_or(v.s_fmd);
        v.t_norm = self.t_norm.unwrap_or(v.t_norm);
        v.t_fmd = self.t_fmd.unwrap_or(v.t_fmd);
        v.rec = self.rec.unwrap_or(v.rec);
        v.q = self.q.unwrap_or(v.q);
        doc.motion_threshold = self.motion_threshold.unwrap_or(doc.motion_threshold);
        doc.motion_detection = self.motion_detection.unwrap_or(doc.motion_detection);
        doc.motion_duration = self.motion_duration.unwrap_or(doc.motion_duration);
        doc.fota_in_progress_secs = self.fota_in_progress_secs.unwrap_or(doc.fota_in_progress_secs);
        for (zone, delta) in doc.zones.iter_mut().zip(&self.zones) {
            if let Some(ssid) = &delta.ssid {
                zone.ssid = ssid.clone();
            }
            if let Some(safe) = delta.safe {
                zone.safe = safe;
            }
        }
        doc
    }
}


/// Campo del shadow afectado por una reconciliación.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowField {
    ScheduleVars,
    MotionThreshold,
    MotionDetection,
    MotionDuration,
    FotaTimer,
    Zone(usize),
}


#[derive(Debug, Default, PartialEq)]
pub struct ReconcileResult {
    pub changed: Vec<ShadowField>,
    pub rejected: Vec<ShadowField>,
    pub republished: bool,
}


#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("documento shadow mal formado: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Vars(#[from] VarsError),
    #[error("duración FOTA {0} fuera de rango")]
    FotaTimer(u32),
    #[error("no se puede renombrar la zona {0}")]
    ZoneRename(usize),
    #[error("el chip rechazó el cambio de la zona {0}: {1}")]
    ZoneDevice(usize, DeviceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
