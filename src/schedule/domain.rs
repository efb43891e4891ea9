//! Dominio del planificador adaptativo.
//!
//! *S* son los segundos entre escaneos de SSID / chequeos de reconexión y *T*
//! la cantidad de periodos *S* entre telemetrías. Ambos tienen variante normal
//! y FMD. Cuando el *S* efectivo difiere del configurado, *T* se reescala para
//! conservar la cadencia de telemetría en segundos.


use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::config::schedule as limits;
use crate::radio::domain::RadioKind;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleMode {
    #[default]
    Normal,
    FindMyDog,
}


/// Motivo por el que terminó (o no está activo) el modo FMD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FmdExit {
    Active,
    Timeout,
    Battery,
    Safe,
    CloudRequest,
    #[default]
    NotActive,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VarsError {
    #[error("{name} = {value} fuera de rango [{min}, {max}]")]
    OutOfRange { name: &'static str, value: u32, min: u32, max: u32 },
}


/// Variables de planificación persistidas en el shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleVars {
    #[serde(rename = "S_Norm")]
    pub s_norm: u32,
    #[serde(rename = "S_FMD")]
    pub s_fmd: u32,
    #[serde(rename = "T_Norm")]
    pub t_norm: u32,
    #[serde(rename = "T_FMD")]
    pub t_fmd: u32,
    #[serde(rename = "Rec")]
    pub rec: u32,
    #[serde(rename = "Q")]
    pub q: u32,
}


impl Default for ScheduleVars {
    fn default() -> Self {
        Self { s_norm: 300, s_fmd: 30, t_norm: 12, t_fmd: 2, rec: 600, q: 60 }
    }
}


impl ScheduleVars {
    pub fn s_mode(&self, mode: ScheduleMode) -> u32 {
        match mode {
            ScheduleMode::Normal => self.s_norm,
            ScheduleMode::FindMyDog => self.s_fmd,
        }
    }

    pub fn t_mode(&self, mode: ScheduleMode) -> u32 {
        match mode {
            ScheduleMode::Normal => self.t_norm,
            ScheduleMode::FindMyDog => self.t_fmd,
        }
    }

    /// Combina una actualización donde `0` significa "sin cambio" y valida el resultado.
    pub fn merged(&self, update: &ScheduleVars) -> Result<ScheduleVars, VarsError> {
        let pick = |new: u32, old: u32| if new == 0 { old } else { new };
        let merged = ScheduleVars {
            s_norm: pick(update.s_norm, self.s_norm),
            s_fmd: pick(update.s_fmd, self.s_fmd),
            t_norm: pick(update.t_norm, self.t_norm),
            t_fmd: pick(update.t_fmd, self.t_fmd),
            rec: pick(update.rec, self.rec),
            q: pick(update.q, self.q),
        };
        merged.validate()?;
        Ok(merged)
    }

    pub fn validate(&self) -> Result<(), VarsError> {
        check("S_Norm", self.s_norm, limits::S_MIN, limits::S_MAX)?;
        check("S_FMD", self.s_fmd, limits::S_MIN, limits::S_MAX)?;
        check("T_Norm", self.t_norm, limits::T_MIN, limits::T_MAX)?;
        check("T_FMD", self.t_fmd, limits::T_MIN, limits::T_MAX)?;
        check("Rec", self.rec, limits::REC_MIN, limits::REC_MAX)?;
        check("Q", self.q, limits::Q_MIN, limits::Q_MAX)
    }
}


fn check(name: &'static str, value: u32, min: u32, max: u32) -> Result<(), VarsError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(VarsError::OutOfRange { name, value, min, max })
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectivePeriods {
    pub s_secs: u32,
    pub t_scans: u32,
}


/// Calcula `S_eff` y `T_eff`.
///
/// * WiFi activo: `S_eff = S_mode`.
/// * Celular o sin conexión: `S_eff = min(Rec, S_mode)`; `Rec` baja a 10 s con
///   USB o reconexiones rápidas pendientes.
/// * Ninguna radio conectada desde el arranque: 20 s fijos.
pub fn effective_periods(
    vars: &ScheduleVars,
    mode: ScheduleMode,
    active: RadioKind,
    ever_connected: bool,
    fast_reconnect: bool,
) -> EffectivePeriods {
    let s_mode = vars.s_mode(mode).max(1);
    let rec = if fast_reconnect { limits::FAST_REC_SECS } else { vars.rec };
    let s_secs = match active {
        RadioKind::Wifi => s_mode,
        _ if !ever_connected => limits::BOOTSTRAP_S_SECS,
        _ => rec.min(s_mode),
    }
    .max(1);
    EffectivePeriods { s_secs, t_scans: rescale_t(vars.t_mode(mode), s_mode, s_secs) }
}


/// `T_eff = round(T_mode * S_mode / S_eff)`, nunca menor a 1.
pub fn rescale_t(t_mode: u32, s_mode: u32, s_eff: u32) -> u32 {
    let s_eff = u64::from(s_eff.max(1));
    let scaled = (u64::from(t_mode) * u64::from(s_mode) + s_eff / 2) / s_eff;
    scaled.clamp(1, u64::from(u32::MAX)) as u32
}


#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FmdState {
    pub started_ms: u64,
    /// `0` = sin límite.
    pub max_minutes: u32,
    pub last_exit: FmdExit,
}


#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub mode: ScheduleMode,
    pub periods: EffectivePeriods,
    pub scan_count: u32,
    pub scan_work_enabled: bool,
    pub fmd: FmdState,
}


impl Default for ScheduleState {
    fn default() -> Self {
        Self {
            mode: ScheduleMode::Normal,
            periods: EffectivePeriods { s_secs: limits::BOOTSTRAP_S_SECS, t_scans: 1 },
            scan_count: 0,
            scan_work_enabled: true,
            fmd: FmdState::default(),
        }
    }
}


impl ScheduleState {
    /// Aplica periodos nuevos y recorta el contador si quedó por encima de `T_eff`.
    pub fn apply_periods(&mut self, periods: EffectivePeriods) {
        self.periods = periods;
        if self.scan_count > periods.t_scans {
            self.scan_count = periods.t_scans;
        }
    }

    pub fn fmd_active(&self) -> bool {
        self.mode == ScheduleMode::FindMyDog
    }

    pub fn fmd_expired(&self, now_ms: u64) -> bool {
        self.fmd_active()
            && self.fmd.max_minutes > 0
            && now_ms.saturating_sub(self.fmd.started_ms) >= u64::from(self.fmd.max_minutes) * 60_000
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn vars(s_norm: u32, t_norm: u32, rec: u32) -> ScheduleVars {
        ScheduleVars { s_norm, t_norm, rec, ..ScheduleVars::default() }
    }

    #[test]
    fn cellular_rescales_to_keep_hourly_telemetry() {
        let p = effective_periods(&vars(300, 12, 60), ScheduleMode::Normal, RadioKind::Cellular, true, false);
        assert_eq!(p, EffectivePeriods { s_secs: 60, t_scans: 60 });
    }

    #[test]
    fn wifi_uses_configured_periods() {
        let p = effective_periods(&vars(300, 12, 60), ScheduleMode::Normal, RadioKind::Wifi, true, true);
        assert_eq!(p, EffectivePeriods { s_secs: 300, t_scans: 12 });
    }

    #[test]
    fn never_connected_uses_bootstrap_period() {
        let p = effective_periods(&vars(300, 12, 60), ScheduleMode::Normal, RadioKind::None, false, false);
        assert_eq!(p, EffectivePeriods { s_secs: 20, t_scans: 180 });
        let p = effective_periods(&vars(300, 12, 60), ScheduleMode::Normal, RadioKind::None, true, false);
        assert_eq!(p.s_secs, 60);
    }

    #[test]
    fn fast_reconnect_shortens_rec() {
        let p = effective_periods(&vars(300, 12, 600), ScheduleMode::Normal, RadioKind::Cellular, true, true);
        assert_eq!(p, EffectivePeriods { s_secs: 10, t_scans: 360 });
    }

    #[test]
    fn fmd_mode_uses_fmd_variant() {
        let v = ScheduleVars { s_fmd: 30, t_fmd: 2, rec: 600, ..ScheduleVars::default() };
        let p = effective_periods(&v, ScheduleMode::FindMyDog, RadioKind::Cellular, true, false);
        assert_eq!(p, EffectivePeriods { s_secs: 30, t_scans: 2 });
    }

    #[test]
    fn t_eff_rounds_to_nearest() {
        assert_eq!(rescale_t(7, 300, 120), 18);
        assert_eq!(rescale_t(7, 300, 140), 15);
        assert_eq!(rescale_t(1, 10, 600), 1);
    }

    #[test]
    fn scan_counter_is_clamped_to_new_t() {
        let mut state = ScheduleState { scan_count: 50, ..ScheduleState::default() };
        state.apply_periods(EffectivePeriods { s_secs: 300, t_scans: 12 });
        assert_eq!(state.scan_count, 12);
        state.scan_count = 3;
        state.apply_periods(EffectivePeriods { s_secs: 60, t_scans: 60 });
        assert_eq!(state.scan_count, 3);
    }

    #[test]
    fn zero_means_no_change_and_ranges_are_enforced() {
        let current = ScheduleVars::default();
        let merged = current.merged(&ScheduleVars { s_norm: 120, s_fmd: 0, t_norm: 0, t_fmd: 0, rec: 0, q: 0 }).unwrap();
        assert_eq!(merged, ScheduleVars { s_norm: 120, ..current });

        let err = current.merged(&ScheduleVars { s_norm: 0, s_fmd: 0, t_norm: 101, t_fmd: 0, rec: 0, q: 0 }).unwrap_err();
        assert_eq!(err, VarsError::OutOfRange { name: "T_Norm", value: 101, min: 1, max: 100 });
        assert!(current.merged(&ScheduleVars { s_norm: 9, s_fmd: 0, t_norm: 0, t_fmd: 0, rec: 0, q: 0 }).is_err());
    }

    #[test]
    fn fmd_expires_after_max_minutes() {
        let mut state = ScheduleState::default();
        state.mode = ScheduleMode::FindMyDog;
        state.fmd = FmdState { started_ms: 1_000, max_minutes: 2, last_exit: FmdExit::Active };
        assert!(!state.fmd_expired(120_999));
        assert!(state.fmd_expired(121_000));
        state.fmd.max_minutes = 0;
        assert!(!state.fmd_expired(u64::MAX));
    }
}
