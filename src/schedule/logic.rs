//! Planificador adaptativo: trabajo S, drenado Q, modo FMD y variables.


use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use crate::config::transport;
use crate::manager::domain::CommManager;
use crate::radio::domain::{scan_wanted, RadioKind, SwitchUrgency};
use crate::timer::domain::TimerKind;
use super::domain::{effective_periods, FmdExit, FmdState, ScheduleMode, ScheduleVars, VarsError};


/// Resultado de pedir el modo FMD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmdStart {
    Started,
    AlreadyActive,
    /// El collar ya está en una zona segura; se reporta y no se activa.
    InSafeZone,
}


impl CommManager {

    pub(crate) fn recalculate_periods(&mut self) {
        let periods = effective_periods(
            &self.shadow.vars,
            self.schedule.mode,
            self.active_radio(),
            self.link.ever_connected,
            self.link.fast_reconnect(),
        );
        if periods != self.schedule.periods {
            debug!("Debug: S_eff = {} s, T_eff = {}", periods.s_secs, periods.t_scans);
        }
        self.schedule.apply_periods(periods);
    }

    /// Recalcula S/T y rearma el temporizador S con `min(restante, S_eff)`.
    pub fn reset_scan_timer(&mut self) {
        let remaining = self.timers.remaining(TimerKind::Scan, self.now_ms());
        self.recalculate_periods();
        let s_eff = Duration::from_secs(u64::from(self.schedule.periods.s_secs));
        let next = if remaining.is_zero() { s_eff } else { remaining.min(s_eff) };
        self.arm(TimerKind::Scan, next);
    }

    #[instrument(name = "scan_work", skip(self))]
    pub fn on_scan_timer(&mut self) {
        self.scan_work();
        self.reset_scan_timer();
    }

    fn scan_work(&mut self) {
        if !self.schedule.scan_work_enabled {
            debug!("Debug: trabajo S deshabilitado");
            return;
        }
        if self.ctx.radio.is_switching() {
            debug!("Debug: trabajo S omitido, cambio de radio en curso");
            return;
        }
        if self.fota.cycle_active || self.fota.any_started() {
            debug!("Debug: trabajo S omitido, FOTA en curso");
            return;
        }

        let active = self.active_radio();
        let facts = self.ctx.wifi.facts();
        let want_scan = scan_wanted(active, &facts);
        let mut prepared = false;

        if !self.ctx.radio.is_wifi_connecting() {
            if want_scan && self.ctx.radio.is_wifi_enabled() {
                if !self.ctx.radio.prepare_for_use(RadioKind::Wifi, false, transport::PREPARE_TIMEOUT) {
                    warn!("Warning: no se pudo preparar WiFi para escanear");
                    return;
                }
                prepared = true;
                let max_age = Duration::from_secs(u64::from(self.schedule.periods.s_secs));
                match self.ctx.wifi.refresh_ssid_list(max_age, transport::SCAN_TIMEOUT) {
                    Ok(list) => self.link.last_scan = list,
                    Err(e) => {
                        warn!("Warning: escaneo de SSIDs fallido: {}", e);
                        self.ctx.radio.done_with(RadioKind::Wifi);
                        return;
                    }
                }
                if active == RadioKind::Wifi {
                    self.verify_wifi_link();
                } else {
                    self.reconnect_from_scan(&facts);
                }
            }

            if active == RadioKind::Wifi {
                if !prepared {
                    prepared = self.ctx.radio.prepare_for_use(RadioKind::Wifi, false, transport::PREPARE_TIMEOUT);
                }
                if prepared {
                    if let Err(e) = self.ctx.wifi.refresh_rssi(transport::RSSI_TIMEOUT) {
                        debug!("Debug: no se pudo actualizar RSSI: {}", e);
                    }
                }
            }
        }

        if active == RadioKind::None {
            self.request_switch(RadioKind::Cellular, false, SwitchUrgency::Opportunistic);
        }

        self.schedule.scan_count += 1;
        if self.schedule.scan_count >= self.schedule.periods.t_scans {
            if self.schedule.fmd_active() {
                let result = self.queue_locate(None);
                self.log_produce("telemetría FMD", result);
                if self.schedule.fmd_expired(self.now_ms()) {
                    self.disable_fmd(FmdExit::Timeout);
                }
            } else {
                let result = self.queue_telemetry(want_scan);
                self.log_produce("telemetría", result);
            }
            self.schedule.scan_count = 0;
        }

        if prepared {
            self.ctx.radio.done_with(RadioKind::Wifi);
        }
        if self.ctx.radio.is_active_mqtt_connected() {
            self.drain_queue();
        }
    }

    pub fn on_queue_timer(&mut self) {
        self.drain_queue();
        self.arm(TimerKind::QueueDrain, Duration::from_secs(u64::from(self.shadow.vars.q)));
    }

    /// Activa el modo "find my dog" por `max_minutes` (0 = sin límite).
    pub fn enable_fmd(&mut self, max_minutes: u32) -> FmdStart {
        if self.schedule.fmd_active() {
            return FmdStart::AlreadyActive;
        }
        if self.ctx.wifi.facts().in_safe_zone() {
            info!("Info: FMD rechazado, el collar está en zona segura");
            self.schedule.fmd.last_exit = FmdExit::Safe;
            let result = self.queue_locate(None);
            self.log_produce("telemetría FMD", result);
            return FmdStart::InSafeZone;
        }

        info!("Info: modo FMD activado por {} minutos", max_minutes);
        self.schedule.mode = ScheduleMode::FindMyDog;
        self.schedule.fmd = FmdState { started_ms: self.now_ms(), max_minutes, last_exit: FmdExit::Active };
        self.schedule.scan_count = 0;
        self.reset_scan_timer();
        if let Err(e) = self.ctx.modem.power_on() {
            warn!("Warning: no se pudo encender el módem: {}", e);
        }
        if let Err(e) = self.ctx.modem.enable_gps(self.shadow.vars.s_fmd) {
            warn!("Warning: no se pudo habilitar el GPS: {}", e);
        }
        FmdStart::Started
    }

    /// Sale del modo FMD dejando una última telemetría con el motivo.
    pub fn disable_fmd(&mut self, reason: FmdExit) -> bool {
        if !self.schedule.fmd_active() {
            return false;
        }
        info!("Info: modo FMD desactivado ({:?})", reason);
        self.schedule.mode = ScheduleMode::Normal;
        self.schedule.fmd.last_exit = reason;
        let result = self.queue_locate(None);
        self.log_produce("telemetría FMD final", result);
        self.reset_scan_timer();
        if self.shadow.gps_poll_secs == 0 {
            if let Err(e) = self.ctx.modem.disable_gps() {
                warn!("Warning: no se pudo deshabilitar el GPS: {}", e);
            }
        }
        true
    }

    /// Cambia las variables de planificación; `0` deja el valor actual.
    pub fn set_vars(&mut self, update: ScheduleVars, save: bool) -> Result<(), VarsError> {
        let old = self.shadow.vars;
        let merged = old.merged(&update)?;
        self.shadow.vars = merged;
        if save {
            self.persist_shadow();
        }
        if merged.s_norm != old.s_norm || merged.s_fmd != old.s_fmd || merged.rec != old.rec {
            self.reset_scan_timer();
        } else {
            self.recalculate_periods();
        }
        if merged.q != old.q {
            self.arm(TimerKind::QueueDrain, Duration::from_secs(u64::from(merged.q)));
        }
        Ok(())
    }

    pub fn enable_scan_work(&mut self, enabled: bool) {
        info!("Info: trabajo S {}", if enabled { "habilitado" } else { "deshabilitado" });
        self.schedule.scan_work_enabled = enabled;
    }

    pub fn enable_queue_work(&mut self, enabled: bool) {
        info!("Info: trabajo de cola {}", if enabled { "habilitado" } else { "deshabilitado" });
        self.queue_work_enabled = enabled;
    }
}
