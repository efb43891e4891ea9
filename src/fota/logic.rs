//! Orquestador FOTA.
//!
//! Un ciclo recorre módem celular, chip WiFi y MCU de aplicación, uno por vez.
//! Cada dispositivo pasa por pedido de versión, respuesta, descarga,
//! verificación y fin. El temporizador de paso revisa el avance y fuerza el fin
//! de un dispositivo que lleva 60 s sin cambios de estado.


use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use crate::config::{fota as fota_cfg, priority, storage};
use crate::manager::domain::CommManager;
use crate::message::domain::{FotaCheckBody, FotaFeedbackBody, MessageError, Topic};
use crate::radio::domain::RadioKind;
use crate::timer::domain::TimerKind;
use super::domain::{
    DeviceKind, DeviceOutcome, FotaError, FotaResponse, FotaStatus, InProgressRecord, LifecycleStage,
    StepAction, UpdateErrorCause, Version,
};


impl CommManager {

    /// Inicia un ciclo FOTA sobre los tres dispositivos.
    #[instrument(name = "fota_cycle", skip(self))]
    pub fn fota_update_all_devices(&mut self) -> Result<(), FotaError> {
        if self.fota.cycle_active {
            return Err(FotaError::CycleActive);
        }
        info!("Info: iniciando ciclo FOTA");
        self.fota.reset_devices();
        self.fota.cycle_active = true;
        self.fota.check_counter = self.fota.check_counter.wrapping_add(1);
        if let Err(e) = self.ctx.modem.power_on() {
            warn!("Warning: no se pudo encender el módem para FOTA: {}", e);
        }
        self.fota_step();
        Ok(())
    }

    /// Avanza el ciclo hasta que haya que esperar algo.
    pub fn fota_step(&mut self) {
        if !self.fota.cycle_active {
            return;
        }
        loop {
            match self.fota.next_step(self.now_ms()) {
                StepAction::Finished => {
                    self.finish_fota_cycle();
                    return;
                }
                StepAction::Expire(device) => {
                    warn!("Warning: {} sin cambios de estado en {:?}, se da por terminado", device, fota_cfg::STATE_MAX_TIME);
                    if self.fota.is_started(device) {
                        if let Err(e) = self.ctx.updater.cancel(device) {
                            warn!("Warning: no se pudo cancelar la actualización de {}: {}", device, e);
                        }
                    }
                    self.fota_device_end(device, DeviceOutcome::TimedOut);
                }
                StepAction::RequestCheck(device) => {
                    if let Err(e) = self.check_for_updates(device) {
                        warn!("Warning: pedido de versión para {} fallido: {}", device, e);
                        if !self.fota.device(device).complete {
                            self.arm(TimerKind::FotaStep, fota_cfg::STEP_IDLE);
                            return;
                        }
                    }
                }
                StepAction::Wait(after) => {
                    self.arm(TimerKind::FotaStep, after);
                    return;
                }
            }
        }
    }

    /// Encola el pedido de versión de un dispositivo.
    fn check_for_updates(&mut self, device: DeviceKind) -> Result<(), FotaError> {
        if let Some(radio) = device.required_radio() {
            if self.active_radio() != radio {
                self.fota_device_end(device, DeviceOutcome::Skipped);
                return Err(FotaError::RadioUnavailable(device));
            }
        }
        let Some(version) = self.ctx.platform.current_version(device) else {
            self.fota_device_end(device, DeviceOutcome::Skipped);
            return Err(FotaError::VersionUnknown(device));
        };

        let now = self.now_ms();
        self.fota.device_mut(device).check_attempt_ms.get_or_insert(now);
        let body = FotaCheckBody { dt: device.file_tag(), ver: version, seq: self.fota.check_counter };
        self.submit(Topic::Fota, priority::FOTA_CHECK, body)?;
        info!("Info: pedido de versión para {} (actual {})", device, version);

        let state = self.fota.device_mut(device);
        state.requested = true;
        state.last_state_change_ms = now;
        self.drain_queue();
        Ok(())
    }

    /// Respuesta de la nube al pedido de versión pendiente.
    #[instrument(name = "fota_response", skip(self, body))]
    pub fn handle_fota_response(&mut self, body: &Value) -> Result<(), FotaError> {
        let response: FotaResponse =
            serde_json::from_value(body.clone()).map_err(|e| FotaError::Malformed(e.to_string()))?;
        let device = self.fota.awaiting_response().ok_or(FotaError::NoPendingRequest)?;

        let now = self.now_ms();
        let state = self.fota.device_mut(device);
        state.response_received = true;
        state.last_state_change_ms = now;
        state.request_id = response.request_id.clone().unwrap_or_default();

        let result = self.apply_fota_response(device, response);
        self.fota_step();
        result
    }

    fn apply_fota_response(&mut self, device: DeviceKind, response: FotaResponse) -> Result<(), FotaError> {
        if response.status != "OK" {
            self.fota_device_end(device, DeviceOutcome::Failed(UpdateErrorCause::Unknown));
            return Err(FotaError::Rejected(response.status));
        }
        let list = response.list.unwrap_or_default();
        if list.is_empty() {
            info!("Info: {} está actualizado", device);
            self.fota_device_end(device, DeviceOutcome::UpToDate);
            return Ok(());
        }
        let Some(entry) = list.iter().find(|e| e.target_device() == Some(device)) else {
            info!("Info: la respuesta no trae imagen para {}", device);
            self.fota_device_end(device, DeviceOutcome::NotOffered);
            return Ok(());
        };

        let target = match entry.version() {
            Ok(v) => v,
            Err(e) => {
                self.fota_device_end(device, DeviceOutcome::Failed(UpdateErrorCause::InvalidUpdate));
                return Err(e);
            }
        };
        let Some(url) = entry.download_url().map(str::to_string) else {
            self.fota_device_end(device, DeviceOutcome::Failed(UpdateErrorCause::InvalidUpdate));
            return Err(FotaError::MissingUrl(device));
        };
        if let Some(radio) = device.required_radio() {
            if self.active_radio() != radio {
                self.fota_device_end(device, DeviceOutcome::Skipped);
                return Err(FotaError::RadioUnavailable(device));
            }
        }
        self.fota_device_start(device, &url, target)
    }

    /// Marca el dispositivo en curso y entrega la URL al actualizador.
    fn fota_device_start(&mut self, device: DeviceKind, url: &str, target: Version) -> Result<(), FotaError> {
        info!("Info: actualizando {} a {} desde {}", device, target, url);
        let now = self.now_ms();
        let state = self.fota.device_mut(device);
        state.in_progress = true;
        state.target = Some(target);
        state.last_state_change_ms = now;
        self.fota.set_started(device, true);
        self.fota.last_download_bytes = 0;

        let result = self.queue_fota_feedback(device, LifecycleStage::Validation, 0, Some(target));
        self.log_produce("feedback FOTA", result);

        if let Err(e) = self.ctx.updater.start_download(device, url, target) {
            error!("Error: el actualizador de {} rechazó la descarga: {}", device, e);
            let code = device.reporting_code(UpdateErrorCause::DownloadFailed);
            let result = self.queue_fota_feedback(device, LifecycleStage::Download, code, None);
            self.log_produce("feedback FOTA", result);
            self.fota_device_end(device, DeviceOutcome::Failed(UpdateErrorCause::DownloadFailed));
            return Err(e.into());
        }
        if device.required_radio() == Some(RadioKind::Wifi) {
            self.arm(TimerKind::FotaDownloadMonitor, fota_cfg::DOWNLOAD_MONITOR);
        }
        Ok(())
    }

    /// Cierra el dispositivo con `outcome` y libera sus temporizadores.
    fn fota_device_end(&mut self, device: DeviceKind, outcome: DeviceOutcome) {
        debug!("Debug: {} termina con {:?}", device, outcome);
        if self.fota.is_started(device) {
            self.timers.stop(TimerKind::FotaDownloadMonitor);
            self.timers.stop(TimerKind::FotaVersionCheck);
        }
        self.fota.set_started(device, false);
        self.fota.device_mut(device).finish(outcome);
    }

    fn finish_fota_cycle(&mut self) {
        info!("Info: ciclo FOTA terminado");
        self.fota.reset_devices();
        self.fota.cycle_active = false;
        self.timers.stop(TimerKind::FotaStep);
        self.timers.stop(TimerKind::FotaDownloadMonitor);
        self.timers.stop(TimerKind::FotaVersionCheck);
        if self.active_radio() != RadioKind::Cellular {
            if let Err(e) = self.ctx.modem.power_off() {
                warn!("Warning: no se pudo apagar el módem: {}", e);
            }
        }
        self.reset_scan_timer();
    }

    /// Mensaje de ciclo de vida para el dispositivo en curso.
    pub(crate) fn queue_fota_feedback(
        &mut self,
        device: DeviceKind,
        stage: LifecycleStage,
        code: i32,
        version: Option<Version>,
    ) -> Result<(), MessageError> {
        let rid = self.fota.device(device).request_id.clone();
        self.submit_feedback(device, rid, stage, code, version)
    }

    fn submit_feedback(
        &mut self,
        device: DeviceKind,
        rid: String,
        stage: LifecycleStage,
        code: i32,
        version: Option<Version>,
    ) -> Result<(), MessageError> {
        let prio = if stage == LifecycleStage::Done && code == 0 { priority::FOTA_DONE } else { priority::FOTA_FEEDBACK };
        let body = FotaFeedbackBody { dt: device.file_tag(), rid, stage: stage.as_str(), code, ver: version };
        self.submit(Topic::FotaLifecycle, prio, body)
    }

    /// Notificación del actualizador.
    ///
    /// # Argumentos
    /// * `device` - Dispositivo que reporta.
    /// * `status` - `Downloading` 0% anuncia el inicio y 100% arma la
    ///   verificación de versión; `Complete` sólo llega tras esa verificación.
    pub fn fota_status_update(&mut self, device: DeviceKind, status: FotaStatus) -> Result<(), FotaError> {
        if !self.fota.device(device).in_progress {
            return Err(FotaError::NotInProgress(device));
        }
        let now = self.now_ms();
        self.fota.device_mut(device).last_state_change_ms = now;
        let target = self.fota.device(device).target;

        match status {
            FotaStatus::Downloading { percent: 0 } => {
                info!("Info: descarga de {} iniciada", device);
                self.queue_fota_feedback(device, LifecycleStage::Download, 0, target)?;
            }
            FotaStatus::Downloading { percent: 100 } => {
                info!("Info: descarga de {} completa, verificando", device);
                self.queue_fota_feedback(device, LifecycleStage::AssetVerification, 0, target)?;
                if device != DeviceKind::AppMcu {
                    self.timers.stop(TimerKind::FotaDownloadMonitor);
                    self.arm(TimerKind::FotaVersionCheck, device.version_check_delay());
                }
            }
            FotaStatus::Downloading { percent } => {
                debug!("Debug: {} descargado {}%", device, percent);
            }
            FotaStatus::Failed(cause) => {
                error!("Error: actualización de {} fallida: {:?}", device, cause);
                if device == DeviceKind::AppMcu {
                    if let Err(e) = self.ctx.updater.discard_mcu_image() {
                        warn!("Warning: no se pudo descartar la imagen: {}", e);
                    }
                }
                let code = device.reporting_code(cause);
                let result = self.queue_fota_feedback(device, LifecycleStage::Download, code, target);
                self.log_produce("feedback FOTA", result);
                self.fota_device_end(device, DeviceOutcome::Failed(cause));
                self.fota_step();
            }
            FotaStatus::Complete => {
                self.queue_fota_feedback(device, LifecycleStage::Done, 0, target)?;
                info!("Info: {} actualizado", device);
                self.fota_device_end(device, DeviceOutcome::Updated);
                self.fota_step();
            }
            FotaStatus::Cancelled => {
                let result = self.queue_fota_feedback(device, LifecycleStage::Done, fota_cfg::CANCEL_CODE, target);
                self.log_produce("feedback FOTA", result);
                self.fota_device_end(device, DeviceOutcome::Cancelled);
                self.fota_step();
            }
        }
        Ok(())
    }

    /// Tras el reinicio del dispositivo, compara la versión reportada con la esperada.
    #[instrument(name = "fota_version_check", skip(self))]
    pub fn fota_version_check(&mut self) {
        let Some(device) = self.fota.in_progress_device() else {
            return;
        };
        let target = self.fota.device(device).target;
        let current = self.ctx.platform.current_version(device);
        if current.is_some() && current == target {
            match self.fota_status_update(device, FotaStatus::Complete) {
                Ok(()) => {}
                Err(FotaError::Message(e)) => {
                    warn!("Warning: no se pudo encolar DONE para {} ({}), se reintenta", device, e);
                    self.arm(TimerKind::FotaVersionCheck, device.version_check_delay());
                }
                Err(e) => warn!("Warning: {}", e),
            }
            return;
        }

        error!("Error: {} reporta {:?}, se esperaba {:?}", device, current, target);
        let code = device.reporting_code(UpdateErrorCause::InvalidUpdate);
        let result = self.queue_fota_feedback(device, LifecycleStage::AssetVerification, code, current);
        self.log_produce("feedback FOTA", result);
        self.fota_device_end(device, DeviceOutcome::Failed(UpdateErrorCause::InvalidUpdate));
        self.fota_step();
    }

    /// Vigila la descarga HTTP del chip WiFi: sin bytes nuevos, falla.
    pub fn fota_download_monitor(&mut self) {
        let Some(device) = self.fota.in_progress_device() else {
            return;
        };
        let bytes = self.ctx.updater.downloaded_bytes(device);
        if bytes <= self.fota.last_download_bytes {
            warn!("Warning: descarga de {} detenida en {} bytes", device, bytes);
            if let Err(e) = self.ctx.updater.cancel(device) {
                warn!("Warning: no se pudo cancelar la descarga: {}", e);
            }
            if let Err(e) = self.fota_status_update(device, FotaStatus::Failed(UpdateErrorCause::DownloadFailed)) {
                warn!("Warning: {}", e);
            }
            return;
        }
        self.fota.last_download_bytes = bytes;
        let now = self.now_ms();
        self.fota.device_mut(device).last_state_change_ms = now;
        self.arm(TimerKind::FotaDownloadMonitor, fota_cfg::DOWNLOAD_MONITOR);
    }

    /// Terminó la descarga HTTP de la imagen de la MCU.
    ///
    /// # Flujo de Trabajo
    /// 1. Una descarga fallida cierra el dispositivo con `DownloadFailed`.
    /// 2. Guarda el registro en curso (pedido + versión objetivo).
    /// 3. Encola `EXECUTE`, drena y aplica la imagen; la MCU reinicia.
    #[instrument(name = "fota_http_complete", skip(self))]
    pub fn fota_http_complete(&mut self, ok: bool) {
        let device = DeviceKind::AppMcu;
        if !self.fota.device(device).in_progress {
            debug!("Debug: descarga HTTP terminada sin actualización de la MCU en curso");
            return;
        }
        self.timers.stop(TimerKind::FotaDownloadMonitor);
        if !ok {
            if let Err(e) = self.fota_status_update(device, FotaStatus::Failed(UpdateErrorCause::DownloadFailed)) {
                warn!("Warning: {}", e);
            }
            return;
        }

        let state = self.fota.device(device);
        let Some(target) = state.target else {
            return;
        };
        let record = InProgressRecord { request_id: state.request_id.clone(), target };
        if let Err(e) = self.save_in_progress_record(&record) {
            error!("Error: no se pudo guardar el registro FOTA: {}", e);
            if let Err(e) = self.fota_status_update(device, FotaStatus::Failed(UpdateErrorCause::Internal)) {
                warn!("Warning: {}", e);
            }
            return;
        }

        let result = self.queue_fota_feedback(device, LifecycleStage::Execute, 0, Some(target));
        self.log_produce("feedback FOTA", result);
        self.drain_queue();
        info!("Info: aplicando imagen {} de la MCU", target);
        if let Err(e) = self.ctx.updater.apply_mcu_image() {
            error!("Error: no se pudo aplicar la imagen: {}", e);
            if let Err(e) = self.ctx.storage.delete(storage::FOTA_RECORD_KEY) {
                warn!("Warning: {}", e);
            }
            if let Err(e) = self.fota_status_update(device, FotaStatus::Failed(UpdateErrorCause::Internal)) {
                warn!("Warning: {}", e);
            }
        }
    }

    fn save_in_progress_record(&self, record: &InProgressRecord) -> Result<(), FotaError> {
        let bytes = serde_json::to_vec(record).map_err(|e| FotaError::Malformed(e.to_string()))?;
        self.ctx.storage.save(storage::FOTA_RECORD_KEY, &bytes)?;
        Ok(())
    }

    /// Después del arranque: si quedó un registro de actualización de la MCU,
    /// reporta el resultado y lo borra.
    #[instrument(name = "fota_in_progress_check", skip(self))]
    pub fn fota_check_in_progress_record(&mut self) {
        let bytes = match self.ctx.storage.load(storage::FOTA_RECORD_KEY) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                error!("Error: no se pudo leer el registro FOTA: {}", e);
                return;
            }
        };
        let record: InProgressRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!("Warning: registro FOTA ilegible, se descarta: {}", e);
                self.delete_in_progress_record();
                return;
            }
        };

        let device = DeviceKind::AppMcu;
        let running = self.ctx.system.app_version;
        let result = if running == record.target {
            info!("Info: MCU actualizada a {}", running);
            self.submit_feedback(device, record.request_id, LifecycleStage::Done, 0, Some(running))
        } else {
            error!("Error: la MCU corre {} pero se esperaba {}", running, record.target);
            let code = device.reporting_code(UpdateErrorCause::InvalidUpdate);
            self.submit_feedback(device, record.request_id, LifecycleStage::AssetVerification, code, Some(running))
        };

        match result {
            Ok(()) => {
                self.delete_in_progress_record();
                self.drain_queue();
            }
            Err(e) => {
                warn!("Warning: no se pudo encolar el resultado de la MCU ({}), se reintenta", e);
                let after = std::time::Duration::from_secs(u64::from(self.shadow.fota_in_progress_secs));
                self.arm(TimerKind::FotaInProgressCheck, after);
            }
        }
    }

    fn delete_in_progress_record(&self) {
        if let Err(e) = self.ctx.storage.delete(storage::FOTA_RECORD_KEY) {
            warn!("Warning: no se pudo borrar el registro FOTA: {}", e);
        }
    }

    /// Cancela la actualización en curso de un dispositivo.
    pub fn cancel_fota_download(&mut self, device: DeviceKind) -> Result<(), FotaError> {
        if !self.fota.device(device).in_progress {
            return Err(FotaError::NotInProgress(device));
        }
        self.ctx.updater.cancel(device)?;
        self.fota_status_update(device, FotaStatus::Cancelled)
    }

    /// Cancela el ciclo completo.
    pub fn cancel_fota_cycle(&mut self) {
        if !self.fota.cycle_active {
            return;
        }
        info!("Info: cancelando ciclo FOTA");
        if let Some(device) = self.fota.in_progress_device() {
            if let Err(e) = self.ctx.updater.cancel(device) {
                warn!("Warning: no se pudo cancelar {}: {}", device, e);
            }
            let target = self.fota.device(device).target;
            let result = self.queue_fota_feedback(device, LifecycleStage::Done, fota_cfg::CANCEL_CODE, target);
            self.log_produce("feedback FOTA", result);
        }
        for device in DeviceKind::ORDER {
            if !self.fota.device(device).complete {
                self.fota_device_end(device, DeviceOutcome::Cancelled);
            }
        }
        self.finish_fota_cycle();
    }

    /// Pasó media hora con USB conectado.
    pub(crate) fn on_usb_fota_timer(&mut self) {
        if !self.link.usb_powered {
            return;
        }
        match self.fota_update_all_devices() {
            Ok(()) => {}
            Err(FotaError::CycleActive) => debug!("Debug: ciclo FOTA ya en curso"),
            Err(e) => warn!("Warning: no se pudo iniciar FOTA por USB: {}", e),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use serde_json::json;
    use crate::device::domain::Storage;
    use crate::device::storage::MemoryStorage;
    use crate::manager::domain::testing::Bench;
    use crate::queue::domain::{OutboundQueue, QueueLimits};
    use super::*;

    fn on_wifi() -> Bench {
        let mut bench = Bench::new();
        bench.device.state().connect(RadioKind::Wifi);
        bench.mgr.link.onboarded = true;
        bench
    }

    fn up_to_date() -> Value {
        json!({ "STR": "OK", "RID": "r-0", "AL": [] })
    }

    fn offer(tag: &str, minor: &str) -> Value {
        json!({
            "STR": "OK",
            "RID": "r-1",
            "AL": [{
                "DT": tag,
                "MTD": { "major": "1", "minor": minor, "build": "0" },
                "CH": [format!("https://cdn.example/{tag}_1.{minor}.0.bin")]
            }]
        })
    }

    fn feedback(bench: &Bench) -> Vec<Value> {
        bench.device.state().sent.iter()
            .filter(|m| m.topic == Topic::FotaLifecycle.number().to_string())
            .map(|m| m.json()["M"].clone())
            .collect()
    }

    #[test]
    fn devices_are_checked_in_order_and_empty_lists_advance_immediately() {
        let mut bench = on_wifi();
        bench.mgr.fota_update_all_devices().unwrap();
        assert!(bench.mgr.fota.device(DeviceKind::CellularModem).requested);
        assert!(!bench.mgr.fota.device(DeviceKind::WifiChip).requested);
        assert!(matches!(bench.mgr.fota_update_all_devices(), Err(FotaError::CycleActive)));

        bench.mgr.handle_fota_response(&up_to_date()).unwrap();
        assert!(bench.mgr.fota.device(DeviceKind::CellularModem).complete);
        assert!(bench.mgr.fota.device(DeviceKind::WifiChip).requested);

        bench.mgr.handle_fota_response(&up_to_date()).unwrap();
        let wifi = bench.mgr.fota.device(DeviceKind::WifiChip);
        assert!(wifi.complete);
        assert!(!wifi.in_progress);
        assert_eq!(wifi.outcome, Some(DeviceOutcome::UpToDate));
        assert!(bench.mgr.fota.device(DeviceKind::AppMcu).requested);

        bench.mgr.handle_fota_response(&up_to_date()).unwrap();
        assert!(!bench.mgr.fota.cycle_active);
        assert!(!bench.device.state().modem_powered);
        assert!(bench.mgr.timers.is_armed(TimerKind::Scan));

        let checks: Vec<String> = bench.device.state().sent.iter()
            .filter(|m| m.topic == Topic::Fota.number().to_string())
            .map(|m| m.json()["M"]["dt"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(checks, vec!["nrf9160", "da16200", "nrf5340"]);
    }

    #[test]
    fn modem_update_runs_to_a_verified_version() {
        let mut bench = on_wifi();
        bench.mgr.fota_update_all_devices().unwrap();
        bench.mgr.handle_fota_response(&offer("nrf9160", "4")).unwrap();

        let target = Version::new(1, 4, 0);
        assert_eq!(bench.device.state().downloads[0].0, DeviceKind::CellularModem);
        assert!(bench.mgr.fota.is_started(DeviceKind::CellularModem));
        assert!(!bench.mgr.fota.device(DeviceKind::WifiChip).requested);

        bench.mgr.fota_status_update(DeviceKind::CellularModem, FotaStatus::Downloading { percent: 0 }).unwrap();
        bench.mgr.fota_status_update(DeviceKind::CellularModem, FotaStatus::Downloading { percent: 100 }).unwrap();
        assert!(bench.mgr.timers.is_armed(TimerKind::FotaVersionCheck));

        bench.device.state().versions.insert(DeviceKind::CellularModem, target);
        bench.clock.advance(fota_cfg::VERSION_CHECK_CELLULAR);
        assert!(bench.fire(TimerKind::FotaVersionCheck));

        let modem = bench.mgr.fota.device(DeviceKind::CellularModem);
        assert_eq!(modem.outcome, Some(DeviceOutcome::Updated));
        assert!(!bench.mgr.fota.any_started());
        assert!(bench.mgr.fota.device(DeviceKind::WifiChip).requested);

        let stages: Vec<String> = feedback(&bench).iter().map(|f| f["stage"].as_str().unwrap().to_string()).collect();
        assert_eq!(stages, vec!["VALIDATION", "DOWNLOAD", "ASSET_VERIFICATION", "DONE"]);
        assert_eq!(feedback(&bench)[3]["rid"], "r-1");
    }

    #[test]
    fn version_mismatch_fails_the_device_but_not_the_cycle() {
        let mut bench = on_wifi();
        bench.mgr.fota_update_all_devices().unwrap();
        bench.mgr.handle_fota_response(&offer("nrf9160", "4")).unwrap();
        bench.mgr.fota_status_update(DeviceKind::CellularModem, FotaStatus::Downloading { percent: 100 }).unwrap();
        bench.mgr.fota_version_check();

        assert_eq!(
            bench.mgr.fota.device(DeviceKind::CellularModem).outcome,
            Some(DeviceOutcome::Failed(UpdateErrorCause::InvalidUpdate))
        );
        assert!(bench.mgr.fota.device(DeviceKind::WifiChip).requested);
        assert_eq!(feedback(&bench).last().unwrap()["code"], -600);
    }

    #[test]
    fn done_is_retried_when_it_cannot_be_queued() {
        let mut bench = on_wifi();
        bench.mgr.fota_update_all_devices().unwrap();
        bench.mgr.handle_fota_response(&offer("nrf9160", "4")).unwrap();
        bench.device.state().versions.insert(DeviceKind::CellularModem, Version::new(1, 4, 0));

        // Una cola diminuta no admite el mensaje DONE.
        bench.mgr.queue = OutboundQueue::new(QueueLimits { capacity_bytes: 64, max_message_bytes: 64, max_messages: 30 });
        bench.mgr.fota_version_check();
        assert!(bench.mgr.fota.is_started(DeviceKind::CellularModem));
        assert!(bench.mgr.timers.is_armed(TimerKind::FotaVersionCheck));
    }

    #[test]
    fn silent_device_is_expired_by_the_watchdog() {
        let mut bench = on_wifi();
        bench.mgr.fota_update_all_devices().unwrap();
        bench.clock.advance(fota_cfg::STATE_MAX_TIME);
        assert!(bench.fire(TimerKind::FotaStep));

        assert_eq!(bench.mgr.fota.device(DeviceKind::CellularModem).outcome, Some(DeviceOutcome::TimedOut));
        assert!(bench.mgr.fota.device(DeviceKind::WifiChip).requested);
    }

    #[test]
    fn check_that_never_fits_in_the_queue_gives_up() {
        let mut bench = on_wifi();
        bench.mgr.queue = OutboundQueue::new(QueueLimits { capacity_bytes: 64, max_message_bytes: 64, max_messages: 30 });
        bench.mgr.fota_update_all_devices().unwrap();
        assert!(!bench.mgr.fota.device(DeviceKind::CellularModem).requested);
        assert!(bench.mgr.timers.is_armed(TimerKind::FotaStep));

        bench.clock.advance(fota_cfg::STATE_MAX_TIME);
        assert!(bench.fire(TimerKind::FotaStep));
        assert_eq!(bench.mgr.fota.device(DeviceKind::CellularModem).outcome, Some(DeviceOutcome::TimedOut));
        assert!(bench.mgr.fota.device(DeviceKind::WifiChip).check_attempt_ms.is_some());

        for _ in 0..2 {
            bench.clock.advance(fota_cfg::STATE_MAX_TIME);
            assert!(bench.fire(TimerKind::FotaStep));
        }
        assert!(!bench.mgr.fota.cycle_active);
        assert!(!bench.mgr.timers.is_armed(TimerKind::FotaStep));
    }

    #[test]
    fn updater_errors_use_the_reporting_codes() {
        let mut bench = on_wifi();
        bench.mgr.fota_update_all_devices().unwrap();
        bench.mgr.handle_fota_response(&offer("nrf9160", "4")).unwrap();
        bench.mgr.fota_status_update(DeviceKind::CellularModem, FotaStatus::Failed(UpdateErrorCause::DownloadFailed)).unwrap();

        assert_eq!(feedback(&bench).last().unwrap()["code"], -301);
        assert!(matches!(
            bench.mgr.fota_status_update(DeviceKind::CellularModem, FotaStatus::Downloading { percent: 5 }),
            Err(FotaError::NotInProgress(DeviceKind::CellularModem))
        ));
    }

    #[test]
    fn offer_for_another_device_is_not_taken() {
        let mut bench = on_wifi();
        bench.mgr.fota_update_all_devices().unwrap();
        bench.mgr.handle_fota_response(&offer("da16200", "1")).unwrap();
        assert_eq!(bench.mgr.fota.device(DeviceKind::CellularModem).outcome, Some(DeviceOutcome::NotOffered));
        assert!(bench.device.state().downloads.is_empty());
    }

    #[test]
    fn wifi_devices_are_skipped_on_cellular() {
        let mut bench = Bench::new();
        bench.device.state().connect(RadioKind::Cellular);
        bench.mgr.link.onboarded = true;
        bench.mgr.fota_update_all_devices().unwrap();
        bench.mgr.handle_fota_response(&up_to_date()).unwrap();

        assert!(!bench.mgr.fota.cycle_active);
        assert!(bench.device.state().modem_powered);
    }

    #[test]
    fn stalled_http_download_fails() {
        let mut bench = on_wifi();
        bench.mgr.fota_update_all_devices().unwrap();
        bench.mgr.handle_fota_response(&up_to_date()).unwrap();
        bench.mgr.handle_fota_response(&offer("da16200", "1")).unwrap();
        assert!(bench.mgr.timers.is_armed(TimerKind::FotaDownloadMonitor));

        bench.device.state().downloaded_bytes = 4096;
        bench.clock.advance(fota_cfg::DOWNLOAD_MONITOR);
        assert!(bench.fire(TimerKind::FotaDownloadMonitor));
        assert!(bench.mgr.fota.is_started(DeviceKind::WifiChip));

        bench.clock.advance(fota_cfg::DOWNLOAD_MONITOR);
        assert!(bench.fire(TimerKind::FotaDownloadMonitor));
        assert_eq!(
            bench.mgr.fota.device(DeviceKind::WifiChip).outcome,
            Some(DeviceOutcome::Failed(UpdateErrorCause::DownloadFailed))
        );
        assert_eq!(bench.device.state().cancels, vec![DeviceKind::WifiChip]);
        assert!(bench.mgr.fota.device(DeviceKind::AppMcu).requested);
    }

    #[test]
    fn mcu_image_is_applied_and_verified_after_reboot() {
        let store = Arc::new(MemoryStorage::new());
        let mut bench = Bench::with_storage(store.clone());
        bench.device.state().connect(RadioKind::Wifi);
        bench.mgr.link.onboarded = true;
        bench.mgr.fota_update_all_devices().unwrap();
        bench.mgr.handle_fota_response(&up_to_date()).unwrap();
        bench.mgr.handle_fota_response(&up_to_date()).unwrap();
        bench.mgr.handle_fota_response(&json!({
            "STR": "OK",
            "RID": "r-mcu",
            "AL": [{
                "DT": "nrf5340",
                "MTD": { "major": "2", "minor": "4", "build": "1", "alturl": "https://alt.example/nrf5340_2.4.1.bin" },
                "CH": []
            }]
        })).unwrap();
        assert_eq!(bench.device.state().downloads[0].1, "https://alt.example/nrf5340_2.4.1.bin");

        bench.mgr.fota_http_complete(true);
        assert!(bench.device.state().mcu_image_applied);
        assert!(store.contains(storage::FOTA_RECORD_KEY));
        assert_eq!(feedback(&bench).last().unwrap()["stage"], "EXECUTE");

        // Tras el reinicio la versión en ejecución es la esperada.
        let mut rebooted = Bench::with_storage(store.clone());
        rebooted.device.state().connect(RadioKind::Wifi);
        rebooted.mgr.link.onboarded = true;
        rebooted.mgr.fota_check_in_progress_record();
        assert!(!store.contains(storage::FOTA_RECORD_KEY));
        let done = feedback(&rebooted);
        assert_eq!(done[0]["stage"], "DONE");
        assert_eq!(done[0]["rid"], "r-mcu");
        assert_eq!(done[0]["code"], 0);
    }

    #[test]
    fn failed_http_download_discards_the_image() {
        let mut bench = on_wifi();
        bench.mgr.fota_update_all_devices().unwrap();
        bench.mgr.handle_fota_response(&up_to_date()).unwrap();
        bench.mgr.handle_fota_response(&up_to_date()).unwrap();
        bench.mgr.handle_fota_response(&offer("nrf5340", "9")).unwrap();
        bench.mgr.fota_http_complete(false);

        assert!(bench.device.state().mcu_image_discarded);
        assert!(!bench.mgr.fota.cycle_active);
        assert!(bench.storage.load(storage::FOTA_RECORD_KEY).unwrap().is_none());
    }

    #[test]
    fn cancelling_one_download_moves_to_the_next_device() {
        let mut bench = on_wifi();
        bench.mgr.fota_update_all_devices().unwrap();
        assert!(matches!(
            bench.mgr.cancel_fota_download(DeviceKind::CellularModem),
            Err(FotaError::NotInProgress(DeviceKind::CellularModem))
        ));

        bench.mgr.handle_fota_response(&offer("nrf9160", "4")).unwrap();
        bench.mgr.cancel_fota_download(DeviceKind::CellularModem).unwrap();

        assert_eq!(bench.mgr.fota.device(DeviceKind::CellularModem).outcome, Some(DeviceOutcome::Cancelled));
        assert!(bench.mgr.fota.device(DeviceKind::WifiChip).requested);
        assert!(bench.mgr.fota.cycle_active);
        let done = feedback(&bench);
        assert_eq!(done.last().unwrap()["stage"], "DONE");
        assert_eq!(done.last().unwrap()["code"], fota_cfg::CANCEL_CODE);
    }

    #[test]
    fn cancelling_the_cycle_releases_everything() {
        let mut bench = on_wifi();
        bench.mgr.fota_update_all_devices().unwrap();
        bench.mgr.handle_fota_response(&offer("nrf9160", "4")).unwrap();
        bench.mgr.cancel_fota_cycle();
        bench.mgr.drain_queue();

        assert!(!bench.mgr.fota.cycle_active);
        assert!(!bench.mgr.fota.any_started());
        assert!(!bench.mgr.timers.is_armed(TimerKind::FotaStep));
        assert_eq!(bench.device.state().cancels, vec![DeviceKind::CellularModem]);
        assert_eq!(feedback(&bench).last().unwrap()["code"], fota_cfg::CANCEL_CODE);
    }
}
