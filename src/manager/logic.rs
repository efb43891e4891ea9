//! Worker del gestor de comunicaciones.
//!
//! Una única tarea consume la bandeja de `WorkItem`s y es la única que muta
//! `CommManager`. Los temporizadores, los eventos de radio y los mensajes de
//! la nube llegan todos por la misma bandeja, así que el estado nunca se
//! comparte entre tareas.
//!
//! # Arquitectura de Actores
//! 1. La tarea de temporización devuelve `WorkItem::TimerFired` al vencer.
//! 2. Los adaptadores de hardware publican eventos de radio, WiFi y energía.
//! 3. Este worker despacha cada unidad al handler correspondiente.


use std::time::Duration;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use crate::config::{schedule, transport};
use crate::fota::domain::FotaStatus;
use crate::message::domain::{alert_kind, Topic};
use crate::message::logic::parse_cloud_message;
use crate::radio::domain::RadioKind;
use crate::schedule::domain::FmdExit;
use crate::timer::domain::TimerKind;
use super::domain::{CommManager, WorkItem};


impl CommManager {

    /// Deja el gestor listo para recibir trabajo.
    ///
    /// # Flujo de Trabajo
    /// 1. Genera el primer nonce SRF y lee el flag de onboarding del chip WiFi.
    /// 2. Calcula S/T y arma los primeros disparos de escaneo y drenado.
    /// 3. Arma la verificación de un FOTA de la MCU que haya quedado a medias.
    /// 4. Empuja los ajustes de movimiento del shadow al hardware.
    pub fn start(&mut self) {
        self.srf.regenerate();
        self.link.onboarded = self.ctx.wifi.facts().onboarded;
        self.recalculate_periods();
        self.arm(TimerKind::Scan, schedule::FIRST_SCAN_DELAY);
        self.arm(TimerKind::QueueDrain, schedule::FIRST_DRAIN_DELAY);
        let in_progress = Duration::from_secs(u64::from(self.shadow.fota_in_progress_secs));
        self.arm(TimerKind::FotaInProgressCheck, in_progress);
        self.apply_motion_settings();
        info!("Info: gestor iniciado (onboarding = {})", self.link.onboarded);
    }

    /// Despacha una unidad de trabajo.
    pub fn handle(&mut self, item: WorkItem) {
        match item {
            WorkItem::TimerFired { kind, generation } => {
                if !self.timers.accept_fire(kind, generation) {
                    debug!("Debug: disparo viejo de {:?} descartado", kind);
                    return;
                }
                self.on_timer(kind);
            }
            WorkItem::CloudMessage { payload } => self.handle_cloud_message(&payload),
            WorkItem::RadioSwitched(radio) => self.on_radio_switched(radio),
            WorkItem::Wifi(event) => self.handle_wifi_event(event),
            WorkItem::Modem(status) => self.on_modem_status(status),
            WorkItem::FotaProgress { device, state, detail } => match FotaStatus::from_raw(state, detail) {
                Some(FotaStatus::Complete) => {
                    // Sólo la verificación de versión da por terminado un FOTA.
                    if self.fota.in_progress_device() == Some(device) {
                        self.fota_version_check();
                    } else {
                        warn!("Warning: {} reporta fin de FOTA sin actualización en curso", device);
                    }
                }
                Some(status) => {
                    if let Err(e) = self.fota_status_update(device, status) {
                        warn!("Warning: estado FOTA de {} ignorado: {}", device, e);
                    }
                }
                None => warn!("Warning: estado FOTA desconocido {} ({})", state, detail),
            },
            WorkItem::Battery { percent } => self.on_battery(percent),
            WorkItem::UsbPower(connected) => self.on_usb_power(connected),
            WorkItem::Temperature(status) => self.on_temperature(status),
            WorkItem::ShutdownImminent => self.on_shutdown_imminent(),
            WorkItem::PairingNonce(nonce) => {
                let result = self.queue_pairing_nonce(nonce);
                self.log_produce("nonce de emparejamiento", result);
            }
            WorkItem::SendTelemetry => {
                let result = self.queue_telemetry(true);
                self.log_produce("telemetría", result);
            }
            WorkItem::SetVars { vars, save } => {
                if let Err(e) = self.set_vars(vars, save) {
                    warn!("Warning: variables de planificación rechazadas: {}", e);
                }
            }
            WorkItem::EnableFmd { max_minutes } => {
                let outcome = self.enable_fmd(max_minutes);
                debug!("Debug: pedido de FMD: {:?}", outcome);
            }
            WorkItem::DisableFmd => {
                self.disable_fmd(FmdExit::CloudRequest);
            }
            WorkItem::CheckFota => {
                if let Err(e) = self.fota_update_all_devices() {
                    warn!("Warning: no se pudo iniciar el ciclo FOTA: {}", e);
                }
            }
            WorkItem::CancelFota => self.cancel_fota_cycle(),
            WorkItem::CancelFotaDownload(device) => {
                if let Err(e) = self.cancel_fota_download(device) {
                    warn!("Warning: no se pudo cancelar la descarga de {}: {}", device, e);
                }
            }
            WorkItem::Alert { text } => {
                let result = self.queue_alert(alert_kind::GENERIC, &text);
                self.log_produce("alerta", result);
            }
            WorkItem::EnableScanWork(enabled) => self.enable_scan_work(enabled),
            WorkItem::EnableQueueWork(enabled) => self.enable_queue_work(enabled),
            WorkItem::DrainNow => {
                self.drain_queue();
            }
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Scan => self.on_scan_timer(),
            TimerKind::QueueDrain => self.on_queue_timer(),
            TimerKind::FotaStep => self.fota_step(),
            TimerKind::FotaVersionCheck => self.fota_version_check(),
            TimerKind::FotaInProgressCheck => self.fota_check_in_progress_record(),
            TimerKind::FotaDownloadMonitor => self.fota_download_monitor(),
            TimerKind::UsbFota => self.on_usb_fota_timer(),
            TimerKind::Reboot => self.on_reboot_timer(),
        }
    }

    /// Enruta un mensaje de la nube según su tópico.
    #[instrument(name = "cloud_message", skip(self, payload), fields(bytes = payload.len()))]
    pub fn handle_cloud_message(&mut self, payload: &[u8]) {
        let (topic, body) = match parse_cloud_message(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Warning: mensaje de la nube descartado: {}", e);
                return;
            }
        };
        debug!("Debug: mensaje entrante {:?}", topic);

        match topic {
            Topic::Fota => {
                if let Err(e) = self.handle_fota_response(&body) {
                    warn!("Warning: respuesta FOTA descartada: {}", e);
                }
            }
            Topic::ConnTest => {
                let result = self.queue_connectivity(connectivity_echo(&body));
                self.log_produce("prueba de conectividad", result);
                self.drain_queue();
            }
            Topic::Onboarding => self.on_onboarding_response(&body),
            Topic::ShadowProxy => match self.apply_incoming_shadow(&body) {
                Ok(result) => debug!("Debug: shadow conciliado: {:?}", result),
                Err(e) => warn!("Warning: delta de shadow descartado: {}", e),
            },
            Topic::SrfFunc => {
                let reply = self.handle_srf_message(&body);
                debug!("Debug: SRF respondido {} ({})", reply.status(), reply.text());
            }
            other => warn!("Warning: tópico {:?} no esperado desde la nube", other),
        }
    }

    fn on_onboarding_response(&mut self, body: &Value) {
        if body.get("ST").and_then(Value::as_str) != Some("OK") {
            warn!("Warning: onboarding rechazado por la nube: {}", body);
            return;
        }
        if let Err(e) = self.ctx.wifi.save_onboarded(transport::CREDENTIALS_TIMEOUT) {
            error!("Error: no se pudo guardar el flag de onboarding: {}", e);
            return;
        }
        info!("Info: onboarding completo");
        self.link.onboarded = true;

        if self.active_radio() == RadioKind::Cellular {
            self.ctx.platform.reboot("onboarding completo por celular");
            return;
        }
        match self.queue_shadow_report() {
            Ok(()) => self.link.shadow_sent = true,
            Err(e) => warn!("Warning: no se pudo encolar el shadow: {}", e),
        }
        let result = self.queue_srf_nonce();
        self.log_produce("nonce SRF", result);
        self.drain_queue();
    }
}


/// El eco devuelve el `ID` de la prueba o, sin él, el cuerpo entero.
fn connectivity_echo(body: &Value) -> String {
    match body.get("ID") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => body.to_string(),
    }
}


/// Bucle principal del worker.
///
/// Termina cuando todos los emisores de la bandeja se cierran.
#[instrument(name = "run_comm_manager", skip(rx_work, mgr))]
pub async fn run_comm_manager(mut rx_work: mpsc::Receiver<WorkItem>, mut mgr: CommManager) {

    info!("Info: worker del gestor creado");

    while let Some(item) = rx_work.recv().await {
        mgr.handle(item);
    }

    info!("Info: worker del gestor finalizado");
}


/// Lanza el worker en segundo plano.
///
/// # Argumentos
/// * `rx_work`: Bandeja de entrada compartida por temporizadores y adaptadores.
/// * `mgr`: Gestor ya iniciado con `start()`.
pub fn start_comm_manager(rx_work: mpsc::Receiver<WorkItem>, mgr: CommManager) {

    info!("Info: iniciando worker del gestor");
    tokio::spawn(async move {
        run_comm_manager(rx_work, mgr).await;
    });
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use serde_json::json;
    use crate::context::domain::AppContext;
    use crate::device::sim::{SimClock, SimDevice};
    use crate::device::storage::MemoryStorage;
    use crate::fota::domain::{DeviceKind, DeviceOutcome, UpdateErrorCause, Version};
    use crate::manager::domain::testing::Bench;
    use crate::system::domain::System;
    use crate::timer::domain::TimerBank;
    use crate::timer::logic::start_timer_wheel;
    use super::*;

    fn cloud(topic: Topic, body: Value) -> WorkItem {
        let payload = serde_json::to_vec(&json!({ "T": topic.number(), "M": body })).unwrap();
        WorkItem::CloudMessage { payload }
    }

    fn queued(bench: &Bench) -> Vec<Topic> {
        bench.mgr.queue().iter().map(|m| m.topic).collect()
    }

    #[test]
    fn start_arms_the_first_timers() {
        let mut bench = Bench::new();
        bench.device.state().facts.onboarded = true;
        bench.mgr.start();

        assert!(bench.mgr.link.onboarded);
        assert_ne!(bench.mgr.srf.nonce, 0);
        assert_eq!(bench.mgr.timers.remaining(TimerKind::Scan, 0), schedule::FIRST_SCAN_DELAY);
        assert_eq!(bench.mgr.timers.remaining(TimerKind::QueueDrain, 0), schedule::FIRST_DRAIN_DELAY);
        assert!(bench.mgr.timers.is_armed(TimerKind::FotaInProgressCheck));
    }

    #[test]
    fn stale_timer_fires_are_ignored() {
        let mut bench = Bench::new();
        bench.mgr.start();
        let stale = bench.mgr.timers.generation(TimerKind::QueueDrain).unwrap();
        bench.mgr.arm(TimerKind::QueueDrain, Duration::from_secs(99));

        bench.mgr.handle(WorkItem::TimerFired { kind: TimerKind::QueueDrain, generation: stale });
        assert_eq!(bench.mgr.timers.remaining(TimerKind::QueueDrain, 0), Duration::from_secs(99));

        assert!(bench.fire(TimerKind::QueueDrain));
        let q = Duration::from_secs(u64::from(bench.mgr.shadow().vars.q));
        assert_eq!(bench.mgr.timers.remaining(TimerKind::QueueDrain, 0), q);
    }

    #[test]
    fn connectivity_test_is_echoed() {
        let mut bench = Bench::new();
        bench.mgr.handle(cloud(Topic::ConnTest, json!({ "ID": "ping-7" })));
        let msg = bench.mgr.queue().front().unwrap();
        assert_eq!(msg.topic, Topic::ConnTest);
        let value: Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(value["M"]["echo"], "ping-7");
    }

    #[test]
    fn garbage_and_unexpected_topics_are_dropped() {
        let mut bench = Bench::new();
        bench.mgr.handle(WorkItem::CloudMessage { payload: b"not json".to_vec() });
        bench.mgr.handle(WorkItem::CloudMessage { payload: br#"{"T": 77, "M": {}}"#.to_vec() });
        bench.mgr.handle(cloud(Topic::Telemetry, json!({})));
        assert!(bench.mgr.queue().is_empty());
    }

    #[test]
    fn onboarding_over_wifi_publishes_shadow_and_nonce() {
        let mut bench = Bench::new();
        bench.device.state().connect(RadioKind::Wifi);
        bench.device.state().mqtt_connected = false;
        bench.mgr.handle(cloud(Topic::Onboarding, json!({ "ST": "OK" })));

        assert!(bench.mgr.link.onboarded);
        assert!(bench.device.state().onboarded_saved);
        assert!(bench.device.state().reboots.is_empty());
        assert_eq!(queued(&bench), vec![Topic::ShadowProxy, Topic::SrfNonce]);
    }

    #[test]
    fn onboarding_over_cellular_reboots() {
        let mut bench = Bench::new();
        bench.device.state().connect(RadioKind::Cellular);
        bench.mgr.handle(cloud(Topic::Onboarding, json!({ "ST": "OK" })));
        assert_eq!(bench.device.state().reboots.len(), 1);
    }

    #[test]
    fn rejected_onboarding_changes_nothing() {
        let mut bench = Bench::new();
        bench.mgr.handle(cloud(Topic::Onboarding, json!({ "ST": "DENIED" })));
        assert!(!bench.mgr.link.onboarded);
        assert!(!bench.device.state().onboarded_saved);
    }

    #[test]
    fn unknown_fota_state_is_ignored() {
        let mut bench = Bench::new();
        bench.mgr.handle(WorkItem::FotaProgress { device: DeviceKind::CellularModem, state: 42, detail: 0 });
        bench.mgr.handle(WorkItem::FotaProgress { device: DeviceKind::CellularModem, state: 3, detail: 0 });
        assert!(bench.mgr.queue().is_empty());
    }

    fn modem_offer_in_flight() -> Bench {
        let mut bench = Bench::new();
        bench.device.state().connect(RadioKind::Wifi);
        bench.mgr.link.onboarded = true;
        bench.mgr.handle(WorkItem::CheckFota);
        bench.mgr.handle(cloud(Topic::Fota, json!({
            "STR": "OK",
            "RID": "r-1",
            "AL": [{
                "DT": "nrf9160",
                "MTD": { "major": "1", "minor": "4", "build": "0" },
                "CH": ["https://cdn.example/nrf9160_1.4.0.bin"]
            }]
        })));
        assert!(bench.mgr.fota.is_started(DeviceKind::CellularModem));
        bench
    }

    fn fota_stages(bench: &Bench) -> Vec<String> {
        bench.device.state().sent.iter()
            .filter(|m| m.topic == Topic::FotaLifecycle.number().to_string())
            .filter_map(|m| m.json()["M"]["stage"].as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn reported_completion_with_the_old_version_fails_verification() {
        let mut bench = modem_offer_in_flight();
        bench.mgr.handle(WorkItem::FotaProgress { device: DeviceKind::CellularModem, state: 3, detail: 0 });

        assert_eq!(
            bench.mgr.fota.device(DeviceKind::CellularModem).outcome,
            Some(DeviceOutcome::Failed(UpdateErrorCause::InvalidUpdate))
        );
        assert!(!fota_stages(&bench).contains(&"DONE".to_string()));
    }

    #[test]
    fn reported_completion_with_the_new_version_is_done() {
        let mut bench = modem_offer_in_flight();
        bench.device.state().versions.insert(DeviceKind::CellularModem, Version::new(1, 4, 0));
        bench.mgr.handle(WorkItem::FotaProgress { device: DeviceKind::CellularModem, state: 3, detail: 0 });

        assert_eq!(bench.mgr.fota.device(DeviceKind::CellularModem).outcome, Some(DeviceOutcome::Updated));
        assert_eq!(fota_stages(&bench).last().map(String::as_str), Some("DONE"));
    }

    #[test]
    fn completion_for_a_device_not_in_progress_is_ignored() {
        let mut bench = modem_offer_in_flight();
        bench.mgr.handle(WorkItem::FotaProgress { device: DeviceKind::WifiChip, state: 3, detail: 0 });
        assert!(bench.mgr.fota.is_started(DeviceKind::CellularModem));
        assert_eq!(bench.mgr.fota.device(DeviceKind::WifiChip).outcome, None);
    }

    #[test]
    fn download_cancel_keeps_the_cycle_going() {
        let mut bench = modem_offer_in_flight();
        bench.mgr.handle(WorkItem::CancelFotaDownload(DeviceKind::WifiChip));
        assert!(bench.mgr.fota.is_started(DeviceKind::CellularModem));

        bench.mgr.handle(WorkItem::CancelFotaDownload(DeviceKind::CellularModem));
        assert_eq!(bench.mgr.fota.device(DeviceKind::CellularModem).outcome, Some(DeviceOutcome::Cancelled));
        assert_eq!(bench.device.state().cancels, vec![DeviceKind::CellularModem]);
        assert!(bench.mgr.fota.cycle_active);
        assert!(bench.mgr.fota.device(DeviceKind::WifiChip).requested);
    }

    #[test]
    fn producer_items_reach_the_queue() {
        let mut bench = Bench::new();
        bench.mgr.handle(WorkItem::PairingNonce("abc".into()));
        bench.mgr.handle(WorkItem::SendTelemetry);
        bench.mgr.handle(WorkItem::Alert { text: "collar abierto".into() });
        assert_eq!(queued(&bench), vec![Topic::Pairing, Topic::Telemetry, Topic::Alert]);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_drains_on_the_first_queue_timer() {
        let system = Arc::new(System::for_tests());
        let device = Arc::new(SimDevice::new(system.app_version));
        device.state().facts.onboarded = true;
        device.state().connect(RadioKind::Cellular);
        let ctx = AppContext::with_device(
            system,
            device.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(SimClock::new(1_700_000_000)),
        );

        let (tx_work, rx_work) = mpsc::channel(16);
        let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();
        let mut mgr = CommManager::new(ctx, TimerBank::new(tx_cmd));
        mgr.start();
        start_timer_wheel(tx_work.clone(), rx_cmd);
        start_comm_manager(rx_work, mgr);

        tx_work.send(WorkItem::Alert { text: "hola".into() }).await.unwrap();
        tokio::time::sleep(schedule::FIRST_DRAIN_DELAY + Duration::from_secs(1)).await;

        let sent = device.state().sent.clone();
        assert!(sent.iter().any(|m| m.json()["M"]["msg"] == "hola"));
    }
}
