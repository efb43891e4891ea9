//! Zonas seguras y eventos de conectividad y energía.
//!
//! Convierte las transiciones del chip WiFi (conexión, desconexión, zona
//! segura) y los avisos de batería, USB y temperatura en alertas y cambios de
//! estado del gestor.


use tracing::{debug, info, warn};
use crate::config::{fota, priority, schedule};
use crate::manager::domain::{CommManager, WifiEvent};
use crate::message::domain::{alert_kind, MessageError, SafeZoneAlertBody, TemperatureStatus, Topic};
use crate::radio::domain::RadioKind;
use crate::schedule::domain::FmdExit;
use crate::timer::domain::TimerKind;


impl CommManager {

    pub fn handle_wifi_event(&mut self, event: WifiEvent) {
        match event {
            WifiEvent::ApConnected { ssid } => self.on_ap_connected(ssid),
            WifiEvent::ApDisconnected { reason } => self.on_ap_disconnected(&reason),
            WifiEvent::ApSafe(safe) => {
                debug!("Debug: AP marcado como seguro = {}", safe);
                if safe {
                    self.disable_fmd(FmdExit::Safe);
                }
            }
            WifiEvent::MqttBroker { connected } => self.on_broker_status(connected),
            WifiEvent::HttpDownloadComplete { ok } => self.fota_http_complete(ok),
        }
    }

    fn on_ap_connected(&mut self, ssid: String) {
        info!("Info: conectado al AP {}", ssid);
        self.link.quick_reconnect_remaining = schedule::QUICK_RECONNECT_ATTEMPTS;
        if self.shadow.zone_for(&ssid).is_some_and(|z| z.safe) {
            let result = self.queue_safe_zone_alert(alert_kind::SAFE_ZONE_ENTER, &ssid, None);
            self.log_produce("alerta de zona segura", result);
            self.disable_fmd(FmdExit::Safe);
        }
        self.link.last_ap_name = ssid;
        self.reset_scan_timer();
    }

    fn on_ap_disconnected(&mut self, reason: &str) {
        info!("Info: desconectado del AP {} ({})", self.link.last_ap_name, reason);
        if reason == schedule::AUTH_NOT_VALID {
            self.link.quick_reconnect_remaining = 0;
        }
        let last = std::mem::take(&mut self.link.last_ap_name);
        if self.shadow.zone_for(&last).is_some_and(|z| z.safe) {
            let result = self.queue_safe_zone_alert(alert_kind::SAFE_ZONE_EXIT, &last, Some(reason.to_string()));
            self.log_produce("alerta de zona segura", result);
        }
        self.on_ap_lost();
        self.reset_scan_timer();
    }

    fn on_broker_status(&mut self, connected: bool) {
        if self.active_radio() != RadioKind::Wifi {
            return;
        }
        if connected {
            let result = self.queue_srf_nonce();
            self.log_produce("nonce SRF", result);
            self.drain_queue();
        } else {
            debug!("Debug: broker MQTT desconectado, se invalida el nonce SRF");
            self.srf.regenerate();
        }
    }

    fn queue_safe_zone_alert(&mut self, sub: u8, ssid: &str, reason: Option<String>) -> Result<(), MessageError> {
        let body = SafeZoneAlertBody { sub, ssid: ssid.to_string(), reason };
        self.submit(Topic::Alert, priority::SAFE_ZONE, body)
    }

    pub fn on_battery(&mut self, percent: i32) {
        self.set_battery(percent);
        if self.schedule.fmd_active() && self.link.battery_percent < schedule::FMD_MIN_BATTERY {
            warn!("Warning: batería en {}%, se sale del modo FMD", self.link.battery_percent);
            self.disable_fmd(FmdExit::Battery);
        }
    }

    /// Con USB el Rec baja y, pasada media hora, se busca firmware nuevo.
    pub fn on_usb_power(&mut self, connected: bool) {
        if self.link.usb_powered == connected {
            return;
        }
        info!("Info: USB {}", if connected { "conectado" } else { "desconectado" });
        self.link.usb_powered = connected;
        if connected {
            self.arm(TimerKind::UsbFota, fota::AFTER_USB_CONNECT);
        } else {
            self.timers.stop(TimerKind::UsbFota);
        }
        self.reset_scan_timer();
    }

    pub fn on_temperature(&mut self, status: TemperatureStatus) {
        let result = self.queue_alert(alert_kind::TEMPERATURE, status.alert_text());
        self.log_produce("alerta de temperatura", result);
    }

    /// Último aviso antes de apagarse por batería.
    pub fn on_shutdown_imminent(&mut self) {
        let result = self.queue_shutdown_alert();
        self.log_produce("alerta de apagado", result);
        self.drain_queue();
    }
}
