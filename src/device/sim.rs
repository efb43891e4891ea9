//! Dispositivo simulado para banco de pruebas.
//!
//! Implementa todas las interfaces de colaboradores sobre un único estado en
//! memoria. Registra cada pedido (cambios de radio, envíos, descargas,
//! reinicios) para que las pruebas puedan inspeccionarlo, y permite guionar
//! los resultados de los envíos.


use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use crate::fota::domain::{DeviceKind, Version};
use crate::radio::domain::{RadioFacts, RadioKind};
use super::domain::{
    Clock, DeviceError, Modem, Platform, RadioManager, ScannedNetwork, Transport, TransportError, Updater,
    WifiControl,
};


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub radio: RadioKind,
    /// Ruta MQTT (celular) o número de tópico (WiFi).
    pub topic: String,
    pub payload: Vec<u8>,
}


impl SentMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}


#[derive(Debug)]
pub struct SimState {
    /// Aplica inmediatamente los cambios de radio pedidos.
    pub auto_switch: bool,
    pub active: RadioKind,
    pub switching: bool,
    pub mqtt_connected: bool,
    pub wifi_enabled: bool,
    pub wifi_connecting: bool,
    pub prepare_ok: bool,
    pub facts: RadioFacts,
    pub link_up: bool,
    pub scan: Vec<ScannedNetwork>,
    pub known_index: Option<usize>,
    pub send_script: VecDeque<Result<(), TransportError>>,
    pub send_attempts: usize,
    pub sent: Vec<SentMessage>,
    pub switch_requests: Vec<(RadioKind, bool)>,
    pub connect_requests: Vec<usize>,
    pub prepared: Vec<RadioKind>,
    pub released: Vec<RadioKind>,
    pub scans: u32,
    pub disconnects: u32,
    pub modem_powered: bool,
    pub gps_period: Option<u32>,
    pub versions: HashMap<DeviceKind, Version>,
    pub download_fails: bool,
    pub downloads: Vec<(DeviceKind, String, Version)>,
    pub downloaded_bytes: usize,
    pub cancels: Vec<DeviceKind>,
    pub mcu_image_applied: bool,
    pub mcu_image_discarded: bool,
    pub reboots: Vec<String>,
    pub motion: (u16, bool, u16),
    pub delete_fails: bool,
    pub deleted_networks: Vec<usize>,
    pub all_networks_deleted: bool,
    pub zone_safe_calls: Vec<(usize, bool)>,
    pub onboarded_saved: bool,
}


impl SimState {
    fn new(app_version: Version) -> Self {
        let versions = HashMap::from([
            (DeviceKind::CellularModem, Version::new(1, 3, 0)),
            (DeviceKind::WifiChip, Version::new(2, 0, 0)),
            (DeviceKind::AppMcu, app_version),
        ]);
        Self {
            auto_switch: false,
            active: RadioKind::None,
            switching: false,
            mqtt_connected: false,
            wifi_enabled: true,
            wifi_connecting: false,
            prepare_ok: true,
            facts: RadioFacts::default(),
            link_up: true,
            scan: Vec::new(),
            known_index: None,
            send_script: VecDeque::new(),
            send_attempts: 0,
            sent: Vec::new(),
            switch_requests: Vec::new(),
            connect_requests: Vec::new(),
            prepared: Vec::new(),
            released: Vec::new(),
            scans: 0,
            disconnects: 0,
            modem_powered: false,
            gps_period: None,
            versions,
            download_fails: false,
            downloads: Vec::new(),
            downloaded_bytes: 0,
            cancels: Vec::new(),
            mcu_image_applied: false,
            mcu_image_discarded: false,
            reboots: Vec::new(),
            motion: (0, false, 0),
            delete_fails: false,
            deleted_networks: Vec::new(),
            all_networks_deleted: false,
            zone_safe_calls: Vec::new(),
            onboarded_saved: false,
        }
    }

    /// Deja al dispositivo conectado por `radio` con MQTT arriba.
    pub fn connect(&mut self, radio: RadioKind) {
        self.active = radio;
        self.switching = false;
        self.mqtt_connected = radio != RadioKind::None;
        if radio == RadioKind::Wifi {
            self.facts.ap_connected = Some(true);
            self.facts.mqtt_broker_connected = true;
        }
        if radio == RadioKind::Cellular {
            self.modem_powered = true;
        }
    }

    fn transmit(&mut self, radio: RadioKind, topic: String, payload: &[u8]) -> Result<(), TransportError> {
        self.send_attempts += 1;
        let result = self.send_script.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.sent.push(SentMessage { radio, topic, payload: payload.to_vec() });
        }
        result
    }
}


pub struct SimDevice {
    state: Mutex<SimState>,
}


impl SimDevice {
    pub fn new(app_version: Version) -> Self {
        Self { state: Mutex::new(SimState::new(app_version)) }
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}


impl RadioManager for SimDevice {
    fn active_radio(&self) -> RadioKind {
        self.state().active
    }

    fn prepare_for_use(&self, radio: RadioKind, _require_mqtt: bool, _timeout: Duration) -> bool {
        let mut s = self.state();
        s.prepared.push(radio);
        s.prepare_ok
    }

    fn done_with(&self, radio: RadioKind) {
        self.state().released.push(radio);
    }

    fn switch_to(&self, radio: RadioKind, clear_existing: bool) {
        let mut s = self.state();
        info!("Info: [sim] cambio de radio pedido a {:?}", radio);
        s.switch_requests.push((radio, clear_existing));
        if s.auto_switch {
            s.connect(radio);
        }
    }

    fn is_switching(&self) -> bool {
        let s = self.state();
        s.switching || s.wifi_connecting
    }

    fn is_active_mqtt_connected(&self) -> bool {
        let s = self.state();
        s.mqtt_connected && s.active != RadioKind::None
    }

    fn is_wifi_enabled(&self) -> bool {
        self.state().wifi_enabled
    }

    fn is_wifi_connecting(&self) -> bool {
        self.state().wifi_connecting
    }

    fn connect_by_index(&self, index: usize) -> Result<(), DeviceError> {
        self.state().connect_requests.push(index);
        Ok(())
    }
}


impl Transport for SimDevice {
    fn send_mqtt(&self, topic: &str, payload: &[u8], _qos: u8, _timeout: Duration) -> Result<(), TransportError> {
        self.state().transmit(RadioKind::Cellular, topic.to_string(), payload)
    }

    fn publish(&self, topic_num: u8, payload: &[u8], _wait_for_ack: bool, _timeout: Duration) -> Result<(), TransportError> {
        self.state().transmit(RadioKind::Wifi, topic_num.to_string(), payload)
    }
}


impl WifiControl for SimDevice {
    fn facts(&self) -> RadioFacts {
        self.state().facts.clone()
    }

    fn refresh_ssid_list(&self, _max_age: Duration, _timeout: Duration) -> Result<Vec<ScannedNetwork>, DeviceError> {
        let mut s = self.state();
        s.scans += 1;
        Ok(s.scan.clone())
    }

    fn find_known_ssid(&self) -> Option<usize> {
        self.state().known_index
    }

    fn link_status(&self, _timeout: Duration) -> Result<bool, DeviceError> {
        Ok(self.state().link_up)
    }

    fn disconnect(&self, _timeout: Duration) -> Result<(), DeviceError> {
        let mut s = self.state();
        s.disconnects += 1;
        s.facts.ap_connected = Some(false);
        Ok(())
    }

    fn refresh_rssi(&self, _timeout: Duration) -> Result<i32, DeviceError> {
        Ok(self.state().facts.rssi)
    }

    fn delete_saved_network(&self, index: usize, _timeout: Duration) -> Result<(), DeviceError> {
        let mut s = self.state();
        if s.delete_fails {
            return Err(DeviceError::Rejected(format!("delete {index}")));
        }
        s.deleted_networks.push(index);
        Ok(())
    }

    fn delete_all_saved_networks(&self, _timeout: Duration) -> Result<(), DeviceError> {
        let mut s = self.state();
        if s.delete_fails {
            return Err(DeviceError::Timeout("delete_all"));
        }
        s.all_networks_deleted = true;
        Ok(())
    }

    fn set_zone_safe(&self, index: usize, safe: bool, _timeout: Duration) -> Result<(), DeviceError> {
        self.state().zone_safe_calls.push((index, safe));
        Ok(())
    }

    fn save_onboarded(&self, _timeout: Duration) -> Result<(), DeviceError> {
        let mut s = self.state();
        s.onboarded_saved = true;
        s.facts.onboarded = true;
        Ok(())
    }
}


impl Modem for SimDevice {
    fn power_on(&self) -> Result<(), DeviceError> {
        self.state().modem_powered = true;
        Ok(())
    }

    fn power_off(&self) -> Result<(), DeviceError> {
        self.state().modem_powered = false;
        Ok(())
    }

    fn enable_gps(&self, period_secs: u32) -> Result<(), DeviceError> {
        self.state().gps_period = Some(period_secs);
        Ok(())
    }

    fn disable_gps(&self) -> Result<(), DeviceError> {
        self.state().gps_period = None;
        Ok(())
    }
}


impl Updater for SimDevice {
    fn start_download(&self, device: DeviceKind, url: &str, expected: Version) -> Result<(), DeviceError> {
        let mut s = self.state();
        if s.download_fails {
            return Err(DeviceError::Rejected(url.to_string()));
        }
        debug!("Debug: [sim] descarga de {} desde {}", device, url);
        s.downloads.push((device, url.to_string(), expected));
        Ok(())
    }

    fn cancel(&self, device: DeviceKind) -> Result<(), DeviceError> {
        self.state().cancels.push(device);
        Ok(())
    }

    fn downloaded_bytes(&self, _device: DeviceKind) -> usize {
        self.state().downloaded_bytes
    }

    fn apply_mcu_image(&self) -> Result<(), DeviceError> {
        self.state().mcu_image_applied = true;
        Ok(())
    }

    fn discard_mcu_image(&self) -> Result<(), DeviceError> {
        self.state().mcu_image_discarded = true;
        Ok(())
    }
}


impl Platform for SimDevice {
    fn current_version(&self, device: DeviceKind) -> Option<Version> {
        self.state().versions.get(&device).copied()
    }

    fn reboot(&self, reason: &str) {
        warn!("Warning: [sim] reinicio pedido: {}", reason);
        self.state().reboots.push(reason.to_string());
    }

    fn set_motion_threshold(&self, threshold: u16) -> Result<(), DeviceError> {
        self.state().motion.0 = threshold;
        Ok(())
    }

    fn set_motion_detection(&self, enabled: bool) -> Result<(), DeviceError> {
        self.state().motion.1 = enabled;
        Ok(())
    }

    fn set_motion_duration(&self, duration: u16) -> Result<(), DeviceError> {
        self.state().motion.2 = duration;
        Ok(())
    }
}


/// Reloj manual.
pub struct SimClock {
    uptime_ms: AtomicU64,
    unix_base: i64,
}


impl SimClock {
    pub fn new(unix_base: i64) -> Self {
        Self { uptime_ms: AtomicU64::new(0), unix_base }
    }

    pub fn advance(&self, by: Duration) {
        self.uptime_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}


impl Clock for SimClock {
    fn uptime_ms(&self) -> u64 {
        self.uptime_ms.load(Ordering::SeqCst)
    }

    fn unix_time(&self) -> i64 {
        self.unix_base + (self.uptime_ms() / 1000) as i64
    }
}
