//! Estado de radios visto por el gestor de comunicaciones.
//!
//! Los hechos que llegan del chip WiFi y del módem son entradas de sólo lectura;
//! el gestor sólo decide *que* hay que cambiar de transporte y se lo pide al
//! gestor de radios externo.


use serde::Serialize;
use crate::device::domain::ScannedNetwork;
use crate::fota::domain::Version;


/// Transporte activo para MQTT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RadioKind {
    #[default]
    None,
    Cellular,
    Wifi,
}


/// Hechos reportados por el chip WiFi. `None` significa "desconocido".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RadioFacts {
    pub ap_connected: Option<bool>,
    pub ap_safe: Option<bool>,
    pub ap_name: String,
    pub rssi: i32,
    pub mqtt_broker_connected: bool,
    pub chip_version: Option<Version>,
    /// El chip guarda la marca de onboarding completado.
    pub onboarded: bool,
}


impl RadioFacts {
    /// El AP actual está confirmado como zona segura.
    pub fn in_safe_zone(&self) -> bool {
        self.ap_safe == Some(true)
    }
}


/// Estado del módem reportado por su driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModemStatus {
    pub powered: bool,
    pub lte_connected: bool,
    pub mqtt_enabled: bool,
    pub mqtt_connected: bool,
}


/// Urgencia de un pedido de cambio de radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchUrgency {
    /// Respeta un cambio en curso y una FOTA en progreso.
    Opportunistic,
    /// El enlace actual ya se perdió: se pide el cambio igual.
    LinkLost,
}


/// Bookkeeping de conectividad propio del gestor.
#[derive(Debug, Clone, Default)]
pub struct LinkState {
    pub quick_reconnect_remaining: u8,
    pub usb_powered: bool,
    pub battery_percent: u8,
    pub onboarded: bool,
    /// El shadow ya se publicó en este arranque.
    pub shadow_sent: bool,
    /// Último AP al que se conectó, para la alerta de salida de zona segura.
    pub last_ap_name: String,
    pub ever_connected: bool,
    /// Último enlace notificado por `on_radio_switched`.
    pub radio: RadioKind,
    pub modem: ModemStatus,
    /// Resultado del último escaneo de SSIDs.
    pub last_scan: Vec<ScannedNetwork>,
}


impl LinkState {
    /// USB o reconexiones rápidas pendientes fuerzan un Rec corto.
    pub fn fast_reconnect(&self) -> bool {
        self.usb_powered || self.quick_reconnect_remaining > 0
    }
}


/// Se escanea salvo que estemos en WiFi dentro de una zona confirmada como segura.
pub fn scan_wanted(active: RadioKind, facts: &RadioFacts) -> bool {
    active != RadioKind::Wifi || !facts.in_safe_zone()
}
