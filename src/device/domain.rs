//! Interfaces hacia los colaboradores externos.
//!
//! El gestor nunca toca hardware: consume estas interfaces estrechas. Todas las
//! llamadas son síncronas desde el punto de vista del worker y reciben un
//! timeout explícito cuando el colaborador lo necesita.


use std::time::Duration;
use thiserror::Error;
use crate::fota::domain::{DeviceKind, Version};
use crate::radio::domain::{RadioFacts, RadioKind};


/// Error devuelto por un envío MQTT.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transporte no conectado")]
    NotConnected,
    #[error("timeout esperando al transporte")]
    Timeout,
    #[error("broker MQTT no conectado")]
    MqttNotConnected,
    #[error("el dispositivo de transporte no está disponible")]
    NoDevice,
    #[error("mensaje demasiado grande para el transporte")]
    TooBig,
    #[error("mensaje mal formado")]
    Malformed,
    #[error("error de transporte {0}")]
    Other(i32),
}


/// Cómo debe reaccionar la cola ante un `TransportError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Reencolar y detener el drenado.
    Transient,
    /// Descartar el mensaje y seguir.
    Unretryable,
    /// Reencolar, reevaluar la radio activa y abortar la pasada.
    WrongTransport,
}


impl TransportError {
    pub fn class(&self) -> FailureClass {
        match self {
            TransportError::TooBig | TransportError::Malformed => FailureClass::Unretryable,
            TransportError::NoDevice | TransportError::MqttNotConnected => FailureClass::WrongTransport,
            TransportError::NotConnected | TransportError::Timeout | TransportError::Other(_) => FailureClass::Transient,
        }
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("timeout en la operación {0}")]
    Timeout(&'static str),
    #[error("el dispositivo rechazó la operación: {0}")]
    Rejected(String),
    #[error("dispositivo no disponible")]
    Unavailable,
}


#[derive(Debug, Error)]
pub enum StorageError {
    #[error("error de E/S en {key}: {source}")]
    Io { key: String, source: std::io::Error },
}


/// Red visible en el último escaneo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedNetwork {
    pub ssid: String,
    pub rssi: i32,
}


/// Gestor de radios: decide y ejecuta los cambios de transporte.
pub trait RadioManager: Send + Sync {
    fn active_radio(&self) -> RadioKind;
    fn prepare_for_use(&self, radio: RadioKind, require_mqtt: bool, timeout: Duration) -> bool;
    fn done_with(&self, radio: RadioKind);
    fn switch_to(&self, radio: RadioKind, clear_existing: bool);
    fn is_switching(&self) -> bool;
    fn is_active_mqtt_connected(&self) -> bool;
    fn is_wifi_enabled(&self) -> bool;
    /// Hay un intento de conexión a un AP en curso.
    fn is_wifi_connecting(&self) -> bool;
    fn connect_by_index(&self, index: usize) -> Result<(), DeviceError>;
}


/// Envío de mensajes ya serializados.
pub trait Transport: Send + Sync {
    fn send_mqtt(&self, topic: &str, payload: &[u8], qos: u8, timeout: Duration) -> Result<(), TransportError>;
    fn publish(&self, topic_num: u8, payload: &[u8], wait_for_ack: bool, timeout: Duration) -> Result<(), TransportError>;
}


/// Chip WiFi companion.
pub trait WifiControl: Send + Sync {
    /// Hechos reportados por el chip. Sólo lectura para el núcleo.
    fn facts(&self) -> RadioFacts;
    fn refresh_ssid_list(&self, max_age: Duration, timeout: Duration) -> Result<Vec<ScannedNetwork>, DeviceError>;
    /// Índice de la red guardada presente en el último escaneo, si existe.
    fn find_known_ssid(&self) -> Option<usize>;
    /// Sonda de estado del enlace (`true` = conectado).
    fn link_status(&self, timeout: Duration) -> Result<bool, DeviceError>;
    fn disconnect(&self, timeout: Duration) -> Result<(), DeviceError>;
    fn refresh_rssi(&self, timeout: Duration) -> Result<i32, DeviceError>;
    fn delete_saved_network(&self, index: usize, timeout: Duration) -> Result<(), DeviceError>;
    fn delete_all_saved_networks(&self, timeout: Duration) -> Result<(), DeviceError>;
    fn set_zone_safe(&self, index: usize, safe: bool, timeout: Duration) -> Result<(), DeviceError>;
    fn save_onboarded(&self, timeout: Duration) -> Result<(), DeviceError>;
}


/// Módem celular.
pub trait Modem: Send + Sync {
    fn power_on(&self) -> Result<(), DeviceError>;
    fn power_off(&self) -> Result<(), DeviceError>;
    fn enable_gps(&self, period_secs: u32) -> Result<(), DeviceError>;
    fn disable_gps(&self) -> Result<(), DeviceError>;
}


/// Actualizadores de firmware específicos de cada dispositivo.
pub trait Updater: Send + Sync {
    fn start_download(&self, device: DeviceKind, url: &str, expected: Version) -> Result<(), DeviceError>;
    fn cancel(&self, device: DeviceKind) -> Result<(), DeviceError>;
    /// Bytes recibidos en la descarga HTTP en curso.
    fn downloaded_bytes(&self, device: DeviceKind) -> usize;
    /// Aplica la imagen descargada de la MCU. Normalmente reinicia.
    fn apply_mcu_image(&self) -> Result<(), DeviceError>;
    fn discard_mcu_image(&self) -> Result<(), DeviceError>;
}


/// Identidad, versiones, IMU y reinicio.
pub trait Platform: Send + Sync {
    fn current_version(&self, device: DeviceKind) -> Option<Version>;
    fn reboot(&self, reason: &str);
    fn set_motion_threshold(&self, threshold: u16) -> Result<(), DeviceError>;
    fn set_motion_detection(&self, enabled: bool) -> Result<(), DeviceError>;
    fn set_motion_duration(&self, duration: u16) -> Result<(), DeviceError>;
}


/// Almacenamiento no volátil clave/valor. Cada escritura reemplaza el valor completo.
pub trait Storage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}


pub trait Clock: Send + Sync {
    /// Milisegundos desde el arranque.
    fn uptime_ms(&self) -> u64;
    /// Segundos UNIX.
    fn unix_time(&self) -> i64;
}


/// Reloj real del proceso.
pub struct SystemClock {
    started: std::time::Instant,
}


impl SystemClock {
    pub fn new() -> Self {
        Self { started: std::time::Instant::now() }
    }
}


impl Clock for SystemClock {
    fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn unix_time(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_classified() {
        assert_eq!(TransportError::NotConnected.class(), FailureClass::Transient);
        assert_eq!(TransportError::Timeout.class(), FailureClass::Transient);
        assert_eq!(TransportError::TooBig.class(), FailureClass::Unretryable);
        assert_eq!(TransportError::Malformed.class(), FailureClass::Unretryable);
        assert_eq!(TransportError::NoDevice.class(), FailureClass::WrongTransport);
        assert_eq!(TransportError::MqttNotConnected.class(), FailureClass::WrongTransport);
    }
}
