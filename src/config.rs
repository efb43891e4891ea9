//! Constantes operativas del gestor de comunicaciones.
//!
//! Agrupadas por subsistema. Los valores configurables en tiempo de ejecución
//! (periodos S/T/Rec/Q, zonas seguras, etc.) viven en el documento shadow, no aquí.


pub mod queue {
    /// Bytes disponibles para payloads encolados.
    pub const CAPACITY_BYTES: usize = 20 * 1024;
    /// Tamaño máximo de un payload aceptado por el transporte WiFi.
    pub const MAX_MESSAGE_BYTES: usize = 2048;
    /// Cantidad máxima de mensajes en la cola.
    pub const MAX_MESSAGES: usize = 30;
}


pub mod priority {
    pub const ONBOARDING: u8 = 1;
    pub const FOTA_CHECK: u8 = 1;
    pub const FOTA_DONE: u8 = 1;
    pub const SRF_NONCE: u8 = 5;
    pub const SRF_RESPONSE: u8 = 5;
    pub const PAIRING: u8 = 5;
    pub const ALERT: u8 = 10;
    pub const SAFE_ZONE: u8 = 10;
    pub const FMD_TELEMETRY: u8 = 10;
    pub const WHERE_IS_MY_DOG: u8 = 10;
    pub const TELEMETRY: u8 = 20;
    pub const SHADOW: u8 = 20;
    pub const FOTA_FEEDBACK: u8 = 30;
    pub const CONNECTIVITY: u8 = 30;
}


pub mod transport {
    use std::time::Duration;

    pub const CELLULAR_SEND_TIMEOUT: Duration = Duration::from_secs(15);
    pub const WIFI_PUBLISH_TIMEOUT: Duration = Duration::from_secs(6);
    pub const PREPARE_TIMEOUT: Duration = Duration::from_secs(3);
    pub const LINK_PROBE_TIMEOUT: Duration = Duration::from_millis(800);
    pub const SCAN_TIMEOUT: Duration = Duration::from_millis(2500);
    pub const RSSI_TIMEOUT: Duration = Duration::from_millis(500);
    pub const CREDENTIALS_TIMEOUT: Duration = Duration::from_secs(3);
    pub const QOS: u8 = 1;
}


pub mod schedule {
    use std::time::Duration;

    /// S efectivo mientras ninguna radio se conectó todavía.
    pub const BOOTSTRAP_S_SECS: u32 = 20;
    /// Rec forzado con USB conectado o con reconexiones rápidas pendientes.
    pub const FAST_REC_SECS: u32 = 10;
    pub const QUICK_RECONNECT_ATTEMPTS: u8 = 3;
    pub const FIRST_SCAN_DELAY: Duration = Duration::from_secs(10);
    pub const FIRST_DRAIN_DELAY: Duration = Duration::from_secs(10);
    /// SSIDs por mensaje de telemetría.
    pub const SSIDS_PER_TELEMETRY: usize = 10;
    /// Por debajo de este porcentaje de batería se sale del modo FMD.
    pub const FMD_MIN_BATTERY: u8 = 10;
    /// Motivo de desconexión que invalida las reconexiones rápidas.
    pub const AUTH_NOT_VALID: &str = "AUTH_NOT_VALID";

    pub const S_MIN: u32 = 10;
    pub const S_MAX: u32 = 65534;
    pub const T_MIN: u32 = 1;
    pub const T_MAX: u32 = 100;
    pub const REC_MIN: u32 = 10;
    pub const REC_MAX: u32 = 65534;
    pub const Q_MIN: u32 = 1;
    pub const Q_MAX: u32 = 65534;
}


pub mod fota {
    use std::time::Duration;

    /// Tiempo máximo sin cambio de estado antes de dar por terminado un dispositivo.
    pub const STATE_MAX_TIME: Duration = Duration::from_secs(60);
    pub const STEP_IDLE: Duration = Duration::from_secs(10);
    pub const STEP_IN_PROGRESS: Duration = Duration::from_secs(30);
    pub const STEP_IN_PROGRESS_WIFI: Duration = Duration::from_secs(60);
    pub const VERSION_CHECK_CELLULAR: Duration = Duration::from_secs(45);
    pub const VERSION_CHECK_WIFI: Duration = Duration::from_secs(30);
    pub const DOWNLOAD_MONITOR: Duration = Duration::from_secs(10);
    pub const AFTER_USB_CONNECT: Duration = Duration::from_secs(30 * 60);
    pub const IN_PROGRESS_MIN_SECS: u32 = 1;
    pub const IN_PROGRESS_MAX_SECS: u32 = 200;
    pub const CANCEL_CODE: i32 = -500;
}


pub mod srf {
    pub const REBOOT_MIN_SECS: i64 = 10;
    pub const REBOOT_MAX_SECS: i64 = 3600;
}


pub mod storage {
    pub const SHADOW_KEY: &str = "shadow_doc.json";
    pub const FOTA_RECORD_KEY: &str = "fota_in_progress.json";
}


pub mod inbox {
    pub const WORK_QUEUE_DEPTH: usize = 64;
}
