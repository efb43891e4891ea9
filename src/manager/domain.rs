//! Estado propio del gestor de comunicaciones y sus unidades de trabajo.
//!
//! `CommManager` es el único dueño de la cola de salida, el documento shadow,
//! el planificador y el estado FOTA. Sólo lo toca el worker; los productores
//! externos le mandan `WorkItem`s.


use std::time::Duration;
use tracing::warn;
use crate::config::queue;
use crate::context::domain::AppContext;
use crate::fota::domain::{DeviceKind, FotaOrchestrator};
use crate::message::domain::TemperatureStatus;
use crate::queue::domain::{OutboundQueue, QueueLimits};
use crate::radio::domain::{LinkState, ModemStatus, RadioKind};
use crate::schedule::domain::{ScheduleState, ScheduleVars};
use crate::shadow::domain::ShadowDocument;
use crate::srf::domain::SrfState;
use crate::timer::domain::{TimerBank, TimerKind};


/// Eventos del chip WiFi.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiEvent {
    ApConnected { ssid: String },
    ApDisconnected { reason: String },
    ApSafe(bool),
    MqttBroker { connected: bool },
    /// Terminó la descarga HTTP de la imagen de la MCU.
    HttpDownloadComplete { ok: bool },
}


/// Unidad de trabajo para el worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkItem {
    TimerFired { kind: TimerKind, generation: u64 },
    CloudMessage { payload: Vec<u8> },
    RadioSwitched(RadioKind),
    Wifi(WifiEvent),
    Modem(ModemStatus),
    FotaProgress { device: DeviceKind, state: i32, detail: i32 },
    Battery { percent: i32 },
    UsbPower(bool),
    Temperature(TemperatureStatus),
    ShutdownImminent,
    PairingNonce(String),
    SendTelemetry,
    SetVars { vars: ScheduleVars, save: bool },
    EnableFmd { max_minutes: u32 },
    DisableFmd,
    CheckFota,
    CancelFota,
    /// Corta sólo la descarga del dispositivo; el ciclo sigue con el próximo.
    CancelFotaDownload(DeviceKind),
    Alert { text: String },
    EnableScanWork(bool),
    EnableQueueWork(bool),
    DrainNow,
}


pub struct CommManager {
    pub(crate) ctx: AppContext,
    pub(crate) queue: OutboundQueue,
    pub(crate) shadow: ShadowDocument,
    pub(crate) schedule: ScheduleState,
    pub(crate) fota: FotaOrchestrator,
    pub(crate) srf: SrfState,
    pub(crate) link: LinkState,
    pub(crate) timers: TimerBank,
    pub(crate) queue_work_enabled: bool,
}


impl CommManager {
    /// Crea el gestor cargando el shadow persistido (o los valores por defecto).
    pub fn new(ctx: AppContext, timers: TimerBank) -> Self {
        let limits = QueueLimits {
            capacity_bytes: ctx.system.queue_capacity_bytes,
            max_message_bytes: ctx.system.max_message_bytes,
            max_messages: queue::MAX_MESSAGES,
        };
        let shadow = crate::shadow::logic::load_shadow(&ctx);
        Self {
            ctx,
            queue: OutboundQueue::new(limits),
            shadow,
            schedule: ScheduleState::default(),
            fota: FotaOrchestrator::default(),
            srf: SrfState::default(),
            link: LinkState::default(),
            timers,
            queue_work_enabled: true,
        }
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.ctx.clock.uptime_ms()
    }

    pub(crate) fn arm(&mut self, kind: TimerKind, after: Duration) {
        let now = self.now_ms();
        if !self.timers.arm(kind, after, now) {
            warn!("Warning: {:?} quedó sin armar", kind);
        }
    }

    pub(crate) fn active_radio(&self) -> RadioKind {
        self.ctx.radio.active_radio()
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn shadow(&self) -> &ShadowDocument {
        &self.shadow
    }

    pub(crate) fn set_battery(&mut self, percent: i32) {
        if !(0..=100).contains(&percent) {
            warn!("Warning: porcentaje de batería fuera de rango: {}", percent);
        }
        self.link.battery_percent = percent.clamp(0, 100) as u8;
    }
}


#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use crate::context::domain::AppContext;
    use crate::device::sim::{SimClock, SimDevice};
    use crate::device::storage::MemoryStorage;
    use crate::system::domain::System;
    use crate::timer::domain::{TimerBank, TimerKind};
    use super::{CommManager, WorkItem};

    pub struct Bench {
        pub mgr: CommManager,
        pub device: Arc<SimDevice>,
        pub clock: Arc<SimClock>,
        pub storage: Arc<MemoryStorage>,
    }

    impl Bench {
        pub fn new() -> Self {
            Self::with_storage(Arc::new(MemoryStorage::new()))
        }

        pub fn with_storage(storage: Arc<MemoryStorage>) -> Self {
            let system = Arc::new(System::for_tests());
            let device = Arc::new(SimDevice::new(system.app_version));
            let clock = Arc::new(SimClock::new(1_700_000_000));
            let ctx = AppContext::with_device(system, device.clone(), storage.clone(), clock.clone());
            let mgr = CommManager::new(ctx, TimerBank::detached());
            Self { mgr, device, clock, storage }
        }

        /// Dispara `kind` si está armado, como lo haría la tarea de temporización.
        pub fn fire(&mut self, kind: TimerKind) -> bool {
            match self.mgr.timers.generation(kind) {
                Some(generation) => {
                    self.mgr.handle(WorkItem::TimerFired { kind, generation });
                    true
                }
                None => false,
            }
        }

        pub fn sent_topics(&self) -> Vec<String> {
            self.device.state().sent.iter().map(|m| m.topic.clone()).collect()
        }
    }
}
