//! Drenado de la cola de salida.
//!
//! Se invoca con el temporizador Q, tras cada escaneo con MQTT arriba y cuando
//! aparece conectividad. Transmite en orden de llegada por el transporte activo.


use tracing::{debug, info, instrument, warn};
use crate::config::transport;
use crate::device::domain::{FailureClass, TransportError};
use crate::manager::domain::CommManager;
use crate::message::domain::Topic;
use crate::message::logic::topic_path;
use crate::radio::domain::{RadioKind, SwitchUrgency};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainSkip {
    Disabled,
    NotConnected,
    Switching,
    Empty,
    RadioNotReady,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStop {
    /// Error transitorio: el mensaje quedó al frente.
    Transient,
    /// El transporte activo no es el que se creía.
    WrongTransport,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainStats {
    pub sent: usize,
    pub dropped: usize,
    /// Mensajes rotados por falta de onboarding.
    pub deferred: usize,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Skipped(DrainSkip),
    Completed(DrainStats),
    Stopped(DrainStop, DrainStats),
}


impl CommManager {

    /// Una pasada de drenado.
    ///
    /// # Flujo de Trabajo
    /// 1. Compuertas: trabajo de cola habilitado, MQTT conectado, sin cambio de
    ///    radio en curso, cola no vacía, radio preparada.
    /// 2. En WiFi, una sonda de enlace negativa fuerza el paso a celular.
    /// 3. Recorre a lo sumo los mensajes presentes al inicio:
    ///    - sin onboarding, todo lo que no sea onboarding se rota al final;
    ///    - éxito: se libera;
    ///    - error irrecuperable: se descarta y se sigue;
    ///    - error transitorio: queda al frente y se corta la pasada;
    ///    - transporte equivocado: queda al frente, se reevalúa la radio y se corta.
    #[instrument(name = "drain_queue", skip(self))]
    pub fn drain_queue(&mut self) -> DrainOutcome {
        if !self.queue_work_enabled {
            return DrainOutcome::Skipped(DrainSkip::Disabled);
        }
        if !self.ctx.radio.is_active_mqtt_connected() {
            return DrainOutcome::Skipped(DrainSkip::NotConnected);
        }
        if self.ctx.radio.is_switching() {
            return DrainOutcome::Skipped(DrainSkip::Switching);
        }
        if self.queue.is_empty() {
            return DrainOutcome::Skipped(DrainSkip::Empty);
        }

        let active = self.active_radio();
        if !self.ctx.radio.prepare_for_use(active, true, transport::PREPARE_TIMEOUT) {
            warn!("Warning: la radio {:?} no está lista para drenar", active);
            return DrainOutcome::Skipped(DrainSkip::RadioNotReady);
        }

        if active == RadioKind::Wifi && !self.verify_wifi_link() {
            self.ctx.radio.done_with(active);
            return DrainOutcome::Stopped(DrainStop::WrongTransport, DrainStats::default());
        }

        let outcome = self.drain_pass(active);
        self.ctx.radio.done_with(active);
        if let DrainOutcome::Completed(stats) | DrainOutcome::Stopped(_, stats) = outcome {
            info!("Info: drenado {:?}: {} enviados, {} descartados, {} diferidos, {} en cola",
                  active, stats.sent, stats.dropped, stats.deferred, self.queue.len());
        }
        outcome
    }

    fn drain_pass(&mut self, active: RadioKind) -> DrainOutcome {
        let mut stats = DrainStats::default();
        for _ in 0..self.queue.len() {
            let Some(msg) = self.queue.front() else { break };

            if !self.link.onboarded && msg.topic != Topic::Onboarding {
                debug!("Debug: sin onboarding, se difiere {:?}", msg.topic);
                self.queue.rotate_front_to_back();
                stats.deferred += 1;
                continue;
            }

            match self.transmit(active, msg.topic, &msg.payload, msg.qos) {
                Ok(()) => {
                    self.queue.pop_front();
                    stats.sent += 1;
                }
                Err(e) => match e.class() {
                    FailureClass::Unretryable => {
                        warn!("Warning: mensaje {:?} descartado: {}", msg.topic, e);
                        self.queue.pop_front();
                        stats.dropped += 1;
                    }
                    FailureClass::Transient => {
                        warn!("Warning: envío fallido ({}), se reintenta en el próximo drenado", e);
                        return DrainOutcome::Stopped(DrainStop::Transient, stats);
                    }
                    FailureClass::WrongTransport => {
                        warn!("Warning: {} sobre {:?}, se reevalúa la radio", e, active);
                        self.on_wrong_transport(active, &e);
                        return DrainOutcome::Stopped(DrainStop::WrongTransport, stats);
                    }
                },
            }
        }
        DrainOutcome::Completed(stats)
    }

    fn transmit(&self, active: RadioKind, topic: Topic, payload: &[u8], qos: u8) -> Result<(), TransportError> {
        match active {
            RadioKind::Cellular => {
                let system = &self.ctx.system;
                let path = topic_path(&system.brand_id, topic, &system.serial_number);
                self.ctx.transport.send_mqtt(&path, payload, qos, transport::CELLULAR_SEND_TIMEOUT)
            }
            RadioKind::Wifi => {
                self.ctx.transport.publish(topic.number(), payload, true, transport::WIFI_PUBLISH_TIMEOUT)
            }
            RadioKind::None => Err(TransportError::NoDevice),
        }
    }

    fn on_wrong_transport(&mut self, active: RadioKind, error: &TransportError) {
        match error {
            TransportError::NoDevice if active == RadioKind::Cellular => {
                self.request_switch(RadioKind::Cellular, false, SwitchUrgency::Opportunistic);
            }
            _ => {
                self.request_switch(RadioKind::Cellular, false, SwitchUrgency::LinkLost);
            }
        }
    }
}
