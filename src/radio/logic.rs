//! Política de selección de radio.
//!
//! Decide *cuándo* pedir un cambio de transporte al gestor de radios externo.
//! Nunca interrumpe un cambio en curso ni una FOTA en progreso salvo que el
//! enlace actual ya se haya perdido.


use tracing::{debug, info, warn};
use crate::config::transport;
use crate::manager::domain::CommManager;
use super::domain::{ModemStatus, RadioFacts, RadioKind, SwitchUrgency};


impl CommManager {

    /// Pide al gestor de radios pasar a `target`. Devuelve si el pedido se emitió.
    pub fn request_switch(&mut self, target: RadioKind, clear_existing: bool, urgency: SwitchUrgency) -> bool {
        if urgency == SwitchUrgency::Opportunistic {
            if self.ctx.radio.is_switching() {
                debug!("Debug: cambio a {:?} omitido, ya hay uno en curso", target);
                return false;
            }
            if self.fota.any_started() {
                info!("Info: cambio a {:?} omitido por FOTA en progreso", target);
                return false;
            }
        }
        if target == RadioKind::Wifi && !self.ctx.radio.is_wifi_enabled() {
            warn!("Warning: WiFi deshabilitado, no se puede cambiar a WiFi");
            return false;
        }
        info!("Info: pidiendo cambio de radio a {:?} ({:?})", target, urgency);
        self.ctx.radio.switch_to(target, clear_existing);
        true
    }

    /// Sonda del enlace WiFi. Si el chip dice que no hay enlace, fuerza celular.
    /// Un error de la sonda no se toma como desconexión.
    pub(crate) fn verify_wifi_link(&mut self) -> bool {
        match self.ctx.wifi.link_status(transport::LINK_PROBE_TIMEOUT) {
            Ok(true) => true,
            Ok(false) => {
                warn!("Warning: WiFi figura activo pero la sonda indica desconexión");
                self.request_switch(RadioKind::Cellular, true, SwitchUrgency::LinkLost);
                false
            }
            Err(e) => {
                warn!("Warning: no se pudo sondear el enlace WiFi: {}", e);
                true
            }
        }
    }

    /// Tras un escaneo sin WiFi activo: intenta reconectar a una red conocida.
    pub(crate) fn reconnect_from_scan(&mut self, facts: &RadioFacts) {
        if facts.ap_connected == Some(true) {
            // Asociado a un AP sin MQTT sobre WiFi.
            if let Err(e) = self.ctx.wifi.disconnect(transport::CREDENTIALS_TIMEOUT) {
                warn!("Warning: no se pudo desconectar el AP: {}", e);
            }
        }
        if let Some(index) = self.ctx.wifi.find_known_ssid() {
            info!("Info: red conocida {} visible, intentando conectar", index);
            if let Err(e) = self.ctx.radio.connect_by_index(index) {
                warn!("Warning: fallo al conectar a la red {}: {}", index, e);
            }
        }
        if self.link.quick_reconnect_remaining > 0 {
            self.link.quick_reconnect_remaining -= 1;
            if self.link.quick_reconnect_remaining == 0 {
                self.reset_scan_timer();
            }
        }
    }

    /// Se perdió el AP.
    pub(crate) fn on_ap_lost(&mut self) {
        if self.active_radio() == RadioKind::Wifi {
            self.request_switch(RadioKind::Cellular, true, SwitchUrgency::LinkLost);
        }
    }

    pub fn on_modem_status(&mut self, status: ModemStatus) {
        let previous = self.link.modem;
        self.link.modem = status;
        debug!("Debug: estado del módem {:?}", status);
        if previous.mqtt_enabled
            && !status.mqtt_enabled
            && self.active_radio() == RadioKind::Cellular
            && !self.ctx.radio.is_switching()
        {
            warn!("Warning: MQTT celular deshabilitado con celular activo, se reintenta");
            self.request_switch(RadioKind::Cellular, false, SwitchUrgency::Opportunistic);
        }
    }

    /// El gestor de radios terminó un cambio.
    ///
    /// # Flujo de Trabajo
    /// 1. Recalcula periodos y reinicia el temporizador de escaneo.
    /// 2. Sin onboarding, encola sólo el mensaje de onboarding.
    /// 3. Con onboarding, publica el shadow (una vez por arranque) y el nonce SRF,
    ///    renovado si se vuelve de un corte.
    /// 4. Intenta drenar.
    pub fn on_radio_switched(&mut self, radio: RadioKind) {
        info!("Info: radio activa ahora {:?}", radio);
        let previous = std::mem::replace(&mut self.link.radio, radio);
        let reconnected = previous == RadioKind::None && self.link.ever_connected;
        if radio != RadioKind::None {
            self.link.ever_connected = true;
        }
        self.reset_scan_timer();
        if radio == RadioKind::None {
            return;
        }

        if !self.link.onboarded {
            let result = self.queue_onboarding();
            self.log_produce("onboarding", result);
        } else {
            if !self.link.shadow_sent {
                match self.queue_shadow_report() {
                    Ok(()) => self.link.shadow_sent = true,
                    Err(e) => warn!("Warning: no se pudo encolar el shadow: {}", e),
                }
            }
            if reconnected {
                debug!("Debug: reconexión tras un corte, nuevo nonce SRF");
                self.srf.regenerate();
            }
            let result = self.queue_srf_nonce();
            self.log_produce("nonce SRF", result);
        }
        self.drain_queue();
    }
}
