//! Serialización de mensajes y productores de la cola de salida.
//!
//! Cada productor arma el cuerpo, lo envuelve en el sobre común y lo encola con
//! su prioridad. Un error de cola se devuelve al llamador, que decide si lo
//! descarta (telemetría) o reintenta (alertas).


use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use crate::config::{priority, schedule, transport};
use crate::manager::domain::CommManager;
use super::domain::{
    AlertBody, CloudMessage, ConnectivityBody, Envelope, LocateBody, MessageError, OnboardingBody, PairingBody,
    SsidEntry, TelemetryBody, Topic, alert_kind,
};


pub fn encode<B: Serialize>(topic: Topic, machine_id: &str, timestamp: i64, body: B) -> Result<Vec<u8>, MessageError> {
    Ok(serde_json::to_vec(&Envelope { kind: topic.number(), machine_id, timestamp, body })?)
}


/// Ruta MQTT para envíos por celular.
pub fn topic_path(brand: &str, topic: Topic, serial: &str) -> String {
    format!("messages/{brand}/{}/{brand}_{serial}/d2c", topic.path_segment())
}


/// Interpreta un mensaje de la nube y resuelve su tópico.
pub fn parse_cloud_message(bytes: &[u8]) -> Result<(Topic, Value), MessageError> {
    let msg: CloudMessage = serde_json::from_slice(bytes)?;
    let topic = Topic::from_number(msg.kind).ok_or(MessageError::UnknownTopic(msg.kind))?;
    Ok((topic, msg.body))
}


impl CommManager {

    /// Serializa `body` y lo encola en `topic` con la prioridad indicada.
    pub(crate) fn submit<B: Serialize>(&mut self, topic: Topic, priority: u8, body: B) -> Result<(), MessageError> {
        let machine_id = self.ctx.system.machine_id();
        let payload = encode(topic, &machine_id, self.ctx.clock.unix_time(), body)?;
        let now = self.now_ms();
        let size = payload.len();
        self.queue.enqueue(payload, topic, transport::QOS, priority, now)?;
        debug!("Debug: encolado {:?} prioridad {} ({} bytes, {} en cola)", topic, priority, size, self.queue.len());
        Ok(())
    }

    fn ssid_entries(&self) -> Vec<SsidEntry> {
        self.link
            .last_scan
            .iter()
            .map(|n| SsidEntry { ssid: n.ssid.clone(), rssi: n.rssi })
            .collect()
    }

    /// Telemetría periódica. Una lista larga de SSIDs se reparte en varios mensajes.
    pub fn queue_telemetry(&mut self, include_ssids: bool) -> Result<(), MessageError> {
        let facts = self.ctx.wifi.facts();
        let radio = self.active_radio();
        let ssids = if include_ssids { self.ssid_entries() } else { Vec::new() };
        let chunks: Vec<Vec<SsidEntry>> = if ssids.is_empty() {
            vec![Vec::new()]
        } else {
            ssids.chunks(schedule::SSIDS_PER_TELEMETRY).map(<[SsidEntry]>::to_vec).collect()
        };
        let parts = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let body = TelemetryBody {
                batt: self.link.battery_percent,
                usb: self.link.usb_powered,
                radio,
                ap: facts.ap_name.clone(),
                safe: facts.ap_safe,
                rssi: facts.rssi,
                wifi_version: facts.chip_version,
                part: i + 1,
                parts,
                ssids: chunk,
            };
            self.submit(Topic::Telemetry, priority::TELEMETRY, body)?;
        }
        Ok(())
    }

    /// Telemetría FMD (`rid = None`) o respuesta a "where is my dog".
    pub fn queue_locate(&mut self, rid: Option<String>) -> Result<(), MessageError> {
        let facts = self.ctx.wifi.facts();
        let prio = if rid.is_some() { priority::WHERE_IS_MY_DOG } else { priority::FMD_TELEMETRY };
        let body = LocateBody {
            rid,
            fmd: self.schedule.fmd_active(),
            exit: self.schedule.fmd.last_exit,
            batt: self.link.battery_percent,
            radio: self.active_radio(),
            ap: facts.ap_name,
            safe: facts.ap_safe,
            ssids: self.ssid_entries(),
        };
        self.submit(Topic::Alert, prio, body)
    }

    pub fn queue_alert(&mut self, sub: u8, text: &str) -> Result<(), MessageError> {
        self.submit(Topic::Alert, priority::ALERT, AlertBody { sub, msg: text.to_string() })
    }

    pub fn queue_shutdown_alert(&mut self) -> Result<(), MessageError> {
        self.queue_alert(alert_kind::SHUTDOWN, "Battery depleted, shutting down")
    }

    pub fn queue_onboarding(&mut self) -> Result<(), MessageError> {
        let fw = self.ctx.system.app_version;
        self.submit(Topic::Onboarding, priority::ONBOARDING, OnboardingBody { fw })
    }

    pub fn queue_pairing_nonce(&mut self, nonce: String) -> Result<(), MessageError> {
        self.submit(Topic::Pairing, priority::PAIRING, PairingBody { nonce })
    }

    /// Eco de una prueba de conectividad.
    pub fn queue_connectivity(&mut self, echo: String) -> Result<(), MessageError> {
        self.submit(Topic::ConnTest, priority::CONNECTIVITY, ConnectivityBody { echo })
    }

    /// Envuelve un productor cuyo fallo sólo se registra.
    pub(crate) fn log_produce(&self, what: &str, result: Result<(), MessageError>) {
        if let Err(e) = result {
            warn!("Warning: no se pudo encolar {}: {}", what, e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::domain::ScannedNetwork;
    use crate::manager::domain::testing::Bench;

    #[test]
    fn envelope_and_topic_path() {
        let bytes = encode(Topic::Alert, "7_C1", 1_700_000_000, AlertBody { sub: 0, msg: "hola".into() }).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["T"], 2);
        assert_eq!(value["MID"], "7_C1");
        assert_eq!(value["M"]["msg"], "hola");
        assert_eq!(topic_path("7", Topic::Telemetry, "C1"), "messages/7/telemetry/7_C1/d2c");
    }

    #[test]
    fn cloud_messages_resolve_their_topic() {
        let (topic, body) = parse_cloud_message(br#"{"T":9,"M":{"SM":"x"}}"#).unwrap();
        assert_eq!(topic, Topic::SrfFunc);
        assert_eq!(body["SM"], "x");
        assert!(matches!(parse_cloud_message(br#"{"T":99}"#), Err(MessageError::UnknownTopic(99))));
        assert!(matches!(parse_cloud_message(b"nope"), Err(MessageError::Json(_))));
    }

    #[test]
    fn long_ssid_lists_are_split() {
        let mut bench = Bench::new();
        bench.mgr.link.last_scan = (0..23)
            .map(|i| ScannedNetwork { ssid: format!("net{i}"), rssi: -40 - i })
            .collect();
        bench.mgr.queue_telemetry(true).unwrap();

        let parts: Vec<Value> = bench.mgr.queue().iter().map(|m| serde_json::from_slice(&m.payload).unwrap()).collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["M"]["parts"], 3);
        assert_eq!(parts[2]["M"]["part"], 3);
        assert_eq!(parts[2]["M"]["ssids"].as_array().unwrap().len(), 3);
        assert!(bench.mgr.queue().iter().all(|m| m.priority == priority::TELEMETRY));
    }

    #[test]
    fn telemetry_without_ssids_is_one_message() {
        let mut bench = Bench::new();
        bench.mgr.link.last_scan = vec![ScannedNetwork { ssid: "a".into(), rssi: -50 }];
        bench.mgr.queue_telemetry(false).unwrap();
        assert_eq!(bench.mgr.queue().len(), 1);
        let msg: Value = serde_json::from_slice(&bench.mgr.queue().front().unwrap().payload).unwrap();
        assert!(msg["M"]["ssids"].as_array().unwrap().is_empty());
    }
}
