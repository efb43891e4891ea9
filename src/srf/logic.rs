//! Despachador de comandos remotos seguros.
//!
//! Todo comando recibido, válido o no, produce exactamente una respuesta
//! `OK`/`ERROR`. Las validaciones terminan antes de cualquier efecto.


use serde_json::Value;
use std::time::Duration;
use tracing::{info, instrument, warn};
use crate::config::{priority, transport};
use crate::manager::domain::CommManager;
use crate::message::domain::{MessageError, SrfNonceBody, SrfResponseBody, Topic};
use crate::schedule::domain::FmdExit;
use crate::schedule::logic::FmdStart;
use crate::shadow::domain::SafeZone;
use crate::timer::domain::TimerKind;
use super::domain::{SrfCommand, SrfError, SrfReply, SrfRequest};


impl CommManager {

    /// Publica el nonce vigente, generándolo si todavía no existe.
    pub fn queue_srf_nonce(&mut self) -> Result<(), MessageError> {
        if self.srf.nonce == 0 {
            self.srf.regenerate();
        }
        let nonce = self.srf.nonce.to_string();
        self.submit(Topic::SrfNonce, priority::SRF_NONCE, SrfNonceBody { nonce })
    }

    /// Invalida el nonce actual y publica uno nuevo.
    pub(crate) fn rotate_srf_nonce(&mut self) {
        self.srf.regenerate();
        let result = self.queue_srf_nonce();
        self.log_produce("nonce SRF", result);
    }

    /// Procesa un mensaje SRF (`{"SM": "header.payload.firma"}`).
    ///
    /// # Flujo de Trabajo
    /// 1. Decodifica el sobre.
    /// 2. Valida nonce, audiencia y expiración, en ese orden.
    /// 3. Ejecuta el comando.
    /// 4. Encola la respuesta. Un `REBOOT` además drena la cola y recién
    ///    entonces arma el temporizador de reinicio.
    /// 5. Tras un nonce válido, lo rota para que el sobre no pueda repetirse.
    #[instrument(name = "srf", skip(self, body))]
    pub fn handle_srf_message(&mut self, body: &Value) -> SrfReply {
        let request = match body.get("SM").and_then(Value::as_str) {
            Some(sm) => SrfRequest::decode(sm),
            None => Err(SrfError::MissingEnvelope),
        };

        let mut nonce_used = false;
        let (request_id, command) = match request {
            Ok(request) => {
                let request_id = request.request_id.clone();
                let now = self.ctx.clock.unix_time();
                let checked = request.validate(self.srf.nonce, &self.ctx.system.serial_number, now);
                nonce_used = !matches!(checked, Err(SrfError::NonceMismatch));
                (request_id, checked.and_then(|()| request.into_command()))
            }
            Err(e) => (String::new(), Err(e)),
        };

        let reboot_after = match &command {
            Ok(SrfCommand::Reboot { delay }) => Some(*delay),
            _ => None,
        };
        let reply = match command {
            Ok(command) => {
                info!("Info: comando SRF {:?}", command);
                self.dispatch(command)
            }
            Err(e) => {
                warn!("Warning: comando SRF rechazado: {}", e);
                SrfReply::Error(e.response_text().to_string())
            }
        };

        self.queue_srf_response(&request_id, &reply);
        if let Some(delay) = reboot_after {
            self.drain_queue();
            info!("Info: reinicio remoto en {:?}", delay);
            self.arm(TimerKind::Reboot, delay);
        }
        if nonce_used {
            self.rotate_srf_nonce();
        }
        reply
    }

    fn dispatch(&mut self, command: SrfCommand) -> SrfReply {
        match command {
            SrfCommand::WhereIsMyDog { request_id } => match self.queue_locate(Some(request_id)) {
                Ok(()) => SrfReply::Ok("Location report queued".into()),
                Err(e) => SrfReply::Error(format!("Location report failed: {e}")),
            },
            SrfCommand::FindMyDog { enable: true, duration_minutes } => match self.enable_fmd(duration_minutes) {
                FmdStart::Started => SrfReply::Ok("FMD enabled".into()),
                FmdStart::AlreadyActive => SrfReply::Ok("FMD already active".into()),
                FmdStart::InSafeZone => SrfReply::Error("Device is in a safe zone".into()),
            },
            SrfCommand::FindMyDog { enable: false, .. } => {
                if self.disable_fmd(FmdExit::CloudRequest) {
                    SrfReply::Ok("FMD disabled".into())
                } else {
                    SrfReply::Ok("FMD not active".into())
                }
            }
            SrfCommand::CheckFota => match self.fota_update_all_devices() {
                Ok(()) => SrfReply::Ok("FOTA check started".into()),
                Err(e) => SrfReply::Error(e.to_string()),
            },
            SrfCommand::GpsEnable { period_secs } => self.set_gps_period(period_secs),
            SrfCommand::FactoryReset => self.factory_reset(),
            SrfCommand::Noop => SrfReply::Ok("NOOP".into()),
            SrfCommand::Reboot { delay } => SrfReply::Ok(format!("Rebooting in {} s", delay.as_secs())),
        }
    }

    fn set_gps_period(&mut self, period_secs: u32) -> SrfReply {
        let result = if period_secs == 0 {
            self.ctx.modem.disable_gps()
        } else {
            self.ctx.modem.enable_gps(period_secs)
        };
        match result {
            Ok(()) => {
                self.shadow.gps_poll_secs = period_secs;
                self.persist_shadow();
                SrfReply::Ok(format!("GPS period {period_secs} s"))
            }
            Err(e) => SrfReply::Error(format!("GPS update failed: {e}")),
        }
    }

    /// Borra credenciales y zonas antes de responder.
    fn factory_reset(&mut self) -> SrfReply {
        if let Err(e) = self.ctx.wifi.delete_all_saved_networks(transport::CREDENTIALS_TIMEOUT) {
            warn!("Warning: factory reset fallido: {}", e);
            return SrfReply::Error("Factory reset failed".into());
        }
        for zone in &mut self.shadow.zones {
            *zone = SafeZone::default();
        }
        self.persist_shadow();
        let result = self.queue_shadow_report();
        self.log_produce("shadow", result);
        SrfReply::Ok("Factory reset done".into())
    }

    fn queue_srf_response(&mut self, request_id: &str, reply: &SrfReply) {
        let body = SrfResponseBody { rid: request_id.to_string(), st: reply.status(), res: reply.text().to_string() };
        let result = self.submit(Topic::SrfFunc, priority::SRF_RESPONSE, body);
        self.log_produce("respuesta SRF", result);
    }

    pub(crate) fn on_reboot_timer(&mut self) {
        self.ctx.platform.reboot("SRF reboot");
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;
    use crate::device::domain::TransportError;
    use crate::manager::domain::testing::Bench;
    use crate::radio::domain::RadioKind;
    use crate::srf::domain::encode_envelope;
    use super::*;

    const MIN_REBOOT: Duration = Duration::from_secs(crate::config::srf::REBOOT_MIN_SECS as u64);

    fn now(bench: &Bench) -> i64 {
        bench.mgr.ctx.clock.unix_time()
    }

    fn request(bench: &Bench, cmd: u8, p1: Value, p2: Value) -> Value {
        let claims = json!({
            "rid": "req-1",
            "aud": "7_C0001234",
            "exp": now(bench) + 60,
            "nonce": bench.mgr.srf.nonce.to_string(),
            "cmd": cmd,
            "p1": p1,
            "p2": p2,
        });
        json!({ "SM": encode_envelope(&claims) })
    }

    fn responses(bench: &Bench) -> Vec<Value> {
        bench.mgr.queue().iter()
            .filter(|m| m.topic == Topic::SrfFunc)
            .map(|m| serde_json::from_slice::<Value>(&m.payload).unwrap()["M"].clone())
            .collect()
    }

    fn bench() -> Bench {
        let mut bench = Bench::new();
        bench.mgr.srf.regenerate();
        bench
    }

    #[test]
    fn where_is_my_dog_reports_and_rotates_the_nonce() {
        let mut bench = bench();
        let before = bench.mgr.srf.nonce;
        let body = request(&bench, 1, json!("wmd-9"), Value::Null);

        let reply = bench.mgr.handle_srf_message(&body);
        assert_eq!(reply.status(), "OK");
        let topics: Vec<Topic> = bench.mgr.queue().iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec![Topic::Alert, Topic::SrfFunc, Topic::SrfNonce]);
        assert_eq!(responses(&bench)[0]["rid"], "req-1");
        assert_ne!(bench.mgr.srf.nonce, before);

        // El mismo sobre ya no sirve.
        let replay = bench.mgr.handle_srf_message(&body);
        assert_eq!(replay, SrfReply::Error("Invalid nonce".into()));
    }

    #[test]
    fn nonce_mismatch_has_no_side_effects() {
        let mut bench = bench();
        let body = request(&bench, 6, Value::Null, Value::Null);
        bench.mgr.srf.regenerate();
        let nonce = bench.mgr.srf.nonce;

        let reply = bench.mgr.handle_srf_message(&body);
        assert_eq!(reply, SrfReply::Error("Invalid nonce".into()));
        assert!(!bench.device.state().all_networks_deleted);
        assert_eq!(bench.mgr.srf.nonce, nonce);
        let topics: Vec<Topic> = bench.mgr.queue().iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec![Topic::SrfFunc]);
        assert_eq!(responses(&bench)[0]["st"], "ERROR");
    }

    #[test]
    fn wrong_audience_and_expired_commands_are_rejected() {
        let mut bench = bench();
        let claims = json!({
            "rid": "r", "aud": "7_C9999999", "exp": now(&bench) + 60,
            "nonce": bench.mgr.srf.nonce.to_string(), "cmd": 0,
        });
        let reply = bench.mgr.handle_srf_message(&json!({ "SM": encode_envelope(&claims) }));
        assert_eq!(reply, SrfReply::Error("Invalid audience".into()));

        let claims = json!({
            "rid": "r", "aud": "7_C0001234", "exp": now(&bench) - 1,
            "nonce": bench.mgr.srf.nonce.to_string(), "cmd": 0,
        });
        let reply = bench.mgr.handle_srf_message(&json!({ "SM": encode_envelope(&claims) }));
        assert_eq!(reply, SrfReply::Error("Command expired".into()));
    }

    #[test]
    fn malformed_envelope_still_gets_a_response() {
        let mut bench = bench();
        assert_eq!(bench.mgr.handle_srf_message(&json!({})).status(), "ERROR");
        assert_eq!(bench.mgr.handle_srf_message(&json!({ "SM": "only.two" })).status(), "ERROR");
        assert_eq!(responses(&bench).len(), 2);
    }

    #[test]
    fn reboot_flushes_the_response_before_waiting() {
        let mut bench = bench();
        bench.device.state().connect(RadioKind::Cellular);
        bench.mgr.link.onboarded = true;
        let body = request(&bench, 3, json!(1), Value::Null);

        let reply = bench.mgr.handle_srf_message(&body);
        assert_eq!(reply, SrfReply::Ok("Rebooting in 10 s".into()));
        let sent = bench.device.state().sent.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].json()["M"]["st"], "OK");
        assert!(bench.device.state().reboots.is_empty());
        assert_eq!(bench.mgr.timers.remaining(TimerKind::Reboot, bench.mgr.now_ms()), MIN_REBOOT);

        bench.clock.advance(MIN_REBOOT);
        assert!(bench.fire(TimerKind::Reboot));
        assert_eq!(bench.device.state().reboots, vec!["SRF reboot".to_string()]);
    }

    #[test]
    fn reboot_waits_even_if_the_response_could_not_be_sent() {
        let mut bench = bench();
        bench.device.state().connect(RadioKind::Cellular);
        bench.mgr.link.onboarded = true;
        bench.device.state().send_script.push_back(Err(TransportError::Timeout));
        let body = request(&bench, 3, json!(7200), Value::Null);

        bench.mgr.handle_srf_message(&body);
        assert!(bench.device.state().sent.is_empty());
        assert_eq!(bench.mgr.timers.remaining(TimerKind::Reboot, 0), Duration::from_secs(3600));
    }

    #[test]
    fn factory_reset_clears_zones_only_when_the_chip_agrees() {
        let mut bench = bench();
        bench.mgr.shadow.zones[0] = SafeZone { ssid: "home".into(), safe: true };
        bench.device.state().delete_fails = true;
        let reply = bench.mgr.handle_srf_message(&request(&bench, 6, Value::Null, Value::Null));
        assert_eq!(reply, SrfReply::Error("Factory reset failed".into()));
        assert_eq!(bench.mgr.shadow().zones[0].ssid, "home");

        bench.device.state().delete_fails = false;
        let reply = bench.mgr.handle_srf_message(&request(&bench, 6, Value::Null, Value::Null));
        assert_eq!(reply.status(), "OK");
        assert!(bench.device.state().all_networks_deleted);
        assert_eq!(bench.mgr.shadow().zones[0], SafeZone::default());
    }

    #[test]
    fn find_my_dog_and_gps_commands() {
        let mut bench = bench();
        let reply = bench.mgr.handle_srf_message(&request(&bench, 2, json!(1), json!(15)));
        assert_eq!(reply, SrfReply::Ok("FMD enabled".into()));
        assert!(bench.mgr.schedule.fmd_active());

        let reply = bench.mgr.handle_srf_message(&request(&bench, 2, json!(0), Value::Null));
        assert_eq!(reply, SrfReply::Ok("FMD disabled".into()));
        assert_eq!(bench.mgr.schedule.fmd.last_exit, FmdExit::CloudRequest);

        let reply = bench.mgr.handle_srf_message(&request(&bench, 5, json!(120), Value::Null));
        assert_eq!(reply.status(), "OK");
        assert_eq!(bench.device.state().gps_period, Some(120));
        assert_eq!(bench.mgr.shadow().gps_poll_secs, 120);
    }
}
