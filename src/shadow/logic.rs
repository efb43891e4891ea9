//! Reconciliador del shadow.
//!
//! Compara campo por campo el documento entrante con el persistido. Sólo lo
//! que realmente difiere se aplica y se marca como cambiado; reaplicar un
//! documento idéntico no republica nada.


use serde_json::Value;
use tracing::{error, info, instrument, warn};
use crate::config::{fota as fota_limits, priority, storage, transport};
use crate::context::domain::AppContext;
use crate::manager::domain::CommManager;
use crate::message::domain::{MessageError, Topic};
use super::domain::{ReconcileResult, SafeZone, ShadowDelta, ShadowDocument, ShadowError, ShadowField};


/// Carga el shadow persistido. Un documento ausente, ilegible o fuera de rango
/// se reemplaza por los valores por defecto y se vuelve a escribir.
pub fn load_shadow(ctx: &AppContext) -> ShadowDocument {
    let stored = match ctx.storage.load(storage::SHADOW_KEY) {
        Ok(Some(bytes)) => match serde_json::from_slice::<ShadowDocument>(&bytes) {
            Ok(doc) => match doc.vars.validate() {
                Ok(()) => Some(doc),
                Err(e) => {
                    warn!("Warning: shadow persistido inválido ({}), se usan valores por defecto", e);
                    None
                }
            },
            Err(e) => {
                warn!("Warning: shadow persistido ilegible ({}), se usan valores por defecto", e);
                None
            }
        },
        Ok(None) => {
            info!("Info: no hay shadow persistido, se crea uno por defecto");
            None
        }
        Err(e) => {
            error!("Error: no se pudo leer el shadow: {}", e);
            None
        }
    };

    let mut doc = stored.unwrap_or_default();
    doc.normalize();
    doc.mcu_version = ctx.system.app_version;
    if let Err(e) = write_shadow(ctx, &doc) {
        error!("Error: no se pudo guardar el shadow: {}", e);
    }
    doc
}


fn write_shadow(ctx: &AppContext, doc: &ShadowDocument) -> Result<(), ShadowError> {
    let bytes = serde_json::to_vec_pretty(doc)?;
    ctx.storage.save(storage::SHADOW_KEY, &bytes)?;
    Ok(())
}


impl CommManager {

    pub(crate) fn persist_shadow(&self) {
        if let Err(e) = write_shadow(&self.ctx, &self.shadow) {
            error!("Error: no se pudo guardar el shadow: {}", e);
        }
    }

    /// Encola el estado efectivo del shadow.
    pub fn queue_shadow_report(&mut self) -> Result<(), MessageError> {
        let doc = self.shadow.clone();
        self.submit(Topic::ShadowProxy, priority::SHADOW, doc)
    }

    /// Lleva la configuración de movimiento del shadow a la IMU.
    pub(crate) fn apply_motion_settings(&self) {
        let platform = &self.ctx.platform;
        let results = [
            platform.set_motion_threshold(self.shadow.motion_threshold),
            platform.set_motion_detection(self.shadow.motion_detection),
            platform.set_motion_duration(self.shadow.motion_duration),
        ];
        for e in results.into_iter().filter_map(Result::err) {
            warn!("Warning: no se pudo aplicar la configuración de movimiento: {}", e);
        }
    }

    pub fn set_fota_in_progress_duration(&mut self, secs: u32) -> Result<(), ShadowError> {
        if !(fota_limits::IN_PROGRESS_MIN_SECS..=fota_limits::IN_PROGRESS_MAX_SECS).contains(&secs) {
            return Err(ShadowError::FotaTimer(secs));
        }
        if self.shadow.fota_in_progress_secs != secs {
            self.shadow.fota_in_progress_secs = secs;
            self.persist_shadow();
        }
        Ok(())
    }

    /// Aplica un documento shadow recibido de la nube.
    ///
    /// # Flujo de Trabajo
    /// 1. Arma el documento candidato (campos ausentes = sin cambio).
    /// 2. Variables de planificación: se validan como grupo.
    /// 3. Movimiento: se empuja a la IMU antes de marcar el campo.
    /// 4. Zonas: vaciar un SSID borra primero la red guardada en el chip; si el
    ///    borrado falla, la zona queda como estaba.
    /// 5. Si algo cambió, persiste y encola el shadow efectivo.
    #[instrument(name = "apply_incoming_shadow", skip(self, body))]
    pub fn apply_incoming_shadow(&mut self, body: &Value) -> Result<ReconcileResult, ShadowError> {
        let delta: ShadowDelta = serde_json::from_value(body.clone())?;
        let candidate = delta.candidate(&self.shadow);
        let mut result = ReconcileResult::default();

        let before = self.shadow.vars;
        if candidate.vars != before {
            match self.set_vars(candidate.vars, false) {
                Ok(()) if self.shadow.vars != before => result.changed.push(ShadowField::ScheduleVars),
                Ok(()) => {}
                Err(e) => {
                    warn!("Warning: variables de planificación rechazadas: {}", e);
                    result.rejected.push(ShadowField::ScheduleVars);
                }
            }
        }

        self.reconcile_motion(&candidate, &mut result);

        if candidate.fota_in_progress_secs != self.shadow.fota_in_progress_secs {
            match self.set_fota_in_progress_duration(candidate.fota_in_progress_secs) {
                Ok(()) => result.changed.push(ShadowField::FotaTimer),
                Err(e) => {
                    warn!("Warning: {}", e);
                    result.rejected.push(ShadowField::FotaTimer);
                }
            }
        }

        for (index, wanted) in candidate.zones.iter().enumerate() {
            if *wanted == self.shadow.zones[index] {
                continue;
            }
            match self.reconcile_zone(index, wanted) {
                Ok(()) => result.changed.push(ShadowField::Zone(index)),
                Err(e) => {
                    warn!("Warning: zona {} sin cambios: {}", index, e);
                    result.rejected.push(ShadowField::Zone(index));
                }
            }
        }

        if !result.changed.is_empty() {
            info!("Info: shadow actualizado: {:?}", result.changed);
            self.persist_shadow();
            match self.queue_shadow_report() {
                Ok(()) => result.republished = true,
                Err(e) => warn!("Warning: no se pudo encolar el shadow: {}", e),
            }
        }
        Ok(result)
    }

    fn reconcile_motion(&mut self, candidate: &ShadowDocument, result: &mut ReconcileResult) {
        let platform = self.ctx.platform.clone();
        if candidate.motion_threshold != self.shadow.motion_threshold {
            match platform.set_motion_threshold(candidate.motion_threshold) {
                Ok(()) => {
                    self.shadow.motion_threshold = candidate.motion_threshold;
                    result.changed.push(ShadowField::MotionThreshold);
                }
                Err(e) => {
                    warn!("Warning: umbral de movimiento rechazado: {}", e);
                    result.rejected.push(ShadowField::MotionThreshold);
                }
            }
        }
        if candidate.motion_detection != self.shadow.motion_detection {
            match platform.set_motion_detection(candidate.motion_detection) {
                Ok(()) => {
                    self.shadow.motion_detection = candidate.motion_detection;
                    result.changed.push(ShadowField::MotionDetection);
                }
                Err(e) => {
                    warn!("Warning: detección de movimiento rechazada: {}", e);
                    result.rejected.push(ShadowField::MotionDetection);
                }
            }
        }
        if candidate.motion_duration != self.shadow.motion_duration {
            match platform.set_motion_duration(candidate.motion_duration) {
                Ok(()) => {
                    self.shadow.motion_duration = candidate.motion_duration;
                    result.changed.push(ShadowField::MotionDuration);
                }
                Err(e) => {
                    warn!("Warning: duración de movimiento rechazada: {}", e);
                    result.rejected.push(ShadowField::MotionDuration);
                }
            }
        }
    }

    /// Las zonas se crean desde la app; la nube sólo puede vaciarlas o cambiar
    /// su marca de seguridad.
    fn reconcile_zone(&mut self, index: usize, wanted: &SafeZone) -> Result<(), ShadowError> {
        let current = &self.shadow.zones[index];
        if wanted.ssid.is_empty() && !current.ssid.is_empty() {
            self.ctx
                .wifi
                .delete_saved_network(index, transport::CREDENTIALS_TIMEOUT)
                .map_err(|e| ShadowError::ZoneDevice(index, e))?;
            self.shadow.zones[index] = SafeZone::default();
            return Ok(());
        }
        if wanted.ssid != current.ssid {
            return Err(ShadowError::ZoneRename(index));
        }
        self.ctx
            .wifi
            .set_zone_safe(index, wanted.safe, transport::CREDENTIALS_TIMEOUT)
            .map_err(|e| ShadowError::ZoneDevice(index, e))?;
        self.shadow.zones[index].safe = wanted.safe;
        Ok(())
    }
}
