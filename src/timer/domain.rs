//! Temporizadores de una sola vez del gestor.
//!
//! El worker arma y detiene temporizadores a través de `TimerBank`, que lleva
//! un espejo de los vencimientos (para consultar el tiempo restante) y reenvía
//! el comando a la tarea de temporización. Cada armado tiene una generación;
//! un disparo con generación vieja se descarta.


use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::error;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Escaneo / telemetría (periodo S).
    Scan,
    /// Drenado de la cola (periodo Q).
    QueueDrain,
    FotaStep,
    FotaVersionCheck,
    FotaInProgressCheck,
    FotaDownloadMonitor,
    /// FOTA programada tras conectar el USB.
    UsbFota,
    Reboot,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Arm { kind: TimerKind, generation: u64, after: Duration },
    Stop { kind: TimerKind },
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Armed {
    deadline_ms: u64,
    generation: u64,
}


#[derive(Debug, Default)]
pub struct TimerBank {
    armed: HashMap<TimerKind, Armed>,
    next_generation: u64,
    tx: Option<mpsc::UnboundedSender<TimerCommand>>,
}


impl TimerBank {
    /// El canal de comandos no tiene límite: un armado nunca se pierde por
    /// saturación mientras la tarea de temporización siga viva.
    pub fn new(tx: mpsc::UnboundedSender<TimerCommand>) -> Self {
        Self { armed: HashMap::new(), next_generation: 1, tx: Some(tx) }
    }

    /// Banco sin tarea asociada; sólo lleva el espejo de vencimientos.
    pub fn detached() -> Self {
        Self { next_generation: 1, ..Self::default() }
    }

    /// Arma (o rearma) `kind` para que dispare dentro de `after`.
    ///
    /// Devuelve `false` si la tarea de temporización ya no recibe comandos; en
    /// ese caso el espejo no queda marcado como armado.
    pub fn arm(&mut self, kind: TimerKind, after: Duration, now_ms: u64) -> bool {
        let generation = self.next_generation;
        self.next_generation += 1;
        let previous = self.armed.insert(kind, Armed { deadline_ms: now_ms + after.as_millis() as u64, generation });
        if self.send(TimerCommand::Arm { kind, generation, after }) {
            return true;
        }
        match previous {
            Some(p) => self.armed.insert(kind, p),
            None => self.armed.remove(&kind),
        };
        false
    }

    pub fn stop(&mut self, kind: TimerKind) {
        if self.armed.remove(&kind).is_some() {
            self.send(TimerCommand::Stop { kind });
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Tiempo que falta para el disparo; cero si no está armado.
    pub fn remaining(&self, kind: TimerKind, now_ms: u64) -> Duration {
        self.armed
            .get(&kind)
            .map(|a| Duration::from_millis(a.deadline_ms.saturating_sub(now_ms)))
            .unwrap_or(Duration::ZERO)
    }

    /// Acepta un disparo si corresponde al armado vigente y lo desarma.
    pub fn accept_fire(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.armed.get(&kind) {
            Some(a) if a.generation == generation => {
                self.armed.remove(&kind);
                true
            }
            _ => false,
        }
    }

    /// Generación vigente de `kind`, para disparos simulados en pruebas.
    pub fn generation(&self, kind: TimerKind) -> Option<u64> {
        self.armed.get(&kind).map(|a| a.generation)
    }

    fn send(&self, cmd: TimerCommand) -> bool {
        let Some(tx) = &self.tx else {
            return true;
        };
        match tx.send(cmd) {
            Ok(()) => true,
            Err(e) => {
                error!("Error: no se pudo enviar el comando {:?} a la tarea de temporización", e.0);
                false
            }
        }
    }
}
