//! Tarea de temporización.
//!
//! Recibe `TimerCommand`s del worker y, al vencer cada temporizador, devuelve
//! `WorkItem::TimerFired` a la bandeja de entrada. Nunca toca el estado del
//! gestor.


use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, instrument};
use crate::manager::domain::WorkItem;
use super::domain::{TimerCommand, TimerKind};


/// Bucle principal de la tarea de temporización.
///
/// # Flujo de Trabajo
/// 1. Calcula el vencimiento más próximo.
/// 2. Espera a la vez un comando nuevo o ese vencimiento.
/// 3. Al vencer, envía `WorkItem::TimerFired` con la generación armada.
///
/// Termina cuando se cierra el canal de comandos.
#[instrument(name = "run_timer_wheel", skip(tx_work, rx_cmd))]
pub async fn run_timer_wheel(tx_work: mpsc::Sender<WorkItem>,
                             mut rx_cmd: mpsc::UnboundedReceiver<TimerCommand>) {

    info!("Info: tarea de temporización creada");

    let mut pending: HashMap<TimerKind, (Instant, u64)> = HashMap::new();

    loop {
        let next = pending
            .iter()
            .min_by_key(|(_, (at, _))| *at)
            .map(|(kind, (at, generation))| (*kind, *at, *generation));
        let deadline = next
            .map(|(_, at, _)| at)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            cmd = rx_cmd.recv() => match cmd {
                Some(TimerCommand::Arm { kind, generation, after }) => {
                    debug!("Debug: temporizador {:?} armado por {:?}", kind, after);
                    pending.insert(kind, (Instant::now() + after, generation));
                }
                Some(TimerCommand::Stop { kind }) => {
                    pending.remove(&kind);
                }
                None => break,
            },
            _ = sleep_until(deadline), if next.is_some() => {
                if let Some((kind, _, generation)) = next {
                    pending.remove(&kind);
                    if tx_work.send(WorkItem::TimerFired { kind, generation }).await.is_err() {
                        error!("Error: no se pudo enviar el disparo de {:?} al gestor", kind);
                        break;
                    }
                }
            }
        }
    }
    info!("Info: tarea de temporización finalizada");
}


pub fn start_timer_wheel(tx_work: mpsc::Sender<WorkItem>,
                         rx_cmd: mpsc::UnboundedReceiver<TimerCommand>) {

    info!("Info: iniciando tarea de temporización");
    tokio::spawn(async move {
        run_timer_wheel(tx_work, rx_cmd).await;
    });
}
