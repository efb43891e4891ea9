use std::sync::Arc;
use tracing::{error, info};
use crate::channels::domain::Channels;
use crate::context::domain::AppContext;
use crate::device::domain::SystemClock;
use crate::device::sim::SimDevice;
use crate::device::storage::FileStorage;
use crate::manager::domain::{CommManager, WorkItem};
use crate::manager::logic::start_comm_manager;
use crate::radio::domain::RadioKind;
use crate::system::domain::{init_tracing, System};
use crate::timer::domain::TimerBank;
use crate::timer::logic::start_timer_wheel;

mod channels;
mod config;
mod context;
mod device;
mod fota;
mod manager;
mod message;
mod queue;
mod radio;
mod safezone;
mod schedule;
mod shadow;
mod srf;
mod system;
mod timer;


#[tokio::main]
async fn main() {

    let system = match System::new() {
        Ok(system) => Arc::new(system),
        Err(e) => {
            eprintln!("Error: configuración inválida: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&system);

    let storage = match FileStorage::new(system.data_dir.clone()) {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            error!("Error: no se pudo abrir el directorio de datos: {}", e);
            std::process::exit(1);
        }
    };

    // Sin adaptadores de hardware reales, el proceso corre sobre el dispositivo simulado.
    let device = Arc::new(SimDevice::new(system.app_version));
    device.state().auto_switch = true;

    let app_context = AppContext::with_device(system.clone(), device.clone(), storage, Arc::new(SystemClock::new()));
    let channels = Channels::new();

    let mut manager = CommManager::new(app_context, TimerBank::new(channels.timer_cmd_tx));
    manager.start();

    start_timer_wheel(channels.work_tx.clone(), channels.timer_cmd_rx);
    start_comm_manager(channels.work_rx, manager);

    device.state().connect(RadioKind::Wifi);
    if channels.work_tx.send(WorkItem::RadioSwitched(RadioKind::Wifi)).await.is_err() {
        error!("Error: no se pudo avisar el cambio de radio al gestor");
    }

    info!("Info: gestor de comunicaciones {} en marcha", system.machine_id());
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Error: no se pudo esperar la señal de apagado: {}", e);
    }
    info!("Info: apagando");
}
