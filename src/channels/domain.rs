use tokio::sync::mpsc;
use crate::config::inbox;
use crate::manager::domain::WorkItem;
use crate::timer::domain::TimerCommand;


pub struct Channels {
    /// Bandeja del worker. Se clona para cada productor externo.
    pub work_tx: mpsc::Sender<WorkItem>,
    pub work_rx: mpsc::Receiver<WorkItem>,

    /// Sin límite: perder un armado detendría un ciclo periódico.
    pub timer_cmd_tx: mpsc::UnboundedSender<TimerCommand>,
    pub timer_cmd_rx: mpsc::UnboundedReceiver<TimerCommand>,
}


impl Channels {
    pub fn new() -> Channels {
        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(inbox::WORK_QUEUE_DEPTH);
        let (timer_cmd_tx, timer_cmd_rx) = mpsc::unbounded_channel::<TimerCommand>();

        Self {
            work_tx,
            work_rx,
            timer_cmd_tx,
            timer_cmd_rx,
        }
    }
}
