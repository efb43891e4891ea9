//! Contexto de Aplicación (dependencias compartidas).
//!
//! `AppContext` agrupa la configuración y los colaboradores externos que el
//! gestor consume. Es barato de clonar: todo vive detrás de `Arc`.


use std::sync::Arc;
use crate::device::domain::{Clock, Modem, Platform, RadioManager, Storage, Transport, Updater, WifiControl};
use crate::system::domain::System;


#[derive(Clone)]
pub struct AppContext {
    pub system: Arc<System>,
    pub radio: Arc<dyn RadioManager>,
    pub transport: Arc<dyn Transport>,
    pub wifi: Arc<dyn WifiControl>,
    pub modem: Arc<dyn Modem>,
    pub updater: Arc<dyn Updater>,
    pub platform: Arc<dyn Platform>,
    pub storage: Arc<dyn Storage>,
    pub clock: Arc<dyn Clock>,
}


impl AppContext {
    /// Construye el contexto a partir de un único backend que implementa todas
    /// las interfaces de hardware.
    pub fn with_device<D>(system: Arc<System>,
                          device: Arc<D>,
                          storage: Arc<dyn Storage>,
                          clock: Arc<dyn Clock>) -> Self
    where
        D: RadioManager + Transport + WifiControl + Modem + Updater + Platform + 'static,
    {
        Self {
            system,
            radio: device.clone(),
            transport: device.clone(),
            wifi: device.clone(),
            modem: device.clone(),
            updater: device.clone(),
            platform: device,
            storage,
            clock,
        }
    }
}
