use crate::kiosk::Kiosk;
use std::sync::Arc;
use zbus::interface;

/// D-Bus control interface for the kiosk daemon.
///
/// Bus name: org.rollcall.Kiosk1
/// Object path: /org/rollcall/Kiosk1
pub struct KioskService {
    kiosk: Arc<Kiosk>,
}

impl KioskService {
    pub fn new(kiosk: Arc<Kiosk>) -> Self {
        Self { kiosk }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.rollcall.Kiosk1")]
impl KioskService {
    /// Start scanning. After a device failure this is the retry action;
    /// on failure the error carries the message meant for the user.
    async fn start(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start requested");
        match self.kiosk.start().await {
            Ok(status) => to_json(&status),
            Err(err) => Err(zbus::fdo::Error::Failed(err.user_message())),
        }
    }

    /// Stop scanning and release the camera.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop requested");
        Ok(self.kiosk.stop().await)
    }

    /// Daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.kiosk.status().await)
    }
}
