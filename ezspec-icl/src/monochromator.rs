#![warn(clippy::pedantic)]
#![warn(clippy::all)]

use std::time::{Duration, Instant};

use async_std::sync::{Arc, Mutex};
use async_std::task;
use serde_json::{json, Value};

use crate::link::IclLink;
use crate::protocol::{self, IclError, IclResult};

const BUSY_POLL: Duration = Duration::from_millis(100);

/// Slit selector, by mount position on the monochromator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Slit {
    EntranceFront = 0,
    EntranceSide = 1,
    ExitFront = 2,
    ExitSide = 3,
}

/// Handle for one monochromator behind the ICL. Movement commands return as
/// soon as the service accepts them; callers poll [`Self::is_busy`] or use
/// [`Self::wait_not_busy`] before the next optical command.
#[derive(Debug, Clone)]
pub struct Monochromator {
    link: Arc<Mutex<IclLink>>,
    index: u32,
}

impl Monochromator {
    pub(crate) fn new(link: Arc<Mutex<IclLink>>, index: u32) -> Self {
        Monochromator { link, index }
    }

    async fn call(&self, command: &str, parameters: Value) -> IclResult<Value> {
        self.link.lock().await.request(command, parameters).await
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn open(&self) -> IclResult<()> {
        self.call("mono_open", json!({"index": self.index})).await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn close(&self) -> IclResult<()> {
        self.call("mono_close", json!({"index": self.index})).await?;
        Ok(())
    }

    /// Start the motor initialization sequence. The device stays busy until
    /// homing completes.
    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn initialize(&self) -> IclResult<()> {
        self.call("mono_init", json!({"index": self.index})).await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn is_busy(&self) -> IclResult<bool> {
        let results = self.call("mono_isBusy", json!({"index": self.index})).await?;
        protocol::field_bool(&results, "mono_isBusy", "busy")
    }

    /// Poll until the device reports not-busy.
    /// # Errors
    /// Returns ``IclError::BusyTimeout`` if the device is still busy after
    /// `limit`, and propagates any transport or device error.
    pub async fn wait_not_busy(&self, limit: Duration) -> IclResult<()> {
        let deadline = Instant::now() + limit;
        while self.is_busy().await? {
            if Instant::now() > deadline {
                return Err(IclError::BusyTimeout {
                    operation: "monochromator movement",
                    limit_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                });
            }
            task::sleep(BUSY_POLL).await;
        }
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn wavelength_nm(&self) -> IclResult<f64> {
        let results = self
            .call("mono_getPosition", json!({"index": self.index}))
            .await?;
        protocol::field_f64(&results, "mono_getPosition", "wavelength")
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn move_to_wavelength(&self, wavelength_nm: f64) -> IclResult<()> {
        self.call(
            "mono_moveToPosition",
            json!({"index": self.index, "wavelength": wavelength_nm}),
        )
        .await?;
        Ok(())
    }

    /// Rotate the turret to the given grating position.
    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn move_grating(&self, grating_index: u32) -> IclResult<()> {
        self.call(
            "mono_moveGrating",
            json!({"index": self.index, "gratingIndex": grating_index}),
        )
        .await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn move_slit_mm(&self, slit: Slit, position_mm: f64) -> IclResult<()> {
        self.call(
            "mono_moveSlitMM",
            json!({"index": self.index, "id": slit as u32, "position": position_mm}),
        )
        .await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn open_shutter(&self) -> IclResult<()> {
        self.call("mono_shutterOpen", json!({"index": self.index}))
            .await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn close_shutter(&self) -> IclResult<()> {
        self.call("mono_shutterClose", json!({"index": self.index}))
            .await?;
        Ok(())
    }
}
