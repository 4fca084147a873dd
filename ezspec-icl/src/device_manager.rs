#![warn(clippy::pedantic)]
#![warn(clippy::all)]

use std::process::{Child, Command};
use std::time::Duration;

use async_std::sync::{Arc, Mutex};
use async_std::task;
use serde_json::{json, Value};

use crate::ccd::ChargeCoupledDevice;
use crate::link::{self, IclLink};
use crate::monochromator::Monochromator;
use crate::protocol::{self, IclError, IclResult};

#[derive(Debug, Clone)]
pub struct IclConfig {
    pub address: String,
    pub port: u16,
    /// Launch `executable` if the first connection attempt is refused.
    pub spawn: bool,
    pub executable: String,
    pub request_timeout_ms: u64,
}

impl Default for IclConfig {
    fn default() -> Self {
        IclConfig {
            address: link::DEFAULT_ADDRESS.to_owned(),
            port: link::DEFAULT_PORT,
            spawn: false,
            executable: "icl".to_owned(),
            request_timeout_ms: link::DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

/// Owner of one ICL session. Hands out device handles sharing its
/// connection; [`Self::stop`] closes every listed device and shuts the
/// service down if this process launched it.
#[derive(Debug)]
pub struct DeviceManager {
    link: Arc<Mutex<IclLink>>,
    mono_count: u32,
    ccd_count: u32,
    owns_icl: bool,
    child: Option<Child>,
    stopped: bool,
}

impl DeviceManager {
    /// Connect (optionally launching the service), log its identity, switch
    /// replies to text mode and run device discovery.
    /// # Errors
    /// Propagates connection, spawn and protocol errors. A refused
    /// connection with `spawn` unset surfaces as ``IclError::Unreachable``.
    pub async fn start(cfg: &IclConfig) -> IclResult<Self> {
        let mut child = None;
        let mut owns_icl = false;
        let mut link = match IclLink::connect(&cfg.address, cfg.port).await {
            Ok(link) => link,
            Err(err) => {
                if !(cfg.spawn && matches!(err, IclError::Unreachable { .. })) {
                    return Err(err);
                }
                log::info!(
                    "ICL not reachable at {}:{}; launching `{}`",
                    cfg.address,
                    cfg.port,
                    cfg.executable
                );
                child = Some(Command::new(&cfg.executable).spawn().map_err(|source| {
                    IclError::Spawn {
                        exe: cfg.executable.clone(),
                        source,
                    }
                })?);
                owns_icl = true;
                connect_retry(cfg).await?
            }
        };
        link.set_request_timeout(Duration::from_millis(cfg.request_timeout_ms));

        let mut dm = DeviceManager {
            link: Arc::new(Mutex::new(link)),
            mono_count: 0,
            ccd_count: 0,
            owns_icl,
            child,
            stopped: false,
        };
        let info = dm.icl_info().await?;
        log::info!(
            "connected to ICL {} (api {})",
            info.get("nodeVersion").and_then(Value::as_str).unwrap_or("?"),
            info.get("nodeApiVersion")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        );
        dm.request("icl_binMode", json!({"mode": "none"})).await?;
        dm.discover().await?;
        Ok(dm)
    }

    async fn request(&self, command: &str, parameters: Value) -> IclResult<Value> {
        self.link.lock().await.request(command, parameters).await
    }

    async fn discover(&mut self) -> IclResult<()> {
        let monos = self.request("mono_discover", json!({})).await?;
        self.mono_count = protocol::field_u32(&monos, "mono_discover", "count")?;
        let ccds = self.request("ccd_discover", json!({})).await?;
        self.ccd_count = protocol::field_u32(&ccds, "ccd_discover", "count")?;
        log::info!(
            "discovered {} monochromator(s) and {} ccd(s)",
            self.mono_count,
            self.ccd_count
        );
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport error.
    pub async fn icl_info(&self) -> IclResult<Value> {
        self.request("icl_info", json!({})).await
    }

    /// # Errors
    /// Propagates any ICL transport error.
    pub async fn monochromator_list(&self) -> IclResult<Value> {
        self.request("mono_list", json!({})).await
    }

    /// # Errors
    /// Propagates any ICL transport error.
    pub async fn ccd_list(&self) -> IclResult<Value> {
        self.request("ccd_list", json!({})).await
    }

    /// Treat the connected service as owned even though this manager did not
    /// spawn it, so [`stop`](Self::stop) sends `icl_shutdown`. Used when the
    /// caller started the service itself.
    pub fn adopt_service(&mut self) {
        self.owns_icl = true;
    }

    #[inline]
    #[must_use]
    pub fn monochromator_count(&self) -> u32 {
        self.mono_count
    }

    #[inline]
    #[must_use]
    pub fn ccd_count(&self) -> u32 {
        self.ccd_count
    }

    /// # Errors
    /// Returns ``IclError::NoDevice`` if discovery found fewer devices.
    pub fn monochromator(&self, index: u32) -> IclResult<Monochromator> {
        if index < self.mono_count {
            Ok(Monochromator::new(Arc::clone(&self.link), index))
        } else {
            Err(IclError::NoDevice {
                kind: "monochromator",
            })
        }
    }

    /// # Errors
    /// Returns ``IclError::NoDevice`` if discovery found fewer devices.
    pub fn charge_coupled_device(&self, index: u32) -> IclResult<ChargeCoupledDevice> {
        if index < self.ccd_count {
            Ok(ChargeCoupledDevice::new(Arc::clone(&self.link), index))
        } else {
            Err(IclError::NoDevice { kind: "ccd" })
        }
    }

    /// Release the session: close every listed device (best effort), shut
    /// down an owned service, and reap its process.
    /// # Errors
    /// Currently always returns Ok; close failures on a dying link are
    /// logged rather than surfaced so release runs to completion.
    pub async fn stop(mut self) -> IclResult<()> {
        for index in 0..self.ccd_count {
            if let Err(err) = self.request("ccd_close", json!({"index": index})).await {
                log::debug!("ccd_close({index}) during stop: {err}");
            }
        }
        for index in 0..self.mono_count {
            if let Err(err) = self.request("mono_close", json!({"index": index})).await {
                log::debug!("mono_close({index}) during stop: {err}");
            }
        }
        if self.owns_icl {
            if let Err(err) = self.request("icl_shutdown", json!({})).await {
                log::warn!("icl_shutdown failed: {err}");
            }
        }
        self.stopped = true;
        if let Some(mut child) = self.child.take() {
            for _ in 0..20 {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    return Ok(());
                }
                task::sleep(Duration::from_millis(100)).await;
            }
            log::warn!("ICL process did not exit after shutdown; killing it");
            let _ = child.kill();
            let _ = child.wait();
        }
        Ok(())
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if !self.stopped {
            log::warn!("device manager dropped without stop(); the ICL may still hold device sessions open");
            if let Some(mut child) = self.child.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

async fn connect_retry(cfg: &IclConfig) -> IclResult<IclLink> {
    let mut last = IclError::NoDevice { kind: "icl" };
    for _ in 0..20 {
        task::sleep(Duration::from_millis(500)).await;
        match IclLink::connect(&cfg.address, cfg.port).await {
            Ok(link) => return Ok(link),
            Err(err) => last = err,
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockIcl;

    fn mock_config(mock: &MockIcl) -> IclConfig {
        IclConfig {
            address: mock.address(),
            port: mock.port(),
            ..IclConfig::default()
        }
    }

    #[test]
    fn start_discovers_one_of_each_device() {
        task::block_on(async {
            let mock = MockIcl::spawn().await.expect("mock should bind");
            let dm = DeviceManager::start(&mock_config(&mock))
                .await
                .expect("start should succeed");
            assert_eq!(dm.monochromator_count(), 1);
            assert_eq!(dm.ccd_count(), 1);
            assert!(dm.monochromator(0).is_ok());
            assert!(dm.charge_coupled_device(0).is_ok());
            assert!(matches!(
                dm.monochromator(1),
                Err(IclError::NoDevice { kind: "monochromator" })
            ));
            dm.stop().await.expect("stop should succeed");
        });
    }

    #[test]
    fn stop_closes_devices_but_leaves_a_foreign_service_running() {
        task::block_on(async {
            let mock = MockIcl::spawn().await.expect("mock should bind");
            let dm = DeviceManager::start(&mock_config(&mock))
                .await
                .expect("start should succeed");
            dm.stop().await.expect("stop should succeed");
            let commands = mock.commands().await;
            assert!(commands.iter().any(|c| c == "ccd_close"));
            assert!(commands.iter().any(|c| c == "mono_close"));
            // we did not launch this service, so it must stay up
            assert!(!commands.iter().any(|c| c == "icl_shutdown"));
        });
    }
}
