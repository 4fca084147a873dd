#![warn(clippy::pedantic)]
#![warn(clippy::all)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

//! In-process stand-in for the ICL: a TCP server speaking the same JSON
//! protocol, backed by one simulated monochromator and one simulated CCD.
//! Movement and acquisition hold their busy flags for real (short) intervals
//! so polling paths run the same way they do against hardware. Every command
//! name is recorded, and a named command can be made to fail, which is how
//! the failure-path tests drive the stack.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_std::io::prelude::*;
use async_std::io::BufReader;
use async_std::net::{TcpListener, TcpStream};
use async_std::sync::{Arc, Mutex};
use async_std::task;
use rand::Rng;
use serde_json::{json, Value};

use crate::protocol::{IclResult, Reply, Request};

pub const MOCK_MONO_TYPE: &str = "iHR320";
pub const MOCK_CCD_TYPE: &str = "Syncerity CCD";
pub const CHIP_WIDTH: u32 = 1024;
pub const CHIP_HEIGHT: u32 = 256;

// Mercury-argon calibration lamp lines, nm and relative strength.
const HG_AR_LINES: [(f64, f64); 3] = [(546.07, 1.0), (576.96, 0.45), (579.07, 0.40)];

const INIT_MS: u64 = 120;
const GRATING_MOVE_MS: u64 = 150;
const WAVELENGTH_MOVE_MS: u64 = 60;
const SLIT_MOVE_MS: u64 = 40;

#[derive(Debug)]
struct MockState {
    wavelength_nm: f64,
    grating: u32,
    slit_mm: f64,
    gain: u32,
    speed: u32,
    exposure_ms: u64,
    acq_format: u32,
    roi: (u32, u32, u32, u32, u32, u32),
    mono_open: bool,
    ccd_open: bool,
    mono_busy_until: Instant,
    acq_busy_until: Instant,
    acquired: bool,
    commands: Vec<String>,
    fail_command: Option<String>,
}

impl MockState {
    fn new() -> Self {
        let now = Instant::now();
        MockState {
            wavelength_nm: 0.0,
            grating: 0,
            slit_mm: 0.0,
            gain: 0,
            speed: 0,
            exposure_ms: 0,
            acq_format: 0,
            roi: (0, 0, CHIP_WIDTH, CHIP_HEIGHT, 1, CHIP_HEIGHT),
            mono_open: false,
            ccd_open: false,
            mono_busy_until: now,
            acq_busy_until: now,
            acquired: false,
            commands: Vec::new(),
            fail_command: None,
        }
    }

    fn mono_busy_for(&mut self, ms: u64) {
        self.mono_busy_until = Instant::now() + Duration::from_millis(ms);
    }
}

pub struct MockIcl {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
}

impl MockIcl {
    /// Bind an ephemeral loopback port and start serving.
    /// # Errors
    /// Fails only if the loopback listener cannot be bound.
    pub async fn spawn() -> IclResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(MockState::new()));
        let accept_state = Arc::clone(&state);
        task::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                task::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });
        Ok(MockIcl { addr, state })
    }

    #[must_use]
    pub fn address(&self) -> String {
        self.addr.ip().to_string()
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Command names received so far, in order.
    pub async fn commands(&self) -> Vec<String> {
        self.state.lock().await.commands.clone()
    }

    /// Make every future occurrence of `command` fail with an error reply.
    pub async fn fail_on(&self, command: &str) {
        self.state.lock().await.fail_command = Some(command.to_owned());
    }

    pub async fn clear_failure(&self) {
        self.state.lock().await.fail_command = None;
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<MockState>>) {
    let mut reader = BufReader::new(stream.clone());
    let mut writer = stream;
    let mut buf = String::new();
    loop {
        buf.clear();
        match reader.read_line(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let Ok(request) = serde_json::from_str::<Request>(buf.trim_end()) else {
            log::warn!("mock ICL dropping malformed request line");
            break;
        };
        let reply = handle(&mut *state.lock().await, &request);
        let Ok(mut text) = serde_json::to_string(&reply) else {
            break;
        };
        text.push('\n');
        if writer.write_all(text.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn ok(req: &Request, results: Value) -> Reply {
    Reply {
        id: req.id,
        command: req.command.clone(),
        results,
        errors: Vec::new(),
    }
}

fn fail(req: &Request, message: String) -> Reply {
    Reply {
        id: req.id,
        command: req.command.clone(),
        results: Value::Null,
        errors: vec![message],
    }
}

fn param_f64(req: &Request, key: &str) -> f64 {
    req.parameters.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn param_u32(req: &Request, key: &str) -> u32 {
    req.parameters
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32
}

#[allow(clippy::too_many_lines)]
fn handle(state: &mut MockState, req: &Request) -> Reply {
    state.commands.push(req.command.clone());
    if state.fail_command.as_deref() == Some(req.command.as_str()) {
        return fail(req, format!("[E];-1;simulated failure in {}", req.command));
    }
    let now = Instant::now();
    match req.command.as_str() {
        "icl_info" => ok(
            req,
            json!({
                "nodeAlias": "MockICL",
                "nodeVersion": "1.0.0-mock",
                "nodeApiVersion": 300,
            }),
        ),
        "icl_binMode" | "icl_shutdown" | "mono_shutterOpen" | "mono_shutterClose" => {
            ok(req, json!({}))
        }

        "mono_discover" | "mono_listCount" => ok(req, json!({"count": 1})),
        "mono_list" => ok(
            req,
            json!({"devices": [{"index": 0, "deviceType": MOCK_MONO_TYPE, "serialNumber": "SN-MONO-0001"}]}),
        ),
        "mono_open" => {
            state.mono_open = true;
            ok(req, json!({}))
        }
        "mono_close" => {
            state.mono_open = false;
            ok(req, json!({}))
        }
        "mono_init" => {
            state.mono_busy_for(INIT_MS);
            ok(req, json!({}))
        }
        "mono_isBusy" => ok(req, json!({"busy": now < state.mono_busy_until})),
        "mono_getPosition" => ok(req, json!({"wavelength": state.wavelength_nm})),
        "mono_moveToPosition" => {
            state.wavelength_nm = param_f64(req, "wavelength");
            state.mono_busy_for(WAVELENGTH_MOVE_MS);
            ok(req, json!({}))
        }
        "mono_moveGrating" => {
            state.grating = param_u32(req, "gratingIndex");
            state.mono_busy_for(GRATING_MOVE_MS);
            ok(req, json!({}))
        }
        "mono_moveSlitMM" => {
            state.slit_mm = param_f64(req, "position");
            state.mono_busy_for(SLIT_MOVE_MS);
            ok(req, json!({}))
        }

        "ccd_discover" | "ccd_listCount" => ok(req, json!({"count": 1})),
        "ccd_list" => ok(
            req,
            json!({"devices": [{"index": 0, "deviceType": MOCK_CCD_TYPE, "serialNumber": "SN-CCD-0001"}]}),
        ),
        "ccd_open" => {
            state.ccd_open = true;
            ok(req, json!({}))
        }
        "ccd_close" => {
            state.ccd_open = false;
            ok(req, json!({}))
        }
        "ccd_getChipSize" => ok(req, json!({"x": CHIP_WIDTH, "y": CHIP_HEIGHT})),
        "ccd_setExposureTime" => {
            state.exposure_ms = u64::from(param_u32(req, "time"));
            ok(req, json!({}))
        }
        "ccd_setGain" => {
            state.gain = param_u32(req, "token");
            ok(req, json!({}))
        }
        "ccd_setSpeed" => {
            state.speed = param_u32(req, "token");
            ok(req, json!({}))
        }
        "ccd_setAcqFormat" => {
            state.acq_format = param_u32(req, "format");
            ok(req, json!({}))
        }
        "ccd_setAcqCount" | "ccd_setXAxisConversionType" | "ccd_setTimerResolution" => {
            ok(req, json!({}))
        }
        "ccd_setRoi" => {
            state.roi = (
                param_u32(req, "xOrigin"),
                param_u32(req, "yOrigin"),
                param_u32(req, "xSize"),
                param_u32(req, "ySize"),
                param_u32(req, "xBin").max(1),
                param_u32(req, "yBin").max(1),
            );
            ok(req, json!({}))
        }
        "ccd_getAcquisitionReady" => {
            ok(req, json!({"ready": state.ccd_open && now >= state.acq_busy_until}))
        }
        "ccd_setAcquisitionStart" => {
            if !state.ccd_open {
                return fail(req, "[E];-2;CCD not open".to_owned());
            }
            state.acq_busy_until = now + Duration::from_millis(state.exposure_ms);
            state.acquired = true;
            ok(req, json!({}))
        }
        "ccd_getAcquisitionBusy" => ok(req, json!({"isBusy": now < state.acq_busy_until})),
        "ccd_getAcquisitionData" => {
            if now < state.acq_busy_until {
                return fail(req, "[E];-3;acquisition in progress".to_owned());
            }
            if !state.acquired {
                return fail(req, "[E];-4;no acquisition data".to_owned());
            }
            let (x, y) = synthesize(state);
            let roi = if state.acq_format == 1 {
                // image format carries one row per unbinned line
                let rows = (state.roi.3 / state.roi.5.max(1)).max(1);
                let image: Vec<&Vec<f64>> = (0..rows).map(|_| &y).collect();
                json!({"xData": x, "yData": image})
            } else {
                json!({"xData": x, "yData": y})
            };
            ok(req, json!({"acquisition": [{"roi": [roi]}]}))
        }

        other => fail(req, format!("[E];-100;unknown command {other}")),
    }
}

/// Wavelength axis around the current grating centre plus a mercury-argon
/// lamp spectrum on a noisy baseline, scaled by exposure and gain.
fn synthesize(state: &MockState) -> (Vec<f64>, Vec<f64>) {
    let grooves = match state.grating {
        0 => 1800.0,
        1 => 600.0,
        _ => 150.0,
    };
    let span_nm = 60_000.0 / grooves;
    let pixels = (state.roi.2 / state.roi.4.max(1)).max(1) as usize;
    let start = state.wavelength_nm - span_nm / 2.0;
    let step = span_nm / pixels as f64;

    let gain_scale = f64::from(1 << state.gain.min(3));
    let exposure_s = (state.exposure_ms as f64 / 1000.0).max(0.001);
    let slit_scale = (state.slit_mm * 10.0).clamp(0.2, 4.0);
    let mut rng = rand::thread_rng();

    let mut x = Vec::with_capacity(pixels);
    let mut y = Vec::with_capacity(pixels);
    for i in 0..pixels {
        let nm = start + (i as f64 + 0.5) * step;
        let mut counts = 980.0 + rng.gen_range(-12.0..12.0);
        for (line_nm, strength) in HG_AR_LINES {
            let width = 0.35 * slit_scale;
            let d = (nm - line_nm) / width;
            counts += strength * 40_000.0 * exposure_s * gain_scale * (-d * d).exp();
        }
        x.push(nm);
        y.push(counts.clamp(0.0, 65_535.0));
    }
    (x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_spectrum_has_lamp_lines() {
        let mut state = MockState::new();
        state.wavelength_nm = 560.0;
        state.grating = 2;
        state.exposure_ms = 100;
        state.slit_mm = 0.1;
        let (x, y) = synthesize(&state);
        assert_eq!(x.len(), CHIP_WIDTH as usize);
        assert_eq!(y.len(), x.len());
        // the 546.07 nm line should tower over the baseline
        let peak = x
            .iter()
            .zip(&y)
            .filter(|(nm, _)| (**nm - 546.07).abs() < 1.0)
            .map(|(_, c)| *c)
            .fold(0.0_f64, f64::max);
        assert!(peak > 2_000.0, "expected a lamp line, peak was {peak}");
        assert!(x.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn failure_injection_and_command_log() {
        let mut state = MockState::new();
        state.fail_command = Some("ccd_open".to_owned());
        let open = Request::new(1, "ccd_open", serde_json::json!({"index": 0}));
        let reply = handle(&mut state, &open);
        assert!(!reply.errors.is_empty());
        let info = Request::new(2, "icl_info", serde_json::json!({}));
        let reply = handle(&mut state, &info);
        assert!(reply.errors.is_empty());
        assert_eq!(state.commands, vec!["ccd_open", "icl_info"]);
    }

    #[test]
    fn acquisition_data_requires_a_started_acquisition() {
        let mut state = MockState::new();
        state.ccd_open = true;
        let get = Request::new(1, "ccd_getAcquisitionData", serde_json::json!({"index": 0}));
        assert!(!handle(&mut state, &get).errors.is_empty());
        let start = Request::new(2, "ccd_setAcquisitionStart", serde_json::json!({"index": 0, "openShutter": true}));
        assert!(handle(&mut state, &start).errors.is_empty());
        // exposure is zero so the busy window has already closed
        let get = Request::new(3, "ccd_getAcquisitionData", serde_json::json!({"index": 0}));
        let reply = handle(&mut state, &get);
        assert!(reply.errors.is_empty());
        assert!(reply.results["acquisition"][0]["roi"][0]["xData"].is_array());
    }
}
