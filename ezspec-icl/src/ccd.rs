#![warn(clippy::pedantic)]
#![warn(clippy::all)]

use std::time::{Duration, Instant};

use async_std::sync::{Arc, Mutex};
use async_std::task;
use serde_json::{json, Value};

use crate::link::IclLink;
use crate::protocol::{self, IclError, IclResult};

const BUSY_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AcquisitionFormat {
    Spectra = 0,
    Image = 1,
    Crop = 2,
    FastKinetics = 3,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerResolution {
    Milliseconds = 0,
    Microseconds = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum XAxisConversion {
    None = 0,
    CcdFirmware = 1,
    IclSettingsIni = 2,
}

/// Readout region passed to the CCD before acquisition. `y_bin` equal to
/// `y_size` collapses the region to a single spectrum row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Roi {
    pub roi_index: u32,
    pub x_origin: u32,
    pub y_origin: u32,
    pub x_size: u32,
    pub y_size: u32,
    pub x_bin: u32,
    pub y_bin: u32,
}

impl Roi {
    /// Full-chip, fully-binned-vertically region for spectrum readout.
    #[must_use]
    pub fn spectrum(chip_x: u32, chip_y: u32) -> Self {
        Roi {
            roi_index: 1,
            x_origin: 0,
            y_origin: 0,
            x_size: chip_x,
            y_size: chip_y,
            x_bin: 1,
            y_bin: chip_y,
        }
    }

    /// Full-chip, unbinned region for image readout.
    #[must_use]
    pub fn image(chip_x: u32, chip_y: u32) -> Self {
        Roi {
            y_bin: 1,
            ..Roi::spectrum(chip_x, chip_y)
        }
    }
}

/// Handle for one CCD behind the ICL.
#[derive(Debug, Clone)]
pub struct ChargeCoupledDevice {
    link: Arc<Mutex<IclLink>>,
    index: u32,
}

impl ChargeCoupledDevice {
    pub(crate) fn new(link: Arc<Mutex<IclLink>>, index: u32) -> Self {
        ChargeCoupledDevice { link, index }
    }

    async fn call(&self, command: &str, parameters: Value) -> IclResult<Value> {
        self.link.lock().await.request(command, parameters).await
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn open(&self) -> IclResult<()> {
        self.call("ccd_open", json!({"index": self.index})).await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn close(&self) -> IclResult<()> {
        self.call("ccd_close", json!({"index": self.index})).await?;
        Ok(())
    }

    /// Sensor dimensions in pixels, (columns, rows).
    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn chip_size(&self) -> IclResult<(u32, u32)> {
        let results = self
            .call("ccd_getChipSize", json!({"index": self.index}))
            .await?;
        Ok((
            protocol::field_u32(&results, "ccd_getChipSize", "x")?,
            protocol::field_u32(&results, "ccd_getChipSize", "y")?,
        ))
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn set_exposure_time_ms(&self, exposure_ms: u64) -> IclResult<()> {
        self.call(
            "ccd_setExposureTime",
            json!({"index": self.index, "time": exposure_ms}),
        )
        .await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn set_gain(&self, token: u32) -> IclResult<()> {
        self.call("ccd_setGain", json!({"index": self.index, "token": token}))
            .await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn set_speed(&self, token: u32) -> IclResult<()> {
        self.call("ccd_setSpeed", json!({"index": self.index, "token": token}))
            .await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn set_acquisition_format(
        &self,
        format: AcquisitionFormat,
        number_of_rois: u32,
    ) -> IclResult<()> {
        self.call(
            "ccd_setAcqFormat",
            json!({"index": self.index, "format": format as u32, "numberOfRois": number_of_rois}),
        )
        .await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn set_acquisition_count(&self, count: u32) -> IclResult<()> {
        self.call(
            "ccd_setAcqCount",
            json!({"index": self.index, "count": count}),
        )
        .await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn set_x_axis_conversion(&self, conversion: XAxisConversion) -> IclResult<()> {
        self.call(
            "ccd_setXAxisConversionType",
            json!({"index": self.index, "type": conversion as u32}),
        )
        .await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn set_timer_resolution(&self, resolution: TimerResolution) -> IclResult<()> {
        self.call(
            "ccd_setTimerResolution",
            json!({"index": self.index, "resolutionToken": resolution as u32}),
        )
        .await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn set_region_of_interest(&self, roi: Roi) -> IclResult<()> {
        self.call(
            "ccd_setRoi",
            json!({
                "index": self.index,
                "roiIndex": roi.roi_index,
                "xOrigin": roi.x_origin,
                "yOrigin": roi.y_origin,
                "xSize": roi.x_size,
                "ySize": roi.y_size,
                "xBin": roi.x_bin,
                "yBin": roi.y_bin,
            }),
        )
        .await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn acquisition_ready(&self) -> IclResult<bool> {
        let results = self
            .call("ccd_getAcquisitionReady", json!({"index": self.index}))
            .await?;
        protocol::field_bool(&results, "ccd_getAcquisitionReady", "ready")
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn start_acquisition(&self, open_shutter: bool) -> IclResult<()> {
        self.call(
            "ccd_setAcquisitionStart",
            json!({"index": self.index, "openShutter": open_shutter}),
        )
        .await?;
        Ok(())
    }

    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn acquisition_busy(&self) -> IclResult<bool> {
        let results = self
            .call("ccd_getAcquisitionBusy", json!({"index": self.index}))
            .await?;
        protocol::field_bool(&results, "ccd_getAcquisitionBusy", "isBusy")
    }

    /// Poll until the current acquisition finishes reading out.
    /// # Errors
    /// Returns ``IclError::BusyTimeout`` after `limit`, and propagates any
    /// transport or device error.
    pub async fn wait_acquisition_done(&self, limit: Duration) -> IclResult<()> {
        let deadline = Instant::now() + limit;
        while self.acquisition_busy().await? {
            if Instant::now() > deadline {
                return Err(IclError::BusyTimeout {
                    operation: "acquisition readout",
                    limit_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                });
            }
            task::sleep(BUSY_POLL).await;
        }
        Ok(())
    }

    /// Read the first ROI of the last acquisition as (x, intensity) vectors.
    /// # Errors
    /// Propagates any ICL transport or device error, and rejects replies
    /// whose x and y arrays disagree in length.
    pub async fn spectrum_data(&self) -> IclResult<(Vec<f64>, Vec<f64>)> {
        let results = self
            .call("ccd_getAcquisitionData", json!({"index": self.index}))
            .await?;
        let roi = first_roi(&results)?;
        let x = protocol::field_f64_array(roi, "ccd_getAcquisitionData", "xData")?;
        let y = roi
            .get("yData")
            .and_then(flatten_spectrum)
            .ok_or(IclError::MissingField {
                command: "ccd_getAcquisitionData",
                field: "yData",
            })?;
        if x.len() != y.len() {
            return Err(IclError::DataShape {
                x: x.len(),
                y: y.len(),
            });
        }
        Ok((x, y))
    }

    /// Read the first ROI of the last acquisition as an image, one vector
    /// per sensor row.
    /// # Errors
    /// Propagates any ICL transport or device error.
    pub async fn image_data(&self) -> IclResult<Vec<Vec<f64>>> {
        let results = self
            .call("ccd_getAcquisitionData", json!({"index": self.index}))
            .await?;
        let roi = first_roi(&results)?;
        roi.get("yData")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(Value::as_array)
                    .map(|row| row.iter().filter_map(Value::as_f64).collect())
                    .collect()
            })
            .ok_or(IclError::MissingField {
                command: "ccd_getAcquisitionData",
                field: "yData",
            })
    }
}

fn first_roi(results: &Value) -> IclResult<&Value> {
    results
        .get("acquisition")
        .and_then(|a| a.get(0))
        .and_then(|a| a.get("roi"))
        .and_then(|r| r.get(0))
        .ok_or(IclError::MissingField {
            command: "ccd_getAcquisitionData",
            field: "acquisition[0].roi[0]",
        })
}

// Some firmware revisions wrap the spectrum row once more, as [[...]].
fn flatten_spectrum(value: &Value) -> Option<Vec<f64>> {
    let arr = value.as_array()?;
    if arr.len() == 1 && arr[0].is_array() {
        return arr[0]
            .as_array()
            .map(|row| row.iter().filter_map(Value::as_f64).collect());
    }
    Some(arr.iter().filter_map(Value::as_f64).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spectrum_roi_is_fully_binned() {
        let roi = Roi::spectrum(1024, 256);
        assert_eq!(roi.roi_index, 1);
        assert_eq!((roi.x_origin, roi.y_origin), (0, 0));
        assert_eq!((roi.x_size, roi.y_size), (1024, 256));
        assert_eq!(roi.x_bin, 1);
        assert_eq!(roi.y_bin, 256);
    }

    #[test]
    fn image_roi_keeps_rows() {
        let roi = Roi::image(1024, 256);
        assert_eq!(roi.y_bin, 1);
        assert_eq!(roi.y_size, 256);
    }

    #[test]
    fn flatten_handles_both_encodings() {
        let flat = json!([1.0, 2.0, 3.0]);
        assert_eq!(flatten_spectrum(&flat).expect("flat"), vec![1.0, 2.0, 3.0]);
        let nested = json!([[1.0, 2.0, 3.0]]);
        assert_eq!(flatten_spectrum(&nested).expect("nested"), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn missing_roi_is_an_error() {
        let empty = json!({"acquisition": []});
        assert!(matches!(
            first_roi(&empty),
            Err(IclError::MissingField { .. })
        ));
    }
}
