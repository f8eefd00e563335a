//! Result records written back by cluster workers.
//!
//! Workers push one JSON document per point onto the point-insert queue and
//! one per measure onto the measure-update queue. Field names follow the
//! database column names so the documents can be produced directly from rows.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A control point with its measures, awaiting insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    /// Ignored on insert; ids are allocated by the database.
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(alias = "pointType")]
    pub pointtype: i32,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub overlapid: Option<i64>,
    #[serde(default)]
    pub cam_type: Option<String>,
    #[serde(default, alias = "pointIgnore")]
    pub ignore: bool,
    /// Body-fixed a priori coordinate.
    #[serde(default)]
    pub apriori: Option<[f64; 3]>,
    /// Body-fixed adjusted coordinate.
    #[serde(default)]
    pub adjusted: Option<[f64; 3]>,
    #[serde(default, alias = "referenceIndex")]
    pub reference_index: i32,
    #[serde(default)]
    pub measures: Vec<MeasureRecord>,
}

/// An image measure of a control point.
///
/// Inserted together with its point, or applied as an update when `id` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureRecord {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub pointid: Option<i64>,
    pub imageid: i64,
    #[serde(alias = "serialnumber")]
    pub serial: String,
    #[serde(alias = "measureType")]
    pub measuretype: i32,
    pub sample: f64,
    pub line: f64,
    #[serde(default)]
    pub apriorisample: Option<f64>,
    #[serde(default)]
    pub aprioriline: Option<f64>,
    #[serde(default, alias = "measureIgnore")]
    pub ignore: bool,
    #[serde(default, alias = "ChooserName")]
    pub choosername: Option<String>,
    #[serde(default, alias = "templateMetric")]
    pub template_metric: Option<f64>,
    #[serde(default, alias = "templateShift")]
    pub template_shift: Option<f64>,
    #[serde(default)]
    pub weight: Option<f64>,
}

fn check_finite(what: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("{} is not finite ({})", what, value)))
    }
}

fn check_coordinate(what: &str, xyz: Option<[f64; 3]>) -> Result<()> {
    match xyz {
        Some(xyz) if xyz.iter().any(|v| !v.is_finite()) => Err(Error::InvalidInput(format!(
            "{} coordinate {:?} is not finite",
            what, xyz
        ))),
        _ => Ok(()),
    }
}

impl PointRecord {
    /// Reject a point that no insert could accept.
    pub fn validate(&self) -> Result<()> {
        check_coordinate("apriori", self.apriori)?;
        check_coordinate("adjusted", self.adjusted)?;
        for measure in &self.measures {
            measure.check_position()?;
        }
        Ok(())
    }
}

impl MeasureRecord {
    fn check_position(&self) -> Result<()> {
        check_finite("sample", self.sample)?;
        check_finite("line", self.line)
    }

    /// Reject a measure that cannot be applied as an update.
    ///
    /// Updates are keyed on `id`, so a measure without one is refused.
    pub fn validate_update(&self) -> Result<()> {
        if self.id.is_none() {
            return Err(Error::InvalidInput(format!(
                "measure update for image {} ({}) has no id",
                self.imageid, self.serial
            )));
        }
        self.check_position()
    }
}
