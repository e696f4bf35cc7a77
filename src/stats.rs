//! Per-beam photon statistics.
//!
//! Two statistic sets are produced from the same arrays. They are not
//! interchangeable:
//!
//! * [`StatSet::Metadata`] works on derived depth (`surface_h - ortho_h`),
//!   counts subaqueous photons and bins depth over `[0, 50]`.
//! * [`StatSet::Collection`] works on raw `ortho_h`, reports the object size
//!   and bins elevation over `[-50, 0]`.
//!
//! Both histograms use 50 unit-width bins that are closed on the left, with
//! the last bin closed on both ends.

use ndarray::Array1;

use crate::error::{Error, Result};
use crate::granule::{GranuleId, BEAMS};
use crate::source::{BeamData, Extent, GranuleData};

pub const UNCLASSIFIED: i32 = 0;
pub const BATHYMETRY: i32 = 40;
pub const SEA_SURFACE: i32 = 41;

pub const HISTOGRAM_BINS: usize = 50;

/// Deepest depth the sensor is expected to resolve, in meters.
pub const SENSOR_DEPTH_LIMIT: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatSet {
    Metadata,
    Collection,
}

const METADATA_FIELDS: [&str; 19] = [
    "granule",
    "beam",
    "region",
    "season",
    "total_photons",
    "subaqueous_photons",
    "sea_surface_photons",
    "sea_surface_std",
    "bathy_photons",
    "bathy_mean_depth",
    "bathy_min_depth",
    "bathy_max_depth",
    "bathy_std_depth",
    "bathy_above_sea_surface",
    "bathy_below_sensor_depth",
    "histogram",
    "polygon",
    "begin_time",
    "end_time",
];

const COLLECTION_FIELDS: [&str; 19] = [
    "granule",
    "beam",
    "region",
    "season",
    "size",
    "total_photons",
    "sea_surface_photons",
    "sea_surface_std",
    "bathy_photons",
    "bathy_mean_depth",
    "bathy_min_depth",
    "bathy_max_depth",
    "bathy_std_depth",
    "bathy_above_sea_level",
    "bathy_below_sensor_depth",
    "histogram",
    "polygon",
    "begin_time",
    "end_time",
];

impl StatSet {
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            StatSet::Metadata => &METADATA_FIELDS,
            StatSet::Collection => &COLLECTION_FIELDS,
        }
    }

    pub fn header(self) -> String {
        self.fields().join(",")
    }

    /// Lower edge of the histogram domain.
    fn histogram_floor(self) -> f64 {
        match self {
            StatSet::Metadata => 0.0,
            StatSet::Collection => -SENSOR_DEPTH_LIMIT,
        }
    }

    fn required_columns(self) -> &'static [&'static str] {
        match self {
            StatSet::Metadata => &["class_ph", "ortho_h", "surface_h"],
            StatSet::Collection => &["class_ph", "ortho_h"],
        }
    }
}

/// Typed columns of one beam.
#[derive(Debug, Clone)]
pub struct BeamArrays {
    pub class_ph: Array1<i32>,
    pub ortho_h: Array1<f64>,
    pub surface_h: Option<Array1<f64>>,
}

impl BeamArrays {
    pub fn from_beam(set: StatSet, beam: &str, data: &BeamData) -> Result<BeamArrays> {
        for column in set.required_columns() {
            data.require(beam, column)?;
        }
        let class_ph = data.require(beam, "class_ph")?.mapv(|v| v as i32);
        let ortho_h = data.require(beam, "ortho_h")?.clone();
        let surface_h = data.column("surface_h").cloned();

        let len = class_ph.len();
        let mismatched = |name: &str, n: usize| -> Result<()> {
            if n != len {
                return Err(Error::MissingBeamData {
                    beam: beam.to_string(),
                    column: format!("{} (length {} != {})", name, n, len),
                });
            }
            Ok(())
        };
        mismatched("ortho_h", ortho_h.len())?;
        if set == StatSet::Metadata {
            if let Some(s) = &surface_h {
                mismatched("surface_h", s.len())?;
            }
        }

        Ok(BeamArrays {
            class_ph,
            ortho_h,
            surface_h,
        })
    }
}

/// Count, mean, population standard deviation and range of a sample.
/// Every statistic is NaN for an empty sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub count: u64,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl Moments {
    pub fn of(values: &[f64]) -> Moments {
        let finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        if finite.is_empty() {
            return Moments {
                count: 0,
                mean: f64::NAN,
                std: f64::NAN,
                min: f64::NAN,
                max: f64::NAN,
            };
        }
        let n = finite.len() as f64;
        let mean = finite.iter().sum::<f64>() / n;
        let var = finite.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Moments {
            count: finite.len() as u64,
            mean,
            std: var.sqrt(),
            min,
            max,
        }
    }
}

/// 50 unit-width bins starting at `floor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    pub counts: [u64; HISTOGRAM_BINS],
}

impl Histogram {
    pub fn build(values: &[f64], floor: f64) -> Histogram {
        let ceiling = floor + HISTOGRAM_BINS as f64;
        let mut counts = [0u64; HISTOGRAM_BINS];
        for &v in values {
            if v >= floor && v <= ceiling {
                // floor() keeps the integer edges exact; the top edge folds into the last bin
                let bin = ((v.floor() - floor) as usize).min(HISTOGRAM_BINS - 1);
                counts[bin] += 1;
            }
        }
        Histogram { counts }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn render(&self) -> String {
        self.counts
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatRow {
    pub set: StatSet,
    pub granule: String,
    pub beam: String,
    pub region: u32,
    pub season: u8,
    pub size: u64,
    pub total_photons: u64,
    pub subaqueous_photons: u64,
    pub sea_surface_photons: u64,
    pub sea_surface_std: f64,
    pub bathy: Moments,
    pub bathy_above: u64,
    pub bathy_below: u64,
    pub histogram: Histogram,
    pub extent: Extent,
}

fn fmt3(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else {
        format!("{:.3}", v)
    }
}

impl StatRow {
    /// Renders the row in the column order of its statistic set.
    pub fn to_csv(&self) -> String {
        let mut fields = vec![
            self.granule.clone(),
            self.beam.clone(),
            self.region.to_string(),
            self.season.to_string(),
        ];
        match self.set {
            StatSet::Metadata => {
                fields.push(self.total_photons.to_string());
                fields.push(self.subaqueous_photons.to_string());
            }
            StatSet::Collection => {
                fields.push(self.size.to_string());
                fields.push(self.total_photons.to_string());
            }
        }
        fields.extend([
            self.sea_surface_photons.to_string(),
            fmt3(self.sea_surface_std),
            self.bathy.count.to_string(),
            fmt3(self.bathy.mean),
            fmt3(self.bathy.min),
            fmt3(self.bathy.max),
            fmt3(self.bathy.std),
            self.bathy_above.to_string(),
            self.bathy_below.to_string(),
            self.histogram.render(),
            self.extent.polygon.clone(),
            self.extent.begin_time.clone(),
            self.extent.end_time.clone(),
        ]);
        fields.join(",")
    }
}

/// Result of computing one beam.
#[derive(Debug, Clone, PartialEq)]
pub enum BeamOutcome {
    Row(StatRow),
    Skipped { beam: String, reason: String },
}

/// Computes the row for one beam.
pub fn compute_beam(
    set: StatSet,
    granule: &GranuleId,
    size: u64,
    beam: &str,
    arrays: &BeamArrays,
    extent: &Extent,
) -> StatRow {
    let class = &arrays.class_ph;
    let ortho = &arrays.ortho_h;

    // value the bathy statistics are computed over
    let measure: Array1<f64> = match (set, &arrays.surface_h) {
        (StatSet::Metadata, Some(surface)) => surface - ortho,
        (StatSet::Metadata, None) => Array1::from_elem(ortho.len(), f64::NAN),
        (StatSet::Collection, _) => ortho.clone(),
    };

    let mut sea_surface = Vec::new();
    let mut bathy = Vec::new();
    let mut subaqueous = 0u64;
    for ((&c, &h), &m) in class.iter().zip(ortho.iter()).zip(measure.iter()) {
        if c == SEA_SURFACE {
            sea_surface.push(h);
        }
        if c == BATHYMETRY {
            bathy.push(m);
        }
        // depth 0 counts as subaqueous, matching bin 0 of the histogram
        if (c == UNCLASSIFIED || c == BATHYMETRY) && m >= 0.0 {
            subaqueous += 1;
        }
    }

    let (above, below) = match set {
        StatSet::Metadata => (
            bathy.iter().filter(|&&d| d < 0.0).count(),
            bathy.iter().filter(|&&d| d > SENSOR_DEPTH_LIMIT).count(),
        ),
        StatSet::Collection => (
            bathy.iter().filter(|&&h| h > 0.0).count(),
            bathy.iter().filter(|&&h| h <= -SENSOR_DEPTH_LIMIT).count(),
        ),
    };

    let mut moments = Moments::of(&bathy);
    moments.count = bathy.len() as u64;

    StatRow {
        set,
        granule: granule.name().to_string(),
        beam: beam.to_string(),
        region: granule.region(),
        season: granule.season().code(),
        size,
        total_photons: class.len() as u64,
        subaqueous_photons: if set == StatSet::Metadata { subaqueous } else { 0 },
        sea_surface_photons: sea_surface.len() as u64,
        sea_surface_std: Moments::of(&sea_surface).std,
        bathy: moments,
        bathy_above: above as u64,
        bathy_below: below as u64,
        histogram: Histogram::build(&bathy, set.histogram_floor()),
        extent: extent.clone(),
    }
}

/// Computes every beam of a granule.
///
/// The extent is parsed once up front; if it is missing or malformed the
/// whole granule fails and no rows are produced. Beams without usable
/// arrays come back as [`BeamOutcome::Skipped`].
pub fn granule_outcomes(
    set: StatSet,
    granule: &GranuleId,
    size: u64,
    data: &GranuleData,
) -> Result<Vec<BeamOutcome>> {
    let extent = Extent::parse(granule.name(), data.extent.as_deref())?;

    Ok(BEAMS
        .iter()
        .map(|&beam| {
            let Some(beam_data) = data.beam(beam) else {
                return BeamOutcome::Skipped {
                    beam: beam.to_string(),
                    reason: "beam not present".to_string(),
                };
            };
            match BeamArrays::from_beam(set, beam, beam_data) {
                Ok(arrays) => {
                    BeamOutcome::Row(compute_beam(set, granule, size, beam, &arrays, &extent))
                }
                Err(e) => BeamOutcome::Skipped {
                    beam: beam.to_string(),
                    reason: e.to_string(),
                },
            }
        })
        .collect())
}

/// Header line followed by one line per row.
pub fn render_block(set: StatSet, rows: &[StatRow]) -> String {
    let mut block = set.header();
    block.push('\n');
    for row in rows {
        block.push_str(&row.to_csv());
        block.push('\n');
    }
    block
}
