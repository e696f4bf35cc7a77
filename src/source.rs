//! Access to the photon arrays of a granule.
//!
//! The HDF5 reader lives outside this crate; [`GranuleSource`] is the seam.
//! [`JsonGranuleSource`] reads JSON exports of the same datasets, laid out
//! next to where the granule would sit in the object store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array1;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::granule::{Location, GRANULE_EXTENSION};

/// Spatial and temporal extent of a granule, shared by all of its beams.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Extent {
    pub polygon: String,
    pub begin_time: String,
    pub end_time: String,
}

impl Extent {
    /// Parses the granule's `metadata/extent` record.
    pub fn parse(granule: &str, record: Option<&str>) -> Result<Extent> {
        let record = record.ok_or_else(|| Error::MalformedExtent {
            granule: granule.to_string(),
            reason: "extent record is missing".to_string(),
        })?;
        serde_json::from_str(record).map_err(|e| Error::MalformedExtent {
            granule: granule.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Columns and attributes of one beam.
#[derive(Debug, Clone, Default)]
pub struct BeamData {
    pub columns: BTreeMap<String, Array1<f64>>,
    pub attributes: BTreeMap<String, f64>,
}

impl BeamData {
    pub fn column(&self, name: &str) -> Option<&Array1<f64>> {
        self.columns.get(name)
    }

    pub fn require(&self, beam: &str, name: &str) -> Result<&Array1<f64>> {
        self.column(name).ok_or_else(|| Error::MissingBeamData {
            beam: beam.to_string(),
            column: name.to_string(),
        })
    }

    pub fn attribute(&self, name: &str) -> Option<f64> {
        self.attributes.get(name).copied()
    }

    pub fn with_column(mut self, name: &str, values: Vec<f64>) -> Self {
        self.columns.insert(name.to_string(), Array1::from_vec(values));
        self
    }

    pub fn with_attribute(mut self, name: &str, value: f64) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }
}

/// Everything read from one granule. Beams absent from the file are absent
/// from `beams`.
#[derive(Debug, Clone, Default)]
pub struct GranuleData {
    pub name: String,
    pub extent: Option<String>,
    pub beams: BTreeMap<String, BeamData>,
}

impl GranuleData {
    pub fn beam(&self, beam: &str) -> Option<&BeamData> {
        self.beams.get(beam)
    }
}

pub trait GranuleSource: Send + Sync {
    fn open(&self, location: &Location, granule: &str) -> Result<GranuleData>;
}

#[derive(Deserialize)]
struct GranuleFile {
    #[serde(default)]
    extent: Option<String>,
    #[serde(default)]
    beams: BTreeMap<String, BeamFile>,
}

#[derive(Deserialize)]
struct BeamFile {
    #[serde(default)]
    columns: BTreeMap<String, Vec<Option<f64>>>,
    #[serde(default)]
    attributes: BTreeMap<String, f64>,
}

/// Reads `<root>/<bucket>/<prefix>/<granule stem>.json`.
#[derive(Debug, Clone)]
pub struct JsonGranuleSource {
    root: PathBuf,
}

impl JsonGranuleSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        JsonGranuleSource { root: root.into() }
    }

    pub fn path_for(&self, location: &Location, granule: &str) -> PathBuf {
        let stem = granule.strip_suffix(GRANULE_EXTENSION).unwrap_or(granule);
        self.root
            .join(&location.bucket)
            .join(location.key_for(&format!("{}.json", stem)))
    }

    fn read(path: &Path, granule: &str) -> Result<GranuleData> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let file: GranuleFile = serde_json::from_str(&text)?;
        let beams = file
            .beams
            .into_iter()
            .map(|(beam, data)| {
                let columns = data
                    .columns
                    .into_iter()
                    .map(|(name, values)| {
                        let values = values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect();
                        (name, Array1::from_vec(values))
                    })
                    .collect();
                (
                    beam,
                    BeamData {
                        columns,
                        attributes: data.attributes,
                    },
                )
            })
            .collect();
        Ok(GranuleData {
            name: granule.to_string(),
            extent: file.extent,
            beams,
        })
    }
}

impl GranuleSource for JsonGranuleSource {
    fn open(&self, location: &Location, granule: &str) -> Result<GranuleData> {
        let path = self.path_for(location, granule);
        Self::read(&path, granule)
    }
}
