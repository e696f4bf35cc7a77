//! Granule naming convention and the values derived from it.
//!
//! A granule name looks like `ATL24_20181120020325_08010106_006_02_002_01.h5`:
//! product, acquisition timestamp, RGT/cycle/region, ATL03 release and
//! version, then the ATL24 release and version. Month and region are read at
//! fixed character offsets; every caller goes through [`GranuleId`] so the
//! offsets live in exactly one place.

use std::fmt;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;

use crate::error::{Error, Result};

pub const PRODUCT_PREFIX: &str = "ATL24";
pub const GRANULE_EXTENSION: &str = ".h5";

/// Names containing this marker are never queued. Operators use it to
/// disable individual granules by hand.
pub const SKIP_MARKER: char = '#';

/// Release/version suffix of the first processing of the product.
pub const V1_SUFFIX: &str = "001_01.h5";

/// The six beams of a granule, in the order rows are produced.
pub const BEAMS: [&str; 6] = ["gt1l", "gt1r", "gt2l", "gt2r", "gt3l", "gt3r"];

/// Granule used by `--test` runs.
pub const TEST_GRANULE: &str = "ATL24_20181120020325_08010106_006_02_002_01.h5";

const TIMESTAMP: std::ops::Range<usize> = 6..20;
const MONTH: std::ops::Range<usize> = 10..12;
const REGION: std::ops::Range<usize> = 27..29;

/// Regions below this code are in the northern hemisphere.
const FIRST_SOUTHERN_REGION: u32 = 8;

fn granule_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^ATL24_\d{14}_\d{8}_\d{3}_\d{2}_\d{3}_\d{2}\.h5$")
            .expect("granule pattern is a valid regex")
    })
}

/// `<release>_<version>.h5`, the suffix every output of a processing run carries.
pub fn release_suffix(release: &str, version: &str) -> String {
    format!("{}_{}{}", release, version, GRANULE_EXTENSION)
}

/// A validated granule name with its derived fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranuleId {
    name: String,
    month: u32,
    region: u32,
}

impl GranuleId {
    pub fn parse(name: &str) -> Result<Self> {
        if !granule_regex().is_match(name) {
            return Err(Error::InvalidGranule(name.to_string()));
        }

        let invalid = || Error::InvalidGranule(name.to_string());
        let month: u32 = name[MONTH].parse().map_err(|_| invalid())?;
        let region: u32 = name[REGION].parse().map_err(|_| invalid())?;
        NaiveDateTime::parse_from_str(&name[TIMESTAMP], "%Y%m%d%H%M%S").map_err(|_| invalid())?;

        Ok(GranuleId {
            name: name.to_string(),
            month,
            region,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn region(&self) -> u32 {
        self.region
    }

    pub fn hemisphere(&self) -> Hemisphere {
        Hemisphere::from_region(self.region)
    }

    pub fn season(&self) -> Season {
        // month was validated by the timestamp parse
        Season::lookup(self.hemisphere(), self.month).unwrap_or(Season::Winter)
    }
}

impl fmt::Display for GranuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Swaps a `<release>_<version>.h5` suffix for the v1 suffix. Names without
/// the suffix come back unchanged.
pub fn to_v1_name(name: &str, release: &str, version: &str) -> String {
    let suffix = release_suffix(release, version);
    match name.strip_suffix(&suffix) {
        Some(stem) => format!("{}{}", stem, V1_SUFFIX),
        None => name.to_string(),
    }
}

/// Inverse of [`to_v1_name`]: the name a v1 granule gets at `release`/`version`.
pub fn from_v1_name(name: &str, release: &str, version: &str) -> String {
    match name.strip_suffix(V1_SUFFIX) {
        Some(stem) => format!("{}{}", stem, release_suffix(release, version)),
        None => name.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hemisphere {
    North,
    South,
}

impl Hemisphere {
    pub fn from_region(region: u32) -> Self {
        if region < FIRST_SOUTHERN_REGION {
            Hemisphere::North
        } else {
            Hemisphere::South
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Season {
    Winter = 0,
    Spring = 1,
    Summer = 2,
    Fall = 3,
}

impl Season {
    /// Quarter-of-year season, flipped for the southern hemisphere.
    /// Returns `None` for a month outside 1..=12.
    pub fn lookup(hemisphere: Hemisphere, month: u32) -> Option<Season> {
        let quarter = match month {
            1..=3 => 0,
            4..=6 => 1,
            7..=9 => 2,
            10..=12 => 3,
            _ => return None,
        };
        let north = [Season::Winter, Season::Spring, Season::Summer, Season::Fall];
        let south = [Season::Summer, Season::Fall, Season::Winter, Season::Spring];
        Some(match hemisphere {
            Hemisphere::North => north[quarter],
            Hemisphere::South => south[quarter],
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// `s3://bucket/prefix/...` split into bucket and prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub bucket: String,
    pub prefix: String,
}

impl Location {
    pub fn parse(url: &str) -> Self {
        let path = url.rsplit("s3://").next().unwrap_or(url);
        let mut parts = path.splitn(2, '/');
        let bucket = parts.next().unwrap_or_default().to_string();
        let prefix = parts.next().unwrap_or_default().to_string();
        Location { bucket, prefix }
    }

    /// Key of `name` under this location, without the bucket.
    pub fn key_for(&self, name: &str) -> String {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    }
}
