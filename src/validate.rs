//! Cross-version comparison of beam arrays.
//!
//! Rows of the two versions are assumed aligned one for one. Categorical
//! fields must match exactly; continuous fields match within
//! `ATOL + RTOL * |expected|`. Classification changes between versions are
//! counted separately as relabeled photons.

use std::collections::BTreeSet;

use ndarray::Array1;

use crate::granule::BEAMS;
use crate::source::{BeamData, GranuleData};
use crate::stats::{BATHYMETRY, SEA_SURFACE, UNCLASSIFIED};

pub const RTOL: f64 = 1e-5;
pub const ATOL: f64 = 1e-8;

/// Attribute on the newer classification array holding the expected number
/// of relabeled photons.
pub const RELABELED_ATTRIBUTE: &str = "relabeled";

/// `|a - b| <= ATOL + RTOL * |b|`; NaN never matches.
pub fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= ATOL + RTOL * b.abs()
}

/// Which fields are compared and how.
#[derive(Debug, Clone)]
pub struct ComparePlan {
    pub exact: Vec<String>,
    pub tolerance: Vec<String>,
    /// Classification field whose differences count as relabeled photons
    /// rather than mismatches.
    pub relabel: Option<String>,
    pub consistency: bool,
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl ComparePlan {
    /// Plan for checking a reprocessed granule against its first release.
    pub fn release_check() -> Self {
        ComparePlan {
            exact: owned(&[
                "index_ph",
                "index_seg",
                "invalid_kd",
                "invalid_wind_speed",
                "night_flag",
                "sensor_depth_exceeded",
                "delta_time",
            ]),
            tolerance: owned(&[
                "confidence",
                "ellipse_h",
                "ortho_h",
                "surface_h",
                "lat_ph",
                "lon_ph",
                "sigma_thu",
                "sigma_tvu",
                "x_atc",
                "y_atc",
            ]),
            relabel: Some("class_ph".to_string()),
            consistency: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeamReport {
    pub beam: String,
    pub rows: (usize, usize),
    /// Mismatch count per compared field, in plan order.
    pub mismatches: Vec<(String, u64)>,
    pub relabeled: Option<u64>,
    pub expected_relabeled: Option<u64>,
    pub consistency_failures: Vec<String>,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub granule: String,
    pub beams: Vec<BeamReport>,
    /// Beams absent from both versions.
    pub skipped_beams: Vec<String>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.beams.iter().all(|b| b.verdict.passed())
    }

    pub fn first_failure(&self) -> Option<(&str, &str)> {
        self.beams.iter().find_map(|b| match &b.verdict {
            Verdict::Fail(reason) => Some((b.beam.as_str(), reason.as_str())),
            Verdict::Pass => None,
        })
    }
}

fn row_count(data: &BeamData) -> usize {
    data.columns.values().map(Array1::len).max().unwrap_or(0)
}

fn count_mismatches(a: &Array1<f64>, b: &Array1<f64>, exact: bool) -> u64 {
    a.iter()
        .zip(b.iter())
        .filter(|&(&x, &y)| if exact { x != y } else { !is_close(x, y) })
        .count() as u64
}

/// Value checks on the newer version that need no reference.
fn consistency_failures(v2: &BeamData) -> Vec<String> {
    let mut failures = Vec::new();
    let allowed_classes = [UNCLASSIFIED, BATHYMETRY, SEA_SURFACE];

    if let Some(class) = v2.column("class_ph") {
        let unexpected: BTreeSet<i64> = class
            .iter()
            .filter(|&&c| !allowed_classes.iter().any(|&a| a as f64 == c))
            .map(|&c| c as i64)
            .collect();
        if !unexpected.is_empty() {
            failures.push(format!("class_ph: unexpected classifications {:?}", unexpected));
        }
    }

    if let Some(flags) = v2.column("low_confidence_flag") {
        let unexpected: BTreeSet<i64> = flags
            .iter()
            .filter(|&&f| f != 0.0 && f != 1.0)
            .map(|&f| f as i64)
            .collect();
        if !unexpected.is_empty() {
            failures.push(format!(
                "low_confidence_flag: unexpected values {:?}",
                unexpected
            ));
        }
        if let Some(class) = v2.column("class_ph") {
            let flagged = flags.iter().filter(|&&f| f == 1.0).count();
            let bathy = class.iter().filter(|&&c| c == BATHYMETRY as f64).count();
            if flagged > bathy {
                failures.push(format!(
                    "low_confidence_flag: more low confidence photons than bathy photons, {} > {}",
                    flagged, bathy
                ));
            }
        }
    }
    failures
}

/// Compares one beam of two versions. `expected_relabeled` is checked only
/// when the plan names a relabel field.
pub fn compare_beam(
    plan: &ComparePlan,
    beam: &str,
    v1: &BeamData,
    v2: &BeamData,
    expected_relabeled: Option<u64>,
) -> BeamReport {
    let rows = (row_count(v1), row_count(v2));
    let mut report = BeamReport {
        beam: beam.to_string(),
        rows,
        mismatches: Vec::new(),
        relabeled: None,
        expected_relabeled,
        consistency_failures: Vec::new(),
        verdict: Verdict::Pass,
    };

    if rows.0 != rows.1 {
        report.verdict = Verdict::Fail(format!(
            "incorrect number of rows in results, {} != {}",
            rows.1, rows.0
        ));
        return report;
    }

    if plan.consistency {
        report.consistency_failures = consistency_failures(v2);
    }

    let mut missing = None;
    let fields = plan
        .exact
        .iter()
        .map(|f| (f, true))
        .chain(plan.tolerance.iter().map(|f| (f, false)));
    for (field, exact) in fields {
        match (v1.column(field), v2.column(field)) {
            (Some(a), Some(b)) => {
                report
                    .mismatches
                    .push((field.clone(), count_mismatches(a, b, exact)));
            }
            (None, None) => {}
            _ => {
                missing.get_or_insert_with(|| format!("{} present in only one version", field));
            }
        }
    }

    if let Some(field) = &plan.relabel {
        if let (Some(a), Some(b)) = (v1.column(field), v2.column(field)) {
            report.relabeled = Some(count_mismatches(a, b, true));
        }
    }

    report.verdict = if let Some(reason) = report.consistency_failures.first() {
        Verdict::Fail(reason.clone())
    } else if let Some(reason) = missing {
        Verdict::Fail(reason)
    } else if let Some((field, count)) = report.mismatches.iter().find(|(_, c)| *c > 0) {
        Verdict::Fail(format!("there were {} mismatched values in the {} column", count, field))
    } else {
        match (plan.relabel.is_some(), report.relabeled, expected_relabeled) {
            (true, Some(actual), Some(expected)) if actual != expected => Verdict::Fail(format!(
                "unexpected number of photons relabeled, {} != {}",
                actual, expected
            )),
            _ => Verdict::Pass,
        }
    };
    report
}

/// Compares every beam of two versions of a granule. The expected relabeled
/// count of a beam is read from the newer version's attributes.
pub fn compare_granule(plan: &ComparePlan, v1: &GranuleData, v2: &GranuleData) -> ValidationReport {
    let mut report = ValidationReport {
        granule: v2.name.clone(),
        beams: Vec::new(),
        skipped_beams: Vec::new(),
    };

    for beam in BEAMS {
        match (v1.beam(beam), v2.beam(beam)) {
            (Some(a), Some(b)) => {
                let expected = b.attribute(RELABELED_ATTRIBUTE).map(|v| v as u64);
                report.beams.push(compare_beam(plan, beam, a, b, expected));
            }
            (None, None) => report.skipped_beams.push(beam.to_string()),
            (a, b) => {
                let present = if a.is_some() { "first" } else { "second" };
                report.beams.push(BeamReport {
                    beam: beam.to_string(),
                    rows: (a.map(row_count).unwrap_or(0), b.map(row_count).unwrap_or(0)),
                    mismatches: Vec::new(),
                    relabeled: None,
                    expected_relabeled: None,
                    consistency_failures: Vec::new(),
                    verdict: Verdict::Fail(format!("beam present only in the {} version", present)),
                });
            }
        }
    }
    report
}

pub const CHECK_HEADER: &str = "granule,check";

/// `granule,check` row for the check summary.
pub fn check_row(report: &ValidationReport) -> String {
    let status = if report.passed() { "True" } else { "False" };
    format!("{},{}", report.granule, status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beam(columns: &[(&str, Vec<f64>)]) -> BeamData {
        columns
            .iter()
            .fold(BeamData::default(), |b, (name, values)| {
                b.with_column(name, values.clone())
            })
    }

    #[test]
    fn tolerance_comparison() {
        assert!(is_close(10.000001, 10.0));
        assert!(!is_close(10.5, 10.0));
        assert!(!is_close(f64::NAN, f64::NAN));
        assert!(is_close(0.0, 0.0));
    }

    /// Class must match exactly, positions within tolerance.
    fn same_version_plan() -> ComparePlan {
        ComparePlan {
            exact: owned(&["class_ph"]),
            tolerance: owned(&["x_atc", "ortho_h"]),
            relabel: None,
            consistency: false,
        }
    }

    #[test]
    fn tolerance_fields_accept_small_differences() {
        let plan = same_version_plan();
        let v1 = beam(&[("ortho_h", vec![10.0]), ("class_ph", vec![40.0]), ("x_atc", vec![1.0])]);
        let close = beam(&[("ortho_h", vec![10.000001]), ("class_ph", vec![40.0]), ("x_atc", vec![1.0])]);
        let far = beam(&[("ortho_h", vec![10.5]), ("class_ph", vec![40.0]), ("x_atc", vec![1.0])]);

        let ok = compare_beam(&plan, "gt1l", &close, &v1, None);
        assert_eq!(ok.verdict, Verdict::Pass);

        let bad = compare_beam(&plan, "gt1l", &far, &v1, None);
        assert!(!bad.verdict.passed());
        assert!(bad.mismatches.contains(&("ortho_h".to_string(), 1)));
    }

    #[test]
    fn row_count_mismatch_fails_first() {
        let plan = same_version_plan();
        let v1 = beam(&[("class_ph", vec![40.0, 41.0])]);
        let v2 = beam(&[("class_ph", vec![40.0])]);
        let report = compare_beam(&plan, "gt1l", &v1, &v2, None);
        assert_eq!(
            report.verdict,
            Verdict::Fail("incorrect number of rows in results, 1 != 2".to_string())
        );
        assert!(report.mismatches.is_empty());
    }

    #[test]
    fn relabeled_photons_are_counted_not_mismatched() {
        let plan = ComparePlan::release_check();
        let v1 = beam(&[("class_ph", vec![40.0, 40.0, 41.0]), ("ortho_h", vec![1.0, 2.0, 3.0])]);
        let v2 = beam(&[
            ("class_ph", vec![0.0, 40.0, 41.0]),
            ("ortho_h", vec![1.0, 2.0, 3.0]),
            ("low_confidence_flag", vec![1.0, 0.0, 0.0]),
        ]);

        let pass = compare_beam(&plan, "gt1l", &v1, &v2, Some(1));
        assert_eq!(pass.relabeled, Some(1));
        assert_eq!(pass.verdict, Verdict::Pass);

        let fail = compare_beam(&plan, "gt1l", &v1, &v2, Some(2));
        assert_eq!(
            fail.verdict,
            Verdict::Fail("unexpected number of photons relabeled, 1 != 2".to_string())
        );

        let unchecked = compare_beam(&plan, "gt1l", &v1, &v2, None);
        assert!(unchecked.verdict.passed());
    }

    #[test]
    fn consistency_checks_on_newer_version() {
        let plan = ComparePlan::release_check();
        let v1 = beam(&[("class_ph", vec![40.0, 7.0])]);
        let v2 = beam(&[("class_ph", vec![40.0, 7.0])]);
        let report = compare_beam(&plan, "gt1l", &v1, &v2, None);
        assert_eq!(report.consistency_failures.len(), 1);
        assert!(!report.verdict.passed());

        let v1 = beam(&[("class_ph", vec![0.0, 0.0]), ("low_confidence_flag", vec![1.0, 1.0])]);
        let report = compare_beam(&plan, "gt1l", &v1, &v1.clone(), None);
        assert!(report.consistency_failures[0].contains("more low confidence photons"));
    }

    #[test]
    fn exact_fields_count_every_difference() {
        let plan = ComparePlan::release_check();
        let v1 = beam(&[("index_ph", vec![1.0, 2.0, 3.0]), ("night_flag", vec![0.0, 0.0, 1.0])]);
        let v2 = beam(&[("index_ph", vec![1.0, 5.0, 6.0]), ("night_flag", vec![0.0, 0.0, 1.0])]);
        let report = compare_beam(&plan, "gt2l", &v1, &v2, None);
        assert_eq!(report.mismatches[0], ("index_ph".to_string(), 2));
        assert_eq!(
            report.verdict,
            Verdict::Fail("there were 2 mismatched values in the index_ph column".to_string())
        );
    }

    #[test]
    fn field_in_one_version_only_fails() {
        let plan = ComparePlan::release_check();
        let v1 = beam(&[("x_atc", vec![1.0])]);
        let v2 = beam(&[("y_atc", vec![1.0])]);
        let report = compare_beam(&plan, "gt1l", &v1, &v2, None);
        assert!(!report.verdict.passed());
    }

    #[test]
    fn granule_report_uses_relabeled_attribute() {
        let plan = ComparePlan::release_check();
        let mut v1 = GranuleData {
            name: "v1".into(),
            ..Default::default()
        };
        let mut v2 = GranuleData {
            name: "v2".into(),
            ..Default::default()
        };
        v1.beams.insert("gt1l".into(), beam(&[("class_ph", vec![40.0, 40.0])]));
        v2.beams.insert(
            "gt1l".into(),
            beam(&[("class_ph", vec![0.0, 40.0])]).with_attribute(RELABELED_ATTRIBUTE, 1.0),
        );
        v2.beams.insert("gt3r".into(), beam(&[("class_ph", vec![40.0])]));

        let report = compare_granule(&plan, &v1, &v2);
        assert_eq!(report.skipped_beams.len(), 4);
        assert!(report.beams[0].verdict.passed());
        assert_eq!(report.first_failure().map(|(b, _)| b), Some("gt3r"));
        assert!(!report.passed());
        assert_eq!(check_row(&report), "v2,False");
    }
}
