//! Service side of a remote job: reads the job's input JSON, computes the
//! requested function and writes a [`JobResponse`] as output JSON.

use std::fs;
use std::path::Path;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::granule::{GranuleId, Location};
use crate::job::{JobParms, JobResponse, METADATA_FUNCTION};
use crate::source::GranuleSource;
use crate::stats::{self, BeamOutcome, StatSet};

/// Metadata rows for one granule as a CSV block, header line first.
pub fn metadata_block(source: &dyn GranuleSource, parms: &JobParms) -> Result<String> {
    let id = GranuleId::parse(&parms.granule)?;
    let location = Location::parse(&parms.url);
    let data = source.open(&location, id.name())?;

    let mut rows = Vec::new();
    for outcome in stats::granule_outcomes(StatSet::Metadata, &id, 0, &data)? {
        match outcome {
            BeamOutcome::Row(row) => rows.push(row),
            BeamOutcome::Skipped { beam, reason } => {
                warn!("{}/{} skipped: {}", id, beam, reason);
            }
        }
    }
    Ok(stats::render_block(StatSet::Metadata, &rows))
}

/// Dispatches on `parms.function`. Never fails; errors become a response
/// with `status == false`.
pub fn handle(source: &dyn GranuleSource, parms: &JobParms) -> JobResponse {
    match parms.function.as_str() {
        METADATA_FUNCTION => match metadata_block(source, parms) {
            Ok(block) => JobResponse::ok(block),
            Err(e) => JobResponse::failed(format!("{} - {}", parms.granule, e)),
        },
        other => JobResponse::failed(format!("unrecognized function: {}", other)),
    }
}

/// `runner <input.json> <output.json>`.
pub fn run_files(source: &dyn GranuleSource, input: &Path, output: &Path) -> Result<JobResponse> {
    let text = fs::read_to_string(input).map_err(|e| Error::io(input, e))?;
    let response = match serde_json::from_str::<JobParms>(&text) {
        Ok(parms) => {
            info!("{} on {}", parms.function, parms.granule);
            handle(source, &parms)
        }
        Err(e) => JobResponse::failed(format!("bad input {}: {}", input.display(), e)),
    };
    fs::write(output, serde_json::to_vec(&response)?).map_err(|e| Error::io(output, e))?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::granule::TEST_GRANULE;
    use crate::source::{BeamData, GranuleData};

    struct OneGranule(GranuleData);

    impl GranuleSource for OneGranule {
        fn open(&self, _location: &Location, granule: &str) -> Result<GranuleData> {
            if granule == self.0.name {
                Ok(self.0.clone())
            } else {
                Err(Error::io(granule, std::io::ErrorKind::NotFound.into()))
            }
        }
    }

    fn source(extent: Option<&str>) -> OneGranule {
        let beam = BeamData::default()
            .with_column("class_ph", vec![41.0, 40.0, 40.0])
            .with_column("ortho_h", vec![0.0, -2.0, -3.0])
            .with_column("surface_h", vec![0.0, 0.0, 0.0]);
        let mut data = GranuleData {
            name: TEST_GRANULE.to_string(),
            extent: extent.map(str::to_string),
            ..Default::default()
        };
        data.beams.insert("gt1l".to_string(), beam);
        OneGranule(data)
    }

    fn parms(function: &str) -> JobParms {
        JobParms {
            function: function.to_string(),
            granule: TEST_GRANULE.to_string(),
            url: "s3://bucket/atl24".to_string(),
            output: None,
        }
    }

    const EXTENT: &str = r#"{"polygon":"0 0 1 1","begin_time":"a","end_time":"b"}"#;

    #[test]
    fn metadata_returns_block_with_header() {
        let response = handle(&source(Some(EXTENT)), &parms("metadata"));
        assert!(response.status, "{}", response.result);
        let lines: Vec<&str> = response.result.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], StatSet::Metadata.header());
        assert!(lines[1].starts_with(&format!("{},gt1l,6,3,3,", TEST_GRANULE)));
    }

    #[test]
    fn unknown_function_is_rejected() {
        let response = handle(&source(Some(EXTENT)), &parms("classify"));
        assert!(!response.status);
        assert_eq!(response.result, "unrecognized function: classify");
    }

    #[test]
    fn failures_name_the_granule() {
        let response = handle(&source(None), &parms("metadata"));
        assert!(!response.status);
        assert!(response.result.starts_with(&format!("{} - ", TEST_GRANULE)));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.json");
        let output = dir.path().join("out.json");
        fs::write(&input, serde_json::to_vec(&parms("metadata")).unwrap()).unwrap();

        let response = run_files(&source(Some(EXTENT)), &input, &output).unwrap();
        let written: JobResponse =
            serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(written, response);
        assert!(written.status);
    }
}
