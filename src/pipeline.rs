//! Tool wiring: plan a run from the catalog and the ledger, then hand the
//! queue to the dispatcher with the processor for the tool.

use std::path::Path;

use log::{debug, info, warn};

use crate::catalog::WorkItem;
use crate::dispatch::{self, Attempt, DispatchConfig, GranuleProcessor, RunContext, RunSummary};
use crate::error::{Error, Result};
use crate::granule::{self, GranuleId, Location};
use crate::job::{JobClient, JobParms, JobRequest, CONVERT_FUNCTION, METADATA_FUNCTION};
use crate::ledger::{ChecklistSets, Ledger};
use crate::queue::WorkQueue;
use crate::source::GranuleSource;
use crate::stats::{self, BeamOutcome, StatSet};
use crate::validate::{self, ComparePlan, CHECK_HEADER};

pub const CONVERT_HEADER: &str = "granule,output";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub reprocess: bool,
    pub report_only: bool,
    /// Replaces the queue with this single granule and keeps failures out of
    /// the error log.
    pub test_granule: Option<String>,
}

/// A run that is ready to dispatch.
pub struct PreparedRun {
    pub sets: ChecklistSets,
    pub context: RunContext,
}

/// Opens the ledger and builds the queue from `catalog`.
pub fn prepare(
    catalog: Vec<WorkItem>,
    summary_path: &Path,
    error_path: &Path,
    header: Option<&str>,
    options: &RunOptions,
) -> Result<PreparedRun> {
    let (sets, writer) = Ledger::open(summary_path, error_path, options.reprocess, header)?;

    let queue = match &options.test_granule {
        Some(name) => WorkQueue::new([WorkItem {
            name: name.clone(),
            size: 0,
        }]),
        None => WorkQueue::plan(catalog, &sets, options.reprocess),
    };

    println!("Granules Already Processed: {}", sets.processed.len());
    println!("Granules In Error:          {}", sets.in_error.len());
    println!("Granules Left to Process:   {}", queue.len());

    Ok(PreparedRun {
        sets,
        context: RunContext {
            queue,
            writer,
            record_errors: options.test_granule.is_none(),
        },
    })
}

/// Dispatches a prepared run unless `report_only` is set.
pub fn execute<P: GranuleProcessor>(
    prepared: &PreparedRun,
    processor: &P,
    config: &DispatchConfig,
    options: &RunOptions,
) -> Result<RunSummary> {
    if options.report_only {
        info!("Report only: {} granules not dispatched", prepared.context.queue.len());
        return Ok(RunSummary::default());
    }
    dispatch::run(&prepared.context, processor, config)
}

fn remote_attempt(client: &dyn JobClient, request: &JobRequest) -> Result<String> {
    let response = client.invoke(request)?;
    if response.status {
        Ok(response.result)
    } else {
        Err(Error::Job(response.result))
    }
}

/// Local read failures may clear up on a retry; everything else repeats.
fn local_failure(e: Error) -> Attempt {
    match e {
        Error::Io { .. } => Attempt::Retry(e.to_string()),
        _ => Attempt::Terminal(e.to_string()),
    }
}

/// `collect`: asks the compute service for the metadata rows of a granule.
pub struct RemoteMetadata<'a> {
    pub client: &'a dyn JobClient,
    pub image: String,
    pub command: String,
    pub url: String,
}

impl RemoteMetadata<'_> {
    pub fn request(&self, granule: &str) -> JobRequest {
        JobRequest {
            image: self.image.clone(),
            command: self.command.clone(),
            parms: JobParms {
                function: METADATA_FUNCTION.to_string(),
                granule: granule.to_string(),
                url: self.url.clone(),
                output: None,
            },
        }
    }
}

impl GranuleProcessor for RemoteMetadata<'_> {
    fn process(&self, _worker_id: usize, item: &WorkItem) -> Attempt {
        match remote_attempt(self.client, &self.request(&item.name)) {
            Ok(block) => Attempt::Completed(block),
            Err(e) => Attempt::Retry(e.to_string()),
        }
    }
}

/// `convert`: asks the compute service to write the release version of a v1
/// granule under `output`.
pub struct RemoteConvert<'a> {
    pub client: &'a dyn JobClient,
    pub image: String,
    pub command: String,
    pub url: String,
    pub output: Location,
    pub release: String,
    pub version: String,
}

impl RemoteConvert<'_> {
    /// `s3://` url the converted granule is written to.
    pub fn output_url(&self, granule: &str) -> String {
        let name = granule::from_v1_name(granule, &self.release, &self.version);
        format!("s3://{}/{}", self.output.bucket, self.output.key_for(&name))
    }

    pub fn request(&self, granule: &str) -> JobRequest {
        JobRequest {
            image: self.image.clone(),
            command: self.command.clone(),
            parms: JobParms {
                function: CONVERT_FUNCTION.to_string(),
                granule: granule.to_string(),
                url: self.url.clone(),
                output: Some(self.output_url(granule)),
            },
        }
    }
}

impl GranuleProcessor for RemoteConvert<'_> {
    fn process(&self, worker_id: usize, item: &WorkItem) -> Attempt {
        let request = self.request(&item.name);
        match remote_attempt(self.client, &request) {
            Ok(_) => {
                let output = request.parms.output.unwrap_or_default();
                info!("<{}> finished granule {}", worker_id, output);
                Attempt::Completed(format!("{}\n{},{}\n", CONVERT_HEADER, item.name, output))
            }
            Err(e) => Attempt::Retry(e.to_string()),
        }
    }
}

/// `collection`: reads the arrays locally and computes collection rows.
pub struct LocalCollection<'a> {
    pub source: &'a dyn GranuleSource,
    pub location: Location,
}

impl GranuleProcessor for LocalCollection<'_> {
    fn process(&self, worker_id: usize, item: &WorkItem) -> Attempt {
        let id = match GranuleId::parse(&item.name) {
            Ok(id) => id,
            Err(e) => return Attempt::Terminal(e.to_string()),
        };
        let data = match self.source.open(&self.location, &item.name) {
            Ok(data) => data,
            Err(e) => return local_failure(e),
        };
        let outcomes = match stats::granule_outcomes(StatSet::Collection, &id, item.size, &data) {
            Ok(outcomes) => outcomes,
            Err(e) => return Attempt::Terminal(e.to_string()),
        };

        let mut rows = Vec::new();
        for outcome in outcomes {
            match outcome {
                BeamOutcome::Row(row) => {
                    debug!("<{}> {}/{}: {} photons", worker_id, id, row.beam, row.total_photons);
                    rows.push(row);
                }
                BeamOutcome::Skipped { beam, reason } => {
                    warn!("<{}> {}/{} skipped: {}", worker_id, id, beam, reason);
                }
            }
        }
        Attempt::Completed(stats::render_block(StatSet::Collection, &rows))
    }
}

/// `check`: compares a release granule against its v1 counterpart.
pub struct ReleaseCheck<'a> {
    pub source: &'a dyn GranuleSource,
    pub v1: Location,
    pub v2: Location,
    pub plan: ComparePlan,
    pub release: String,
    pub version: String,
}

impl GranuleProcessor for ReleaseCheck<'_> {
    fn process(&self, worker_id: usize, item: &WorkItem) -> Attempt {
        let v1_name = granule::to_v1_name(&item.name, &self.release, &self.version);
        let v2 = match self.source.open(&self.v2, &item.name) {
            Ok(data) => data,
            Err(e) => return local_failure(e),
        };
        let v1 = match self.source.open(&self.v1, &v1_name) {
            Ok(data) => data,
            Err(e) => return local_failure(e),
        };

        let report = validate::compare_granule(&self.plan, &v1, &v2);
        if let Some((beam, reason)) = report.first_failure() {
            warn!("<{}> {}/{} failed check: {}", worker_id, item.name, beam, reason);
        }
        for beam in &report.skipped_beams {
            debug!("<{}> {}/{} absent from both versions", worker_id, item.name, beam);
        }
        Attempt::Completed(format!("{}\n{}\n", CHECK_HEADER, validate::check_row(&report)))
    }
}
