use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use env_logger::{Builder, Env};
use log::info;
use structopt::clap::AppSettings;
use structopt::StructOpt;

use atl24_batch::catalog::{self, LocalObjectStore, MatchRule, WorkItem};
use atl24_batch::dispatch::{self, DispatchConfig, GranuleProcessor, RetryPolicy};
use atl24_batch::granule::{self, Location, TEST_GRANULE};
use atl24_batch::job::CommandJobClient;
use atl24_batch::pipeline::{self, RunOptions, CONVERT_HEADER};
use atl24_batch::runner;
use atl24_batch::source::JsonGranuleSource;
use atl24_batch::stats::StatSet;
use atl24_batch::validate::{ComparePlan, CHECK_HEADER};

#[derive(Debug, StructOpt)]
struct Common {
    /// Summary CSV; rows are appended, granules already in it are skipped
    #[structopt(long = "summary-file", parse(from_os_str))]
    summary_file: Option<PathBuf>,

    /// Error log, one failed granule per line
    #[structopt(long = "error-file", parse(from_os_str))]
    error_file: Option<PathBuf>,

    /// Location of the granules to process
    #[structopt(long = "url", default_value = "s3://sliderule-public")]
    url: String,

    #[structopt(long = "release", default_value = "002")]
    release: String,

    #[structopt(long = "version", default_value = "01")]
    version: String,

    /// Number of workers (overrides --desired-nodes)
    #[structopt(long = "concurrency")]
    concurrency: Option<usize>,

    /// Capacity requested from the compute service; also the default worker count
    #[structopt(long = "desired-nodes")]
    desired_nodes: Option<usize>,

    /// Seconds between worker launches
    #[structopt(long = "startup-separation", default_value = "1")]
    startup_separation: u64,

    /// Attempts per granule
    #[structopt(long = "retries", default_value = "3")]
    retries: u32,

    /// Seconds between attempts
    #[structopt(long = "retry-delay", default_value = "30")]
    retry_delay: u64,

    /// Requeue granules listed in the error log
    #[structopt(long = "reprocess-errors")]
    reprocess_errors: bool,

    /// Print the counts and exit without processing
    #[structopt(long = "report-only")]
    report_only: bool,

    /// Process only the test granule with a single worker
    #[structopt(long = "test")]
    test: bool,

    /// Directory standing in for the object store: <store-root>/<bucket>/<key>
    #[structopt(long = "store-root", parse(from_os_str), default_value = "store")]
    store_root: PathBuf,
}

impl Common {
    fn paths(&self, stem: &str) -> (PathBuf, PathBuf) {
        let summary = self
            .summary_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.csv", stem)));
        let errors = self
            .error_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}_errors.txt", stem)));
        (summary, errors)
    }

    fn options(&self, test_granule: &str) -> RunOptions {
        RunOptions {
            reprocess: self.reprocess_errors,
            report_only: self.report_only,
            test_granule: self.test.then(|| test_granule.to_string()),
        }
    }

    fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            concurrency: dispatch::resolve_concurrency(self.concurrency, self.desired_nodes, self.test),
            startup_separation: Duration::from_secs(self.startup_separation),
            retry: RetryPolicy {
                attempts: self.retries.max(1),
                delay: Duration::from_secs(self.retry_delay),
            },
        }
    }

    fn store(&self) -> LocalObjectStore {
        LocalObjectStore::new(&self.store_root)
    }

    fn catalog(&self) -> Result<Vec<WorkItem>> {
        if self.test {
            return Ok(Vec::new());
        }
        let location = Location::parse(&self.url);
        catalog::list_catalog(&self.store(), &location, &MatchRule::for_release(&self.release, &self.version))
            .with_context(|| format!("Failed to list {}", self.url))
    }
}

#[derive(Debug, StructOpt)]
struct JobOpt {
    /// Command run for each job as `<command> <input json> <output json>`
    #[structopt(long = "job-command", default_value = "atl24_batch runner --data-root store")]
    job_command: String,

    #[structopt(long = "image", default_value = "atl24d:latest")]
    image: String,
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "atl24_batch",
    about = "Batch processing, statistics and validation of ATL24 granules",
    global_settings = &[AppSettings::DisableVersion, AppSettings::VersionlessSubcommands]
)]
enum Opt {
    /// Collect per-beam metadata for every granule through the compute service
    Collect {
        #[structopt(flatten)]
        common: Common,
        #[structopt(flatten)]
        job: JobOpt,
    },

    /// Convert v1 granules to the current release through the compute service
    Convert {
        #[structopt(flatten)]
        common: Common,
        #[structopt(flatten)]
        job: JobOpt,

        /// File listing the v1 granules to convert, one per line
        #[structopt(long = "input-file", parse(from_os_str), default_value = "data/atl24_granules_cycle_1.txt")]
        input_file: PathBuf,

        /// Glob of granule list files (overrides --input-file)
        #[structopt(long = "input-files")]
        input_files: Option<String>,

        /// Where converted granules are written
        #[structopt(long = "output-url", default_value = "s3://sliderule-stage")]
        output_url: String,
    },

    /// Build the collection table from locally readable granules
    Collection {
        #[structopt(flatten)]
        common: Common,

        /// Root of the granule exports
        #[structopt(long = "data-root", parse(from_os_str), default_value = "store")]
        data_root: PathBuf,
    },

    /// Validate release granules against their v1 counterparts
    Check {
        #[structopt(flatten)]
        common: Common,

        #[structopt(long = "data-root", parse(from_os_str), default_value = "store")]
        data_root: PathBuf,

        /// Location of the v1 granules
        #[structopt(long = "url-v1", default_value = "s3://sliderule-public")]
        url_v1: String,
    },

    /// Serve one job: read the input JSON, write the response JSON
    Runner {
        #[structopt(parse(from_os_str))]
        input: PathBuf,

        #[structopt(parse(from_os_str))]
        output: PathBuf,

        #[structopt(long = "data-root", parse(from_os_str), default_value = "store")]
        data_root: PathBuf,
    },
}

fn run_tool<P: GranuleProcessor>(
    common: &Common,
    catalog: Vec<WorkItem>,
    stem: &str,
    header: Option<&str>,
    test_granule: &str,
    processor: &P,
) -> Result<()> {
    let (summary, errors) = common.paths(stem);
    let options = common.options(test_granule);
    let prepared = pipeline::prepare(catalog, &summary, &errors, header, &options)
        .with_context(|| format!("Failed to open ledger {:?} / {:?}", summary, errors))?;

    let config = common.dispatch_config();
    info!(
        "Workers: {}, retries: {}, retry delay: {:?}",
        config.concurrency, config.retry.attempts, config.retry.delay
    );
    let result = pipeline::execute(&prepared, processor, &config, &options)
        .with_context(|| format!("Run aborted while writing {:?}", summary))?;
    println!(
        "Completed: {}  Failed: {}  Rows written: {}",
        result.completed, result.failed, result.rows_written
    );
    Ok(())
}

fn convert_catalog(common: &Common, input_file: &Path, input_files: Option<&str>, output_url: &str) -> Result<Vec<WorkItem>> {
    if common.test {
        return Ok(Vec::new());
    }
    let converted = catalog::list_converted(
        &common.store(),
        &Location::parse(output_url),
        &common.release,
        &common.version,
    )
    .with_context(|| format!("Failed to list {}", output_url))?;

    let lists = catalog::granule_list_paths(input_file, input_files)?;
    let requested = catalog::read_granule_lists(&lists).context("Failed to read granule lists")?;
    let (done, left): (Vec<WorkItem>, Vec<WorkItem>) =
        requested.into_iter().partition(|item| converted.contains(&item.name));
    println!("Granules Already Converted: {}", done.len());
    Ok(left)
}

fn main() -> Result<()> {
    let start_time = Instant::now();

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    builder.init();

    match Opt::from_args() {
        Opt::Collect { common, job } => {
            let client = CommandJobClient::new();
            let processor = pipeline::RemoteMetadata {
                client: &client,
                image: job.image.clone(),
                command: job.job_command.clone(),
                url: common.url.clone(),
            };
            let catalog = common.catalog()?;
            run_tool(&common, catalog, "atl24_metadata", None, TEST_GRANULE, &processor)?;
        }
        Opt::Convert {
            common,
            job,
            input_file,
            input_files,
            output_url,
        } => {
            let client = CommandJobClient::new();
            let processor = pipeline::RemoteConvert {
                client: &client,
                image: job.image.clone(),
                command: job.job_command.clone(),
                url: common.url.clone(),
                output: Location::parse(&output_url),
                release: common.release.clone(),
                version: common.version.clone(),
            };
            let catalog = convert_catalog(&common, &input_file, input_files.as_deref(), &output_url)?;
            let test_granule = granule::to_v1_name(TEST_GRANULE, &common.release, &common.version);
            run_tool(
                &common,
                catalog,
                "atl24_convert",
                Some(CONVERT_HEADER),
                &test_granule,
                &processor,
            )?;
        }
        Opt::Collection { common, data_root } => {
            let source = JsonGranuleSource::new(&data_root);
            let processor = pipeline::LocalCollection {
                source: &source,
                location: Location::parse(&common.url),
            };
            let header = StatSet::Collection.header();
            let catalog = common.catalog()?;
            run_tool(
                &common,
                catalog,
                "atl24_collection",
                Some(header.as_str()),
                TEST_GRANULE,
                &processor,
            )?;
        }
        Opt::Check {
            common,
            data_root,
            url_v1,
        } => {
            let source = JsonGranuleSource::new(&data_root);
            let processor = pipeline::ReleaseCheck {
                source: &source,
                v1: Location::parse(&url_v1),
                v2: Location::parse(&common.url),
                plan: ComparePlan::release_check(),
                release: common.release.clone(),
                version: common.version.clone(),
            };
            let catalog = common.catalog()?;
            run_tool(
                &common,
                catalog,
                "atl24_check",
                Some(CHECK_HEADER),
                TEST_GRANULE,
                &processor,
            )?;
        }
        Opt::Runner {
            input,
            output,
            data_root,
        } => {
            let source = JsonGranuleSource::new(&data_root);
            let response = runner::run_files(&source, &input, &output)
                .with_context(|| format!("Failed to serve job {:?}", input))?;
            if !response.status {
                log::warn!("Job failed: {}", response.result);
            }
        }
    }

    info!("Finished in {:.2?}", start_time.elapsed());
    Ok(())
}
