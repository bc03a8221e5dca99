use tripdata_core::{
    fetch::{HttpClientError, TemplateError},
    period::PeriodError,
    pipeline::{PipelineError, Stage},
};

use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("Invalid {flag} URL template: {source}"))]
    InvalidTemplate {
        flag: &'static str,
        source: TemplateError,
    },

    #[snafu(display("Invalid --as-of '{input}': {source}. Expected YYYY-MM."))]
    InvalidAsOf { input: String, source: PeriodError },

    #[snafu(display("--threads and --fetch-concurrency must be at least 1"))]
    ZeroWorkers,

    #[snafu(display("Failed to set up HTTP client: {source}"))]
    HttpClient { source: HttpClientError },

    #[snafu(display(
        "Pipeline failed while {stage}: {source}. \
         The watermark was not advanced; rerun to retry the same range."
    ))]
    RunFailed {
        stage: Stage,
        #[snafu(source(from(PipelineError, Box::new)))]
        source: Box<PipelineError>,
    },
}
