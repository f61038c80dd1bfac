//! Log output: stdout plus a daily rolling file.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File names look like `<prefix>.<yyyy-mm-dd>.log`.
pub const LOG_FILE_PREFIX: &str = "fishsense_data_processing_workflow_worker";
const LOG_FILE_SUFFIX: &str = "log";

/// Daily files kept on disk, today's included.
const MAX_LOG_FILES: usize = 5;

const DEFAULT_FILTER: &str = "fishsense_worker=debug,fishsense_pipeline=info";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("cannot create log directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open log file: {0}")]
    Appender(#[from] InitError),

    #[error("cannot install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

/// Daily rotating log file in `dir`, created if missing. Older files
/// beyond [`MAX_LOG_FILES`] are pruned on rotation.
pub fn file_appender(dir: &Path) -> Result<RollingFileAppender, LoggingError> {
    std::fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDir {
        path: dir.display().to_string(),
        source,
    })?;
    Ok(RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(MAX_LOG_FILES)
        .build(dir)?)
}

/// Install the global subscriber. Hold the guard until exit; dropping it
/// flushes buffered file output.
pub fn init(dir: &Path) -> Result<WorkerGuard, LoggingError> {
    let (writer, guard) = tracing_appender::non_blocking(file_appender(dir)?);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::fs;
    use std::io::Write;

    #[test]
    fn writes_a_dated_file_in_a_new_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("logs");
        let mut appender = file_appender(&dir).unwrap();
        writeln!(appender, "worker started").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with(LOG_FILE_PREFIX), "{}", names[0]);
        assert!(names[0].ends_with(".log"), "{}", names[0]);
        let contents = fs::read_to_string(dir.join(&names[0])).unwrap();
        assert!(contents.contains("worker started"));
    }

    #[test]
    fn a_file_in_place_of_the_directory_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_matches!(file_appender(file.path()), Err(LoggingError::CreateDir { .. }));
    }
}
