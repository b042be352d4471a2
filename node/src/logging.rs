use anyhow::{ Context, Result };
use std::fs;
use std::fs::OpenOptions;
use std::io::{ BufRead, BufReader, Write };
use std::path::Path;
use std::sync::atomic::{ AtomicBool, Ordering };
use tracing::info;
use tracing_log::LogTracer;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

const MAX_LOG_FILE_LEN: u64 = 1024 * 1024;

pub struct DkNetLogInitializer;

impl DkNetLogInitializer {
    pub fn init(data_dir: &Path) {
        if !LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
            Self::configure(data_dir).expect("Initialize logger");
            info!("Logging initialized");
        }
    }

    fn configure(data_dir: &Path) -> Result<()> {
        let log_path = data_dir.join("logs.log");
        truncate_log_file(log_path.clone(), MAX_LOG_FILE_LEN)?;

        let output = std::io::stdout.with_max_level(tracing::Level::INFO);
        let stdout_sub = fmt::Layer::new().with_writer(output).with_ansi(true);

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?
            .with_max_level(tracing::Level::INFO);
        let logfile_sub = fmt::Layer::new().with_writer(log_file).with_ansi(false);

        let collector = tracing_subscriber::registry().with(stdout_sub).with(logfile_sub);
        LogTracer::init().context("Set logger")?;
        tracing::subscriber::set_global_default(collector).context("Set tracing subscriber")
    }
}

/// Truncate file from beginning if its size is more than max_length.
/// Leaves max_length / 2 of its initial size.
/// Returns bool meaning whether file was truncated.
fn truncate_log_file<P: AsRef<Path>>(path: P, max_length: u64) -> Result<bool> {
    let log_path = path.as_ref();
    if !log_path.exists() {
        return Ok(false);
    }
    let current_file_len = fs::metadata(log_path).context("Get log file metadata")?.len();
    if current_file_len <= max_length {
        return Ok(false);
    }

    let file_name = log_path
        .file_name()
        .context("Get log file name from path")?
        .to_str()
        .context("Get log file name from OsStr")?;
    let tmp_log_path = log_path
        .parent()
        .context("Parent directory of log file")?
        .join(format!("{}.tmp", file_name));
    let mut tmp_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp_log_path.clone())
        .context("Open/create tmp file to truncate log")?;

    let to_remove_len = current_file_len - max_length / 2;
    let file = fs::File::open(log_path).context("Open log file for truncation")?;
    let mut skipped = 0u64;
    for line in BufReader::new(&file).lines().map_while(Result::ok) {
        if skipped < to_remove_len {
            skipped += (line.len() as u64) + 1;
            continue;
        }
        writeln!(tmp_file, "{}", line).context("Write line to temp log file")?;
    }

    fs::remove_file(log_path).context("Remove old log file")?;
    fs::rename(tmp_log_path, log_path).context("Rename new log file")?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_files_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.log");
        fs::write(&path, "one line\n").unwrap();
        assert!(!truncate_log_file(&path, 1024).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "one line\n");
    }

    #[test]
    fn oversized_files_keep_only_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.log");
        let mut content = String::new();
        for index in 0..200 {
            content.push_str(&format!("log line number {}\n", index));
        }
        fs::write(&path, &content).unwrap();

        assert!(truncate_log_file(&path, 1000).unwrap());
        let remaining = fs::read_to_string(&path).unwrap();
        assert!((remaining.len() as u64) <= 1000);
        assert!(!remaining.contains("log line number 0\n"));
        assert!(remaining.ends_with("log line number 199\n"));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!truncate_log_file(dir.path().join("absent.log"), 1024).unwrap());
    }
}
