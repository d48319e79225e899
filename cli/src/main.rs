//! SaveVault - Command-line interface for the save backup engine.
//!
//! A thin front end for manual use and scripting. It parses arguments,
//! wires Ctrl-C to the engine's cancel token and reports progress to stderr.

use chrono::Local;
use clap::{Args, Parser, Subcommand};
use savevault::{
    backup_has_contents, backup_name, delete_backup, diff, directory_info, is_archive_path,
    read_backup_meta, tree_digest, ArchiveReader, BackupEngine, ContainerSizing, DirectoryRoot,
    EngineConfig, FileItem, FileState, HostDevice, Journal, PathFilter, ProgressSink, SaveInfo,
    TaskProgress, TransferReport, TreeDigest, TreeSource,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// SaveVault - Back up and restore console save data
#[derive(Parser, Debug)]
#[command(name = "savevault")]
#[command(version = "0.1.0")]
#[command(about = "Back up, restore and verify save data directories and archives")]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path filter file (JSON) listing save paths to leave alone
    #[arg(long, global = true, value_name = "PATH")]
    filter: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new backup of a save directory
    Backup {
        /// Mounted save root
        #[arg(long, value_name = "PATH")]
        save: PathBuf,

        /// Directory that holds the backups
        #[arg(long, value_name = "DIR")]
        backups: PathBuf,

        /// Backup name prefix; a timestamp is appended
        #[arg(long, default_value = "Backup")]
        name: String,

        #[command(flatten)]
        meta: MetaArgs,
    },

    /// Replace an existing backup with the current save data
    Overwrite {
        #[arg(long, value_name = "PATH")]
        save: PathBuf,

        /// Backup directory or .zip archive to replace
        #[arg(long, value_name = "PATH")]
        target: PathBuf,

        #[command(flatten)]
        meta: MetaArgs,
    },

    /// Restore a backup into a save directory
    Restore {
        /// Backup directory or .zip archive
        #[arg(long, value_name = "PATH")]
        backup: PathBuf,

        #[arg(long, value_name = "PATH")]
        save: PathBuf,

        /// Device name used in logs
        #[arg(long, default_value = "save")]
        device: String,

        /// Journal limit of the save device in bytes; 0 disables commits
        #[arg(long, default_value_t = 0)]
        journal_size: u64,

        /// Data size used when the backup has no valid metadata
        #[arg(long, default_value_t = 0)]
        default_save_size: i64,

        /// Journal size used when the backup has no valid metadata
        #[arg(long, default_value_t = 0)]
        default_journal_size: i64,
    },

    /// Delete a backup directory or archive
    Delete {
        #[arg(long, value_name = "PATH")]
        target: PathBuf,
    },

    /// Show a backup's metadata and contents
    Inspect {
        #[arg(long, value_name = "PATH")]
        backup: PathBuf,
    },

    /// Compare two trees or archives by BLAKE3 digest
    Verify {
        #[arg(long, value_name = "PATH")]
        left: PathBuf,

        #[arg(long, value_name = "PATH")]
        right: PathBuf,
    },
}

/// Save container description stored with the backup.
#[derive(Args, Debug, Default)]
struct MetaArgs {
    /// Title application id (hex)
    #[arg(long, value_name = "HEX", value_parser = parse_hex_u64)]
    app_id: Option<u64>,

    #[arg(long, default_value_t = 0, requires = "app_id")]
    save_data_size: i64,

    #[arg(long, default_value_t = 0, requires = "app_id")]
    save_journal_size: i64,

    #[arg(long, default_value_t = 0, requires = "app_id")]
    save_index: u16,
}

impl MetaArgs {
    fn save_info(&self) -> Option<SaveInfo> {
        self.app_id.map(|application_id| SaveInfo {
            application_id,
            sizing: ContainerSizing {
                save_data_size: self.save_data_size,
                journal_size: self.save_journal_size,
            },
            save_data_index: self.save_index,
        })
    }
}

fn parse_hex_u64(value: &str) -> Result<u64, String> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", value, e))
}

/// CLI implementation of ProgressSink for displaying transfer progress
struct CliProgress {
    verbose: bool,
    inner: TaskProgress,
    last_progress_update: Mutex<Instant>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            inner: TaskProgress::new(),
            last_progress_update: Mutex::new(Instant::now()),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    fn draw(&self) {
        // Throttle progress updates to avoid spam (max once per 200ms)
        let mut last = self
            .last_progress_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last.elapsed().as_millis() < 200 {
            return;
        }
        *last = Instant::now();

        let percent = (self.inner.progress() * 100.0) as u32;
        eprint!(
            "\rProgress: {} | {}/{}",
            Self::print_progress_bar(percent),
            Self::format_bytes(self.inner.current() as u64),
            Self::format_bytes(self.inner.goal() as u64)
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }
}

impl ProgressSink for CliProgress {
    fn reset(&self, goal: f64) {
        self.inner.reset(goal);
    }

    fn update_current(&self, current: f64) {
        self.inner.update_current(current);
        self.draw();
    }

    fn increase_current(&self, delta: f64) {
        self.inner.increase_current(delta);
        self.draw();
    }

    fn progress(&self) -> f64 {
        self.inner.progress()
    }

    fn set_status(&self, status: &str) {
        self.inner.set_status(status);
        if self.verbose {
            eprintln!("Processing: {}", status);
        }
    }

    fn file_completed(&self, item: &FileItem) {
        if self.verbose {
            let status = match item.state {
                FileState::Done => "Done",
                FileState::Skipped => "Skipped",
                FileState::Failed => "Failed",
            };
            eprintln!("  {}: {}", status, item.relative_path);
        }
    }
}

fn print_report(report: &TransferReport, elapsed: Duration) {
    eprintln!();
    eprintln!("{} complete!", report.kind);
    eprintln!("  Source: {}", report.source_path.display());
    eprintln!("  Destination: {}", report.destination_path.display());
    eprintln!(
        "Summary: {} done, {} skipped, {} failed",
        report.count(FileState::Done),
        report.count(FileState::Skipped),
        report.count(FileState::Failed)
    );
    eprintln!("Bytes written: {}", CliProgress::format_bytes(report.total_bytes_written));
    if report.commits > 0 {
        eprintln!("Journal commits: {}", report.commits);
    }
    eprintln!("Elapsed: {}", CliProgress::format_duration(elapsed));

    if report.count(FileState::Failed) > 0 {
        eprintln!();
        eprintln!("Failed files:");
        for file in report.failures() {
            match &file.error_message {
                Some(msg) => eprintln!("  {}: {}", file.relative_path, msg),
                None => eprintln!("  {}: (unknown error)", file.relative_path),
            }
        }
    }
}

fn report_result(report: &TransferReport) -> Result<(), String> {
    if report.is_success() {
        Ok(())
    } else {
        Err("One or more files failed to transfer".to_string())
    }
}

fn digest_of(path: &Path) -> Result<TreeDigest, String> {
    let digest = if is_archive_path(path) {
        let mut reader = ArchiveReader::open(path).map_err(|e| e.to_string())?;
        tree_digest(TreeSource::Archive(&mut reader))
    } else {
        tree_digest(TreeSource::Directory(path))
    };
    digest.map_err(|e| format!("Cannot hash {}: {}", path.display(), e))
}

/// Load configuration and filter, then start the engine
fn build_engine(cli: &Cli) -> Result<BackupEngine, String> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    let mut engine = BackupEngine::new(config).map_err(|e| format!("Engine setup failed: {}", e))?;
    if let Some(path) = &cli.filter {
        let filter = PathFilter::load(path).map_err(|e| e.to_string())?;
        engine = engine.with_filter(filter);
    }
    Ok(engine)
}

/// Main CLI logic - separated for testability
fn run_cli(cli: &Cli, engine: &BackupEngine) -> Result<(), String> {
    let progress = CliProgress::new(cli.verbose);
    let sink: &dyn ProgressSink = &progress;
    let start = Instant::now();

    match &cli.command {
        Command::Backup {
            save,
            backups,
            name,
            meta,
        } => {
            if !save.is_dir() {
                return Err(format!("Save directory does not exist: {}", save.display()));
            }
            let target = backups.join(backup_name(name, Local::now(), engine.config().export_to_zip));
            let report = engine
                .create_backup(save, &target, meta.save_info().as_ref(), Some(sink))
                .map_err(|e| format!("Backup failed: {}", e))?;
            print_report(&report, start.elapsed());
            println!("{}", target.display());
            report_result(&report)
        }

        Command::Overwrite { save, target, meta } => {
            if !save.is_dir() {
                return Err(format!("Save directory does not exist: {}", save.display()));
            }
            let report = engine
                .overwrite_backup(save, target, meta.save_info().as_ref(), Some(sink))
                .map_err(|e| format!("Overwrite failed: {}", e))?;
            print_report(&report, start.elapsed());
            report_result(&report)
        }

        Command::Restore {
            backup,
            save,
            device,
            journal_size,
            default_save_size,
            default_journal_size,
        } => {
            let root = if *journal_size > 0 {
                let device = Arc::new(HostDevice::new(device.as_str(), save));
                let journal = Journal::new(*journal_size, device).map_err(|e| e.to_string())?;
                DirectoryRoot::journaled(save, journal)
            } else {
                DirectoryRoot::new(save)
            };
            let defaults = ContainerSizing {
                save_data_size: *default_save_size,
                journal_size: *default_journal_size,
            };
            let outcome = engine
                .restore_backup(backup, &root, defaults, Some(sink))
                .map_err(|e| format!("Restore failed: {}", e))?;
            if let Some(auto) = &outcome.auto_backup {
                eprintln!("Previous save kept in {}", auto.display());
            }
            if outcome.meta.is_none() {
                eprintln!("No valid save metadata; used default container size");
            }
            print_report(&outcome.report, start.elapsed());
            report_result(&outcome.report)
        }

        Command::Delete { target } => {
            delete_backup(target).map_err(|e| format!("Delete failed: {}", e))?;
            eprintln!("Deleted {}", target.display());
            Ok(())
        }

        Command::Inspect { backup } => {
            if !backup.exists() {
                return Err(format!("Backup does not exist: {}", backup.display()));
            }
            let has_contents = backup_has_contents(backup).map_err(|e| e.to_string())?;
            println!("Backup: {}", backup.display());
            println!("Format: {}", if is_archive_path(backup) { "zip" } else { "directory" });
            println!("Has contents: {}", has_contents);

            match read_backup_meta(backup) {
                Ok(Some(meta)) => {
                    println!("Application ID: {:016X}", meta.application_id);
                    println!("Save data size: {}", meta.save_data_size);
                    println!("Journal size: {}", meta.journal_size);
                    println!("Save index: {}", meta.save_data_index);
                }
                Ok(None) => println!("Metadata: none"),
                Err(e) => println!("Metadata: invalid ({})", e),
            }

            if !is_archive_path(backup) {
                let info = directory_info(backup).map_err(|e| e.to_string())?;
                println!(
                    "Contents: {} directories, {} files, {}",
                    info.directories,
                    info.files,
                    CliProgress::format_bytes(info.total_bytes)
                );
            }
            Ok(())
        }

        Command::Verify { left, right } => {
            let left_digest = digest_of(left)?;
            let right_digest = digest_of(right)?;
            let differences = diff(&left_digest, &right_digest);
            debug!(left = left_digest.len(), right = right_digest.len(), "digests computed");

            if differences.is_empty() {
                println!("Identical: {} entries", left_digest.len());
                Ok(())
            } else {
                for path in &differences {
                    println!("  differs: {}", path);
                }
                Err(format!("{} entries differ", differences.len()))
            }
        }
    }
}

/// Parse arguments, set up logging and Ctrl-C, then run the command
fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match build_engine(&cli) {
        Ok(engine) => {
            let cancel = engine.cancel_token();
            if let Err(e) = ctrlc::set_handler(move || {
                eprintln!("\nInterrupted by user, stopping after the current buffer...");
                cancel.cancel();
            }) {
                eprintln!("Warning: cannot install Ctrl-C handler: {}", e);
            }

            match run_cli(&cli, &engine) {
                Ok(()) => 0,
                Err(msg) => {
                    eprintln!("Error: {}", msg);
                    2
                }
            }
        }
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}
