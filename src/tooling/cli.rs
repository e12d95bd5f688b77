//! CLI Tooling
//!
//! Command-line interface for bootstrapping and diagnosing a sync root:
//! run the engine, scan the local tree, query status, inspect listings.

use crate::config::{ConfigLoader, SyncConfig};
use crate::db::{SledSyncDb, SyncDbStore};
use crate::engine::{CycleReport, SyncEngine};
use crate::error::SyncError;
use crate::listing::parse_full_listing;
use crate::logging::{init_logging, LoggingConfig};
use crate::observer::{explore, IgnoreMatcher};
use crate::propagation::NoVfs;
use crate::snapshot::{NameCaseRule, SharedSnapshot, SnapshotItem};
use crate::status::{StatusService, UnsyncableRegistry};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use serde_json::json;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Syncore CLI - two-way directory synchronization
#[derive(Parser)]
#[command(name = "syncore")]
#[command(about = "Keep a local directory and a remote drive folder in agreement")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Sync root directory
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, file+stderr, both)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Apply the logging flags on top of the configured logging section
    pub fn logging_overrides(&self, mut logging: LoggingConfig) -> LoggingConfig {
        if let Some(level) = &self.log_level {
            logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            logging.format = format.clone();
        }
        if let Some(output) = &self.log_output {
            logging.output = output.clone();
        }
        if let Some(file) = &self.log_file {
            logging.file = Some(file.clone());
        }
        logging
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synchronize the root until stopped
    Run {
        /// Run a single cycle and print its report
        #[arg(long)]
        once: bool,
        /// Output format for --once (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Explore the local tree and summarize it
    Scan {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Show the sync status of a path, or of the database when no path is given
    Status {
        /// Path inside the sync root
        path: Option<PathBuf>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Parse a full listing body saved to a file
    ParseListing {
        /// CSV listing file
        file: PathBuf,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
        /// Maximum rows shown in text output
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

/// CLI context for one sync root
pub struct CliContext {
    root: PathBuf,
    config: SyncConfig,
}

impl CliContext {
    /// Load the configuration for `root`, or from `config_path` when given
    pub fn new(root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, SyncError> {
        let mut config = match &config_path {
            Some(path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(&root)?,
        };
        let root = match &config.sync.root {
            Some(configured) if config_path.is_some() => configured.clone(),
            _ => root,
        };
        config.sync.root = Some(root.clone());
        Ok(Self { root, config })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Install the log subscriber from the configured section plus flag overrides
    pub fn init_logging(&mut self, cli: &Cli) -> Result<(), SyncError> {
        self.config.logging = cli.logging_overrides(self.config.logging.clone());
        init_logging(Some(&self.config.logging), Some(&self.root))
    }

    fn case_rule(&self) -> NameCaseRule {
        match self.config.sync.case_sensitive {
            Some(true) => NameCaseRule::Sensitive,
            Some(false) => NameCaseRule::Insensitive,
            None => NameCaseRule::for_local_platform(),
        }
    }

    /// Execute a CLI command
    pub fn execute(&self, command: &Commands) -> Result<String, SyncError> {
        match command {
            Commands::Run { once, format } => self.handle_run(*once, format),
            Commands::Scan { format } => self.handle_scan(format),
            Commands::Status { path, format } => self.handle_status(path.as_deref(), format),
            Commands::ParseListing { file, format, limit } => {
                self.handle_parse_listing(file, format, *limit)
            }
        }
    }

    fn handle_run(&self, once: bool, format: &str) -> Result<String, SyncError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| SyncError::io(&self.root, e))?;
        runtime.block_on(async {
            let mut engine = SyncEngine::open(self.config.clone())?;
            if once {
                let report = engine.run_cycle().await?;
                return format_cycle_report(&report, format);
            }
            engine.start_watching()?;
            info!(root = %engine.root().display(), "Synchronization started");
            engine.run().await?;
            let state = engine.state();
            Ok(format!("Synchronization stopped after {} cycles", state.cycles))
        })
    }

    fn handle_scan(&self, format: &str) -> Result<String, SyncError> {
        let started = Instant::now();
        let root = dunce::canonicalize(&self.root).map_err(|e| SyncError::io(&self.root, e))?;
        let ignore = IgnoreMatcher::new(&self.config.watcher.ignore_patterns);
        let (snapshot, report) = explore(&root, self.case_rule(), &ignore)?;
        let directories = snapshot.items().filter(|item| item.is_dir()).count();
        let files = snapshot.items().filter(|item| !item.is_dir()).count();
        let bytes: i64 = snapshot.items().filter(|item| !item.is_dir()).map(|item| item.size).sum();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match format {
            "json" => Ok(json!({
                "root": root.display().to_string(),
                "directories": directories,
                "files": files,
                "bytes": bytes,
                "inserted": report.inserted,
                "duplicates": report.duplicates.len(),
                "orphans": report.orphans.len(),
                "rejected": report.rejected.len(),
                "elapsed_ms": elapsed_ms,
            })
            .to_string()),
            "text" => {
                let mut table = Table::new();
                table.load_preset(comfy_table::presets::UTF8_FULL);
                table.set_header(vec!["Root", "Directories", "Files", "Bytes", "Quarantined", "Elapsed"]);
                table.add_row(vec![
                    root.display().to_string(),
                    directories.to_string(),
                    files.to_string(),
                    bytes.to_string(),
                    report.quarantined().to_string(),
                    format!("{} ms", elapsed_ms),
                ]);
                let mut output = table.to_string();
                for (id, error) in &report.rejected {
                    output.push_str(&format!("\nrejected {}: {}", id, error));
                }
                Ok(output)
            }
            other => Err(invalid_format(other)),
        }
    }

    fn open_db(&self) -> Result<SledSyncDb, SyncError> {
        let root = dunce::canonicalize(&self.root).map_err(|e| SyncError::io(&self.root, e))?;
        let db_path = self.config.storage.resolve_db_path(&root)?;
        if !db_path.exists() {
            return Err(SyncError::ConfigError(format!(
                "No sync database at {}; run `syncore run` first",
                db_path.display()
            )));
        }
        Ok(SledSyncDb::open(&db_path)?)
    }

    fn handle_status(&self, path: Option<&Path>, format: &str) -> Result<String, SyncError> {
        let db: Arc<dyn SyncDbStore> = Arc::new(self.open_db()?);
        let path = match path {
            Some(path) => path,
            None => return self.database_status(db.as_ref(), format),
        };

        let root = dunce::canonicalize(&self.root).map_err(|e| SyncError::io(&self.root, e))?;
        let ignore = IgnoreMatcher::new(&self.config.watcher.ignore_patterns);
        let (snapshot, _) = explore(&root, self.case_rule(), &ignore)?;
        let service = StatusService::new(
            root.clone(),
            SharedSnapshot::new(snapshot),
            db,
            Arc::new(NoVfs),
            UnsyncableRegistry::default(),
        );
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        let status = service.sync_status(&absolute);
        let watched = service.is_watched(&absolute);

        match format {
            "json" => Ok(json!({
                "path": path.display().to_string(),
                "watched": watched,
                "status": status,
            })
            .to_string()),
            "text" => {
                let mut table = Table::new();
                table.load_preset(comfy_table::presets::UTF8_FULL);
                table.set_header(vec!["Path", "Watched", "Status"]);
                table.add_row(vec![
                    path.display().to_string(),
                    watched.to_string(),
                    format!("{:?}", status),
                ]);
                Ok(table.to_string())
            }
            other => Err(invalid_format(other)),
        }
    }

    fn database_status(&self, db: &dyn SyncDbStore, format: &str) -> Result<String, SyncError> {
        let nodes = db.all()?;
        let directories = nodes.iter().filter(|node| node.is_dir()).count();
        let files = nodes.len() - directories;
        let half_paired = nodes
            .iter()
            .filter(|node| node.local_id.is_none() || node.remote_id.is_none())
            .count();
        let cursor = db.cursor()?;

        match format {
            "json" => Ok(json!({
                "root": self.root.display().to_string(),
                "pairs": nodes.len(),
                "directories": directories,
                "files": files,
                "half_paired": half_paired,
                "cursor": cursor,
            })
            .to_string()),
            "text" => {
                let mut table = Table::new();
                table.load_preset(comfy_table::presets::UTF8_FULL);
                table.set_header(vec!["Pairs", "Directories", "Files", "Half paired", "Cursor"]);
                table.add_row(vec![
                    nodes.len().to_string(),
                    directories.to_string(),
                    files.to_string(),
                    half_paired.to_string(),
                    cursor.unwrap_or_else(|| "-".to_string()),
                ]);
                Ok(table.to_string())
            }
            other => Err(invalid_format(other)),
        }
    }

    fn handle_parse_listing(&self, file: &Path, format: &str, limit: usize) -> Result<String, SyncError> {
        let reader = BufReader::new(File::open(file).map_err(|e| SyncError::io(file, e))?);
        let listing = parse_full_listing(reader)?;
        match format {
            "json" => Ok(json!({
                "cursor": listing.cursor,
                "ignored": listing.ignored,
                "items": listing.items,
            })
            .to_string()),
            "text" => Ok(format_listing_text(&listing.cursor, &listing.items, listing.ignored, limit)),
            other => Err(invalid_format(other)),
        }
    }
}

fn invalid_format(format: &str) -> SyncError {
    SyncError::ConfigError(format!("Invalid output format: {} (must be 'text' or 'json')", format))
}

fn format_listing_text(cursor: &str, items: &[SnapshotItem], ignored: usize, limit: usize) -> String {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Id", "Parent", "Name", "Type", "Size", "Modified", "Write", "Link"]);
    for item in items.iter().take(limit) {
        table.add_row(vec![
            item.id.clone(),
            item.parent_id.clone(),
            item.name.clone(),
            if item.is_dir() { "dir" } else { "file" }.to_string(),
            item.size.to_string(),
            item.last_modified.to_string(),
            item.can_write.to_string(),
            item.is_link.to_string(),
        ]);
    }
    let mut output = format!(
        "Cursor: {}\nItems: {} ({} ignored)\n{}",
        cursor,
        items.len(),
        ignored,
        table
    );
    if items.len() > limit {
        output.push_str(&format!("\n... {} more", items.len() - limit));
    }
    output
}

fn format_cycle_report(report: &CycleReport, format: &str) -> Result<String, SyncError> {
    match format {
        "json" => serde_json::to_string_pretty(report)
            .map_err(|e| SyncError::ConfigError(format!("Failed to serialize cycle report: {}", e))),
        "text" => {
            let mut table = Table::new();
            table.load_preset(comfy_table::presets::UTF8_FULL);
            table.set_header(vec!["Operation", "Count"]);
            for (kind, count) in &report.operations {
                table.add_row(vec![kind.to_string(), count.to_string()]);
            }
            let mut output = format!(
                "{}\ncompleted {}, failed {}, skipped {}, unsyncable {} in {} ms",
                table,
                report.completed,
                report.failed,
                report.skipped,
                report.unsyncable,
                report.elapsed_ms
            );
            for conflict in &report.conflicts {
                output.push_str(&format!(
                    "\nconflict {:?} on {} resolved by {:?} ({} kept)",
                    conflict.kind,
                    conflict.path.display(),
                    conflict.resolution,
                    conflict.winner
                ));
            }
            Ok(output)
        }
        other => Err(invalid_format(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeType;
    use std::io::Write;

    fn context(root: &Path) -> CliContext {
        let mut config = SyncConfig::default();
        config.sync.root = Some(root.to_path_buf());
        CliContext {
            root: root.to_path_buf(),
            config,
        }
    }

    #[test]
    fn test_logging_flags_override_config() {
        let cli = Cli::parse_from(["syncore", "--log-level", "debug", "--log-format", "json", "scan"]);
        let logging = cli.logging_overrides(LoggingConfig::default());
        assert_eq!(logging.level, "debug");
        assert_eq!(logging.format, "json");
        assert_eq!(logging.output, "stderr");
    }

    #[test]
    fn test_parse_listing_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listing.csv");
        let mut file = File::create(&path).unwrap();
        write!(
            file,
            "cursor-7\nid,parent_id,name,type,size,created_at,last_modified,is_link,can_write\n\
             0,1,kDrive2,dir,1000,123,124,0,1\n#EOF\n"
        )
        .unwrap();

        let output = context(dir.path())
            .execute(&Commands::ParseListing {
                file: path,
                format: "json".to_string(),
                limit: 10,
            })
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["cursor"], "cursor-7");
        assert_eq!(value["items"][0]["name"], "kDrive2");
        assert_eq!(value["items"][0]["node_type"], "Directory");
    }

    #[test]
    fn test_scan_counts_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/a.txt"), b"abc").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), b"x").unwrap();

        let output = context(dir.path())
            .execute(&Commands::Scan {
                format: "json".to_string(),
            })
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["directories"], 1);
        assert_eq!(value["files"], 1);
        assert_eq!(value["bytes"], 3);
    }

    #[test]
    fn test_listing_text_is_truncated_to_limit() {
        let items: Vec<SnapshotItem> = (0..3)
            .map(|i| SnapshotItem::new(format!("{}", i + 10), "1", format!("f{}", i), NodeType::File))
            .collect();
        let output = format_listing_text("c", &items, 0, 2);
        assert!(output.contains("f1"));
        assert!(!output.contains("f2"));
        assert!(output.ends_with("... 1 more"));
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = context(dir.path()).execute(&Commands::Scan {
            format: "yaml".to_string(),
        });
        assert!(matches!(result, Err(SyncError::ConfigError(_))));
    }
}
