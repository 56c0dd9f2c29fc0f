mod logging;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use romscan_core::{run_scan, start_scan, ScanOptions};

#[derive(Parser)]
#[command(name = "romscan", version, about = "Identify game content against signature tables and write collections")]
struct Cli {
    /// Directory (scanned recursively) or single file
    path: PathBuf,

    /// Directory holding <Table>.db signature tables
    #[arg(long)]
    databases: Option<PathBuf>,

    /// Directory collections (<Table>.lpl) are written to
    #[arg(long)]
    playlists: Option<PathBuf>,

    /// JSON options file; flags given here override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only search these tables (repeatable)
    #[arg(long = "restrict-to", value_name = "TABLE")]
    restrict_to: Vec<String>,

    /// Expand archives without matching the archive file itself
    #[arg(long)]
    no_archive_top_level: bool,

    /// Stop after the first identified file
    #[arg(long)]
    first_match_only: bool,

    /// Only consider these extensions (repeatable, e.g. --ext cue --ext bin)
    #[arg(long = "ext", value_name = "EXT")]
    exts: Vec<String>,

    /// Descend into hidden files and directories
    #[arg(long)]
    include_hidden: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn options(&self) -> anyhow::Result<ScanOptions> {
        let mut options = match &self.config {
            Some(path) => ScanOptions::from_json_file(path)
                .with_context(|| format!("loading options from {}", path.display()))?,
            None => ScanOptions::default(),
        };
        if let Some(dir) = &self.databases {
            options.database_dir = dir.clone();
        }
        if let Some(dir) = &self.playlists {
            options.playlist_dir = dir.clone();
        }
        if !self.restrict_to.is_empty() {
            options.restrict_to_core_tables = true;
            options.core_tables = self.restrict_to.clone();
        }
        if !self.exts.is_empty() {
            options.file_exts = self.exts.clone();
        }
        options.archive_as_candidate &= !self.no_archive_top_level;
        options.first_match_only |= self.first_match_only;
        options.include_hidden |= self.include_hidden;
        Ok(options)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logger(cli.verbose);
    let t_total = std::time::Instant::now();

    let options = cli.options()?;
    info!(
        "Signature tables: {}, collections: {}",
        options.database_dir.display(),
        options.playlist_dir.display()
    );

    let mut task = start_scan(&cli.path, options)
        .with_context(|| format!("starting scan of {}", cli.path.display()))?;

    let token = task.cancel_token();
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, cancelling scan...");
        token.cancel();
    })?;

    let pb = ProgressBar::new(100);
    pb.set_style(ProgressStyle::default_bar().template("[{bar:40}] {pos}% {msg}")?);

    let pb_cb = pb.clone();
    let result = run_scan(&mut task, &move |_stage, current, _total, message| {
        pb_cb.set_position(current);
        pb_cb.set_message(message.to_string());
    });
    pb.finish_and_clear();
    let summary = result?;

    println!(
        "Done! {} examined, {} matched, {} unmatched, {} skipped, {} archive(s) expanded, {} manifest(s) collapsed ({:.2}s)",
        summary.candidates_examined,
        summary.matched,
        summary.unmatched,
        summary.skipped,
        summary.archives_expanded,
        summary.manifests_collapsed,
        t_total.elapsed().as_secs_f64()
    );
    println!(
        "{} collection(s) written, {} entr(ies) added, {} already present",
        summary.write.collections_written, summary.write.entries_added, summary.write.duplicates_skipped
    );

    Ok(())
}
