use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tapeid::cancel::CancelToken;
use tapeid::config::EngineParams;
use tapeid::db::models::NewTrack;
use tapeid::db::Database;
use tapeid::ingest::{self, IngestJob};
use tapeid::matcher::{self, QueryOptions, RecognizeError, Recognition, Status};
use tapeid::source::RawPcmFile;
use tapeid::spectrum::ExtractError;

/// Extensions treated as raw f32le mono PCM during directory sweeps
const PCM_EXTENSIONS: &[&str] = &["f32", "pcm", "raw"];

// Exit codes of the recognition CLI
const EXIT_MATCH: u8 = 0;
const EXIT_NO_MATCH: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_CORRUPT_INPUT: u8 = 3;
const EXIT_DATABASE: u8 = 4;

#[derive(Parser)]
#[command(name = "tapeid", version, about = "Identify audio snippets against an indexed library")]
struct Cli {
    /// Path to the SQLite fingerprint database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index reference tracks (raw f32le mono PCM files or directories)
    Ingest {
        /// Files or directories to ingest
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Artist recorded for every ingested track
        #[arg(long)]
        artist: Option<String>,

        /// Number of parallel workers
        #[arg(short = 'j', long, default_value = "2")]
        jobs: usize,
    },

    /// Recognize a snippet (raw f32le mono PCM)
    Recognize {
        /// Snippet file
        file: PathBuf,

        /// Number of ranked candidates to return
        #[arg(long, default_value = "3")]
        topk: usize,

        /// Minimum aligned-landmark count for a candidate
        #[arg(long, default_value = "5")]
        min_support: u32,

        /// Wall-clock budget in milliseconds; past it, best-so-far is returned
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Emit the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List indexed tracks
    Tracks,

    /// Show library statistics
    Stats,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    let params = EngineParams::default();
    let db_path = cli.db_path.unwrap_or_else(tapeid::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let db = match Database::open(&db_path, &params) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to open database: {e}");
            return ExitCode::from(EXIT_DATABASE);
        }
    };

    let code = match cli.command {
        Commands::Ingest {
            paths,
            artist,
            jobs,
        } => run_ingest(&db, &paths, artist, jobs),
        Commands::Recognize {
            file,
            topk,
            min_support,
            timeout_ms,
            json,
        } => run_recognize(&db, &file, topk, min_support, timeout_ms, json),
        Commands::Tracks => run_tracks(&db),
        Commands::Stats => run_stats(&db),
    };

    if let Err(e) = db.close() {
        log::warn!("closing database: {e}");
    }
    ExitCode::from(code)
}

fn run_ingest(db: &Database, paths: &[PathBuf], artist: Option<String>, jobs: usize) -> u8 {
    let files = match collect_pcm_files(paths) {
        Ok(files) => files,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_USAGE;
        }
    };
    if files.is_empty() {
        eprintln!(
            "No PCM files found (expected extensions: {})",
            PCM_EXTENSIONS.join(", ")
        );
        return EXIT_USAGE;
    }

    let sample_rate = db.params().sample_rate;
    let mut ingest_jobs = Vec::with_capacity(files.len());
    for file in &files {
        let source = match RawPcmFile::open(file, sample_rate) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Cannot open {}: {e}", file.display());
                return EXIT_USAGE;
            }
        };
        let title = file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("untitled")
            .to_string();
        ingest_jobs.push(IngestJob {
            meta: NewTrack {
                title,
                artist: artist.clone(),
                source_ref: file.to_string_lossy().to_string(),
            },
            source: Box::new(source),
        });
    }

    let report = ingest::ingest_tracks(db, ingest_jobs, jobs, &CancelToken::new());
    println!(
        "Ingest complete: {} ingested, {} skipped, {} failed",
        report.ingested, report.skipped, report.failed
    );
    if report.failed > 0 {
        EXIT_CORRUPT_INPUT
    } else {
        EXIT_MATCH
    }
}

fn run_recognize(
    db: &Database,
    file: &Path,
    topk: usize,
    min_support: u32,
    timeout_ms: Option<u64>,
    json: bool,
) -> u8 {
    let mut source = match RawPcmFile::open(file, db.params().sample_rate) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Cannot open {}: {e}", file.display());
            return EXIT_USAGE;
        }
    };

    let opts = QueryOptions {
        topk,
        min_support,
        deadline: timeout_ms.map(Duration::from_millis),
    };

    match matcher::recognize(db, &mut source, &opts, &CancelToken::new()) {
        Ok(recognition) => {
            print_recognition(&recognition, json);
            match recognition.status {
                Status::Empty => EXIT_NO_MATCH,
                Status::Ok | Status::Partial => EXIT_MATCH,
            }
        }
        Err(RecognizeError::Extract(e @ ExtractError::CorruptInput { .. })) => {
            eprintln!("Snippet unusable: {e}");
            EXIT_CORRUPT_INPUT
        }
        Err(RecognizeError::Extract(e)) => {
            eprintln!("Extraction failed: {e}");
            EXIT_USAGE
        }
        Err(RecognizeError::Store(e)) => {
            eprintln!("Database error: {e}");
            EXIT_DATABASE
        }
        // No cancellation source in the CLI path
        Err(RecognizeError::Cancelled) => EXIT_NO_MATCH,
    }
}

fn print_recognition(recognition: &Recognition, json: bool) {
    if json {
        match serde_json::to_string_pretty(recognition) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("JSON encoding failed: {e}"),
        }
        return;
    }

    match recognition.status {
        Status::Empty => {
            println!("No match.");
            return;
        }
        Status::Partial => println!("(time budget exceeded — best effort)"),
        Status::Ok => {}
    }

    println!(
        "{:<4} {:<30} {:<20} {:>7} {:>10}",
        "#", "Title", "Artist", "Score", "Offset"
    );
    println!("{}", "-".repeat(75));
    for (rank, m) in recognition.results.iter().enumerate() {
        let title: String = if m.title.len() > 30 {
            format!("{}...", &m.title[..27])
        } else {
            m.title.clone()
        };
        println!(
            "{:<4} {:<30} {:<20} {:>7} {:>9.2}s",
            rank + 1,
            title,
            m.artist.as_deref().unwrap_or("-"),
            m.score,
            m.offset_seconds,
        );
    }
}

fn run_tracks(db: &Database) -> u8 {
    let tracks = match db.tracks() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Query failed: {e}");
            return EXIT_DATABASE;
        }
    };
    if tracks.is_empty() {
        println!("Library is empty.");
        return EXIT_MATCH;
    }

    println!(
        "{:<6} {:<30} {:<20} {:>8} {:<20}",
        "ID", "Title", "Artist", "Frames", "Ingested"
    );
    println!("{}", "-".repeat(88));
    for t in tracks {
        println!(
            "{:<6} {:<30} {:<20} {:>8} {:<20}",
            t.track_id,
            t.title,
            t.artist.as_deref().unwrap_or("-"),
            t.frame_count,
            t.ingested_at,
        );
    }
    EXIT_MATCH
}

fn run_stats(db: &Database) -> u8 {
    match db.stats() {
        Ok(stats) => {
            println!("Library Statistics");
            println!("==================");
            println!("Tracks:           {}", stats.tracks);
            println!("Postings:         {}", stats.postings);
            println!("Distinct hashes:  {}", stats.distinct_hashes);
            println!("Indexed audio:    {:.1} hours", stats.indexed_hours);
            EXIT_MATCH
        }
        Err(e) => {
            eprintln!("Failed to get stats: {e}");
            EXIT_DATABASE
        }
    }
}

/// Expand files and directories into the list of PCM files to ingest.
fn collect_pcm_files(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
        } else if path.is_dir() {
            for entry in walkdir::WalkDir::new(path)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let ext = entry
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("")
                    .to_lowercase();
                if PCM_EXTENSIONS.contains(&ext.as_str()) {
                    files.push(entry.path().to_path_buf());
                }
            }
        } else {
            bail!("No such file or directory: {}", path.display());
        }
    }
    files.sort();
    Ok(files)
}
