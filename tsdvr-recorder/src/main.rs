//! tsdvr: records a single-service MPEG-TS stream into I-frame-aligned
//! segment files with regenerated PAT/PMT and a seek index.
//!
//! The channel layout is learned from the PAT/PMT at the head of the
//! input stream; the stream is then pushed through the recording
//! pipeline exactly as a live device callback would.

use std::path::PathBuf;

use clap::Parser;
use log::info;
use tokio::io::AsyncReadExt;

use tsdvr_core::psi::parser::PatPmtParser;
use tsdvr_core::ts::{self, TS_SIZE};

mod error;
mod index;
mod logging;
mod recorder;
mod ring;
mod segment;

use recorder::{NaluFillPolicy, Recorder, RecorderConfig};

/// How much input to search for PAT/PMT before giving up.
const SNIFF_LIMIT: usize = 4 * 1024 * 1024;

/// tsdvr - segmented MPEG-TS recorder
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TS input to record; '-' reads from stdin
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Directory the recording is written into
    #[arg(short, long)]
    output: PathBuf,

    /// Maximum segment file size in MB
    #[arg(long, default_value = "2000")]
    max_segment_mb: u64,

    /// Drop AVC filler NAL units while recording
    #[arg(long)]
    dump_nalu_fill: bool,

    /// Frames between two I-frames above which field-pair cadence is
    /// assumed
    #[arg(long, default_value = "50")]
    field_pair_threshold: usize,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Directory where log files are stored (console only if unset)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    recording: RecordingSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct RecordingSection {
    max_segment_mb: Option<u64>,
    dump_nalu_fill: Option<bool>,
    min_free_disk_mb: Option<u64>,
    field_pair_threshold: Option<usize>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
}

fn load_config(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > defaults.
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("tsdvr.toml");
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => load_config(path).map_err(|e| {
            eprintln!("failed to load config file {}: {}", path.display(), e);
            e
        })?,
        None => ConfigFile::default(),
    };

    // Command line takes precedence over the config file.
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_deref().map(PathBuf::from));
    let retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };
    logging::init(log_dir.as_deref(), retention_days, args.verbose)?;

    let max_segment_mb = if args.max_segment_mb != 2000 {
        args.max_segment_mb
    } else {
        file_config.recording.max_segment_mb.unwrap_or(2000)
    };
    let dump_nalu_fill =
        args.dump_nalu_fill || file_config.recording.dump_nalu_fill.unwrap_or(false);
    let field_pair_threshold = if args.field_pair_threshold != 50 {
        args.field_pair_threshold
    } else {
        file_config.recording.field_pair_threshold.unwrap_or(50)
    };

    let mut input: Box<dyn tokio::io::AsyncRead + Unpin> = if args.input == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(tokio::fs::File::open(&args.input).await?)
    };

    // Learn the channel layout from the stream's own tables.
    let mut parser = PatPmtParser::new();
    let mut head: Vec<u8> = Vec::new();
    let mut parsed = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    let channel = loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            return Err("end of input before PAT/PMT were seen".into());
        }
        head.extend_from_slice(&buf[..n]);
        while parsed + TS_SIZE <= head.len() {
            if head[parsed] != ts::SYNC_BYTE {
                parsed += 1;
                continue;
            }
            let packet = &head[parsed..parsed + TS_SIZE];
            let pid = ts::pid(packet);
            if pid == ts::PID_PAT {
                parser.parse_pat(packet);
            } else if Some(pid) == parser.pmt_pid() {
                parser.parse_pmt(packet);
            }
            parsed += TS_SIZE;
        }
        if parser.versions().is_some() {
            break parser.channel().clone();
        }
        if head.len() > SNIFF_LIMIT {
            return Err("no PAT/PMT found at the head of the input".into());
        }
    };
    info!(
        "recording service: video PID {} (type 0x{:02X}), {} audio, {} Dolby, {} subtitle track(s)",
        channel.vpid,
        channel.vtype,
        channel.audio.len(),
        channel.dolby.len(),
        channel.subtitle.len()
    );

    let config = RecorderConfig {
        max_segment_size: max_segment_mb * 1024 * 1024,
        nalu_fill: if dump_nalu_fill {
            NaluFillPolicy::Dump
        } else {
            NaluFillPolicy::Keep
        },
        min_free_disk_mb: file_config.recording.min_free_disk_mb.unwrap_or(512),
        field_pair_threshold,
    };
    let mut recorder = Recorder::start(&args.output, &channel, config)?;

    // Replay the sniffed head, then stream the rest.
    recorder.receive(&head);
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        recorder.receive(&buf[..n]);
    }

    // Give the worker a moment to drain what is already buffered.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while recorder.pending() > 0 && std::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    recorder.stop().await;
    info!("recording finished");
    Ok(())
}
