//! Offline event-replay harness.
//!
//! Feeds a timestamped JSONL event stream through a throwaway engine (in-
//! memory store) and prints every emitted command envelope as a JSON line.
//! The engine's timers run on the virtual clock carried by the events, so a
//! recorded trace reproduces watchdog fires and expirations exactly.
//!
//! Line format: `{"at": "<rfc3339>", "event": {"type": "<event>", ...}}`.
//! Blank lines and lines starting with `#` are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::Args;
use serde::Deserialize;

use pausegate_core::{CollectingSink, EngineConfig, EngineEvent, EngineService, Store};

#[derive(Args)]
pub struct ReplayArgs {
    /// JSONL event file
    #[arg(long)]
    pub file: PathBuf,
    /// App ids to monitor during the replay (repeatable)
    #[arg(long = "allow")]
    pub allow: Vec<String>,
    /// Print the final engine snapshot after the stream ends
    #[arg(long)]
    pub state: bool,
}

#[derive(Deserialize)]
struct ReplayLine {
    at: DateTime<Utc>,
    event: EngineEvent,
}

pub fn run(args: ReplayArgs) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::open(&args.file)?;
    let reader = BufReader::new(file);

    let sink = CollectingSink::new();
    let store = Store::open_memory()?;
    let config = EngineConfig::load_or_default();
    let mut started = false;
    let mut service = EngineService::new(config, store, Box::new(sink.clone()), Utc::now());

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let parsed: ReplayLine = serde_json::from_str(trimmed)
            .map_err(|e| format!("line {}: {e}", line_no + 1))?;

        if !started {
            // The first timestamp anchors the engine clock.
            service.restore(parsed.at);
            for app in &args.allow {
                service.allow_app(app);
            }
            started = true;
        }

        // Fire timers that came due before this event, then the event.
        service.advance(parsed.at);
        service.handle_event(parsed.event, parsed.at);
        service.advance(parsed.at);

        for envelope in sink.drain() {
            println!("{}", serde_json::to_string(&envelope)?);
        }
    }

    if args.state {
        println!("{}", serde_json::to_string_pretty(&service.snapshot())?);
    }
    Ok(())
}
