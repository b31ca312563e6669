//! txdesk-runner: headless batch ingestion for the transaction desk.
//!
//! Usage:
//!   txdesk-runner --events events.ndjson --db desk.db --workers 4
//!   cat events.ndjson | txdesk-runner --events - --data-dir ./data
//!
//! One inbound event per input line. One JSON response per line on stdout,
//! in input order. The run summary goes to stderr.

use anyhow::{Context, Result};
use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use txdesk_core::{
    config::DeskConfig,
    engine::IngestEngine,
    error::DeskError,
    event::{TransactionEvent, MSG_ALREADY_PROCESSED},
    store::DeskStore,
    types::AlertStatus,
};

#[derive(Default)]
struct RunTally {
    processed: usize,
    replayed: usize,
    failed: usize,
    invalid: usize,
}

enum Outcome {
    Processed,
    Replayed,
    Failed,
    Invalid,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let events = flag(&args, "--events").unwrap_or("-");
    let db = flag(&args, "--db").unwrap_or(":memory:");
    let data_dir = flag(&args, "--data-dir").unwrap_or("./data");
    let mut workers = parse_arg(&args, "--workers", 1usize).max(1);

    let config = match DeskConfig::load(data_dir) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("{e:#}; using compiled-in defaults");
            DeskConfig::default_test()
        }
    };

    if db == ":memory:" && workers > 1 {
        log::warn!("--workers {workers} ignored: an in-memory database is private to one connection");
        workers = 1;
    }

    eprintln!("txdesk-runner");
    eprintln!("  events:    {events}");
    eprintln!("  db:        {db}");
    eprintln!("  data_dir:  {data_dir}");
    eprintln!("  workers:   {workers}");
    eprintln!();

    let store = if db == ":memory:" {
        DeskStore::in_memory()?
    } else {
        DeskStore::open_with_timeout(db, config.busy_timeout)?
    };
    store.migrate()?;
    let engine = IngestEngine::new(store, config);
    log::info!(
        "{} rules loaded; scoring timeout {:?}",
        engine.config().rules.rules.len(),
        engine.config().scoring_timeout
    );

    let lines = read_lines(events)?;
    let results = run_workers(&engine, lines, workers)?;

    let mut tally = RunTally::default();
    let mut stdout = io::stdout().lock();
    for (line, outcome) in results {
        writeln!(stdout, "{line}")?;
        match outcome {
            Outcome::Processed => tally.processed += 1,
            Outcome::Replayed => tally.replayed += 1,
            Outcome::Failed => tally.failed += 1,
            Outcome::Invalid => tally.invalid += 1,
        }
    }
    stdout.flush()?;

    print_summary(&engine, &tally)
}

fn read_lines(source: &str) -> Result<Vec<String>> {
    let reader: Box<dyn BufRead> = if source == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(source).with_context(|| format!("Cannot open {source}"))?;
        Box::new(BufReader::new(file))
    };
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Ingest every line. With one worker the lines run on `engine` itself;
/// otherwise each worker thread owns its own engine and connection.
/// Results come back in input order.
fn run_workers(engine: &IngestEngine, lines: Vec<String>, workers: usize) -> Result<Vec<(String, Outcome)>> {
    if workers == 1 {
        return Ok(lines.iter().map(|line| ingest_line(engine, line)).collect());
    }

    let total = lines.len();
    let (job_tx, job_rx) = mpsc::channel::<(usize, String)>();
    for job in lines.into_iter().enumerate() {
        job_tx.send(job)?;
    }
    drop(job_tx);
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (out_tx, out_rx) = mpsc::channel::<(usize, String, Outcome)>();

    let mut handles = Vec::with_capacity(workers);
    for n in 0..workers {
        let worker = engine.worker()?;
        let job_rx = Arc::clone(&job_rx);
        let out_tx = out_tx.clone();
        let handle = thread::Builder::new()
            .name(format!("txdesk-worker-{n}"))
            .spawn(move || loop {
                let next = match job_rx.lock() {
                    Ok(rx) => rx.recv(),
                    Err(_) => return,
                };
                let Ok((idx, line)) = next else { return };
                let (json, outcome) = ingest_line(&worker, &line);
                if out_tx.send((idx, json, outcome)).is_err() {
                    return;
                }
            })?;
        handles.push(handle);
    }
    drop(out_tx);

    let mut slots: Vec<Option<(String, Outcome)>> = (0..total).map(|_| None).collect();
    for (idx, json, outcome) in out_rx {
        slots[idx] = Some((json, outcome));
    }
    for handle in handles {
        if handle.join().is_err() {
            log::error!("worker thread panicked");
        }
    }
    Ok(slots.into_iter().flatten().collect())
}

fn ingest_line(engine: &IngestEngine, line: &str) -> (String, Outcome) {
    let event: TransactionEvent = match serde_json::from_str(line) {
        Ok(e) => e,
        Err(e) => {
            let body = serde_json::json!({ "error": format!("Malformed event: {e}") });
            return (body.to_string(), Outcome::Invalid);
        }
    };

    match engine.ingest(&event) {
        Ok(resp) => {
            let outcome = if resp.message == MSG_ALREADY_PROCESSED {
                Outcome::Replayed
            } else {
                Outcome::Processed
            };
            let body = serde_json::to_string(&resp)
                .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }).to_string());
            (body, outcome)
        }
        Err(e) => {
            let outcome = match &e {
                DeskError::Validation(_) => Outcome::Invalid,
                _ => Outcome::Failed,
            };
            let body = serde_json::json!({ "event_id": event.event_id, "error": e.to_string() });
            (body.to_string(), outcome)
        }
    }
}

fn print_summary(engine: &IngestEngine, tally: &RunTally) -> Result<()> {
    let open_alerts = engine.list_alerts(Some(AlertStatus::Open), usize::MAX)?.len();

    eprintln!("=== RUN SUMMARY ===");
    eprintln!("  processed:     {}", tally.processed);
    eprintln!("  replayed:      {}", tally.replayed);
    eprintln!("  failed:        {}", tally.failed);
    eprintln!("  invalid:       {}", tally.invalid);
    eprintln!("  open alerts:   {open_alerts}");

    eprintln!();
    eprintln!("=== LATEST METRIC DAY ===");
    match engine.latest_metric()? {
        None => eprintln!("  (No events processed)"),
        Some(m) => {
            eprintln!(
                "  {} | total {} | block {} | challenge {} | allow {}",
                m.metric_date, m.total_events, m.blocked_events, m.challenged_events, m.allowed_events
            );
            eprintln!(
                "  avg amount {:.2} | avg risk score {:.1}",
                m.avg_amount, m.avg_risk_score
            );
        }
    }
    Ok(())
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == name).map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
