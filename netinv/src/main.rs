use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use inventory_sqlite::{format_ms, now_ms, Db, EventFilter, EventType, HostFilter, HostSummary, ScanEvent};
use netinv_core::ScanSnapshot;
use reconcile::Reconciler;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;
mod logging;

use config::{Overrides, Settings};

const RECENT_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

#[derive(Debug, Parser)]
#[command(name = "netinv", version, about = "Network inventory: reconciles scanner snapshots into host/port/service state")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./netinv.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Run the HTTP API
    Serve {
        /// Listen address (default 127.0.0.1:8000)
        #[arg(long)]
        listen: Option<String>,
        /// Inventory database file
        #[arg(long, value_name = "PATH")]
        db: Option<PathBuf>,
        /// Base URL of the scanner service
        #[arg(long)]
        scanner_url: Option<String>,
    },
    /// Reconcile one snapshot JSON file into the inventory
    Ingest {
        /// Snapshot file ({"scan_id": ..., "hosts": [...]})
        file: PathBuf,
        #[arg(long, value_name = "PATH")]
        db: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// List the scan event log, newest first
    Events {
        #[arg(long, value_name = "PATH")]
        db: Option<PathBuf>,
        /// Page size (capped at 1000)
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        skip: usize,
        /// host_discovered, port_opened or port_closed; repeatable
        #[arg(long)]
        event_type: Vec<EventType>,
        /// Only events of this snapshot
        #[arg(long)]
        scan_id: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Output file (overwrites)
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        /// Write CSV instead of text/json when --out is provided
        #[arg(long, default_value_t = false, requires = "out")]
        csv: bool,
    },
    /// List known hosts, most recently seen first
    Hosts {
        #[arg(long, value_name = "PATH")]
        db: Option<PathBuf>,
        /// Only hosts seen in their latest snapshot
        #[arg(long, default_value_t = false)]
        active_only: bool,
        /// Page size (capped at 1000)
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Print inventory counts
    Stats {
        #[arg(long, value_name = "PATH")]
        db: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn settings(cli_config: Option<&Path>, overrides: Overrides) -> Result<Settings> {
    let cfg = config::load_config(cli_config)?;
    let s = Settings::resolve(cfg.as_ref(), |k| std::env::var(k).ok(), &overrides)?;
    logging::init_tracing(&s.log_level, &s.log_format)?;
    Ok(s)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg_path = cli.config.as_deref();
    match cli.command {
        Commands::Version => {
            println!("netinv {} (core {})", env!("CARGO_PKG_VERSION"), netinv_core::version());
        }
        Commands::Serve { listen, db, scanner_url } => {
            let s = settings(cfg_path, Overrides { listen, db, scanner_url })?;
            let scanner = scanner_proxy::ScannerClient::new(&s.scanner_url, s.scanner_timeout)?;
            tracing::info!(db = %s.db_path.display(), scanner = %scanner.base_url(), "starting api");
            let state = Arc::new(netinv_api::state::AppState::new(&s.db_path, scanner)?.with_write_wait(s.db_write_wait));
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(netinv_api::start_server(s.listen, state))?;
        }
        Commands::Ingest { file, db, format } => {
            let s = settings(cfg_path, Overrides { db, ..Default::default() })?;
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let snapshot: ScanSnapshot =
                serde_json::from_str(&raw).with_context(|| format!("parsing snapshot {}", file.display()))?;
            let mut db = Db::open_or_create(&s.db_path)?;
            db.set_write_wait(s.db_write_wait);
            let summary = Reconciler::default().ingest(&mut db, &snapshot)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                OutputFormat::Jsonl => println!("{}", serde_json::to_string(&summary)?),
                OutputFormat::Text => println!(
                    "scan {}: {} hosts, {} ports, {} events ({} discovered, {} opened, {} closed, {} services written)",
                    summary.scan_id,
                    summary.hosts_processed,
                    summary.ports_processed,
                    summary.events_created,
                    summary.hosts_discovered,
                    summary.ports_opened,
                    summary.ports_closed,
                    summary.services_written,
                ),
            }
        }
        Commands::Events { db, limit, skip, event_type, scan_id, format, out, csv } => {
            let s = settings(cfg_path, Overrides { db, ..Default::default() })?;
            let scan_id = scan_id
                .map(|v| v.parse::<uuid::Uuid>().with_context(|| format!("invalid scan id '{v}'")))
                .transpose()?;
            let db = Db::open_or_create(&s.db_path)?;
            let events = db.list_events(&EventFilter { skip, limit, event_types: event_type, scan_id, host_id: None })?;
            match out {
                Some(path) if csv => write_events_csv(&path, &events)?,
                Some(path) => {
                    let mut w = BufWriter::new(std::fs::File::create(&path)?);
                    write_events(&mut w, &events, format)?;
                    w.flush()?;
                }
                None => write_events(&mut std::io::stdout().lock(), &events, format)?,
            }
        }
        Commands::Hosts { db, active_only, limit, skip, format } => {
            let s = settings(cfg_path, Overrides { db, ..Default::default() })?;
            let db = Db::open_or_create(&s.db_path)?;
            let hosts = db.list_hosts(&HostFilter { skip, limit, active_only })?;
            write_hosts(&mut std::io::stdout().lock(), &hosts, format)?;
        }
        Commands::Stats { db, format } => {
            let s = settings(cfg_path, Overrides { db, ..Default::default() })?;
            let db = Db::open_or_create(&s.db_path)?;
            let st = db.stats(now_ms() - RECENT_WINDOW_MS)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&st)?),
                OutputFormat::Jsonl => println!("{}", serde_json::to_string(&st)?),
                OutputFormat::Text => {
                    println!("hosts        {} ({} active)", st.total_hosts, st.active_hosts);
                    println!("ports        {} ({} active)", st.total_ports, st.active_ports);
                    println!("events (24h) {}", st.recent_events_count);
                }
            }
        }
    }
    Ok(())
}

fn event_json(e: &ScanEvent) -> serde_json::Value {
    serde_json::json!({
        "event_id": e.event_id,
        "scan_id": e.scan_id,
        "event_type": e.event_type,
        "host_id": e.host_id,
        "port_id": e.port_id,
        "details": e.details,
        "created_at": format_ms(e.created_ms),
    })
}

fn write_events(w: &mut impl Write, events: &[ScanEvent], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let all: Vec<_> = events.iter().map(event_json).collect();
            writeln!(w, "{}", serde_json::to_string_pretty(&all)?)?;
        }
        OutputFormat::Jsonl => {
            for e in events {
                writeln!(w, "{}", serde_json::to_string(&event_json(e))?)?;
            }
        }
        OutputFormat::Text => {
            for e in events {
                writeln!(w, "{}  {:<15}  {}  {}", format_ms(e.created_ms), e.event_type, e.scan_id, e.details)?;
            }
        }
    }
    Ok(())
}

fn write_hosts(w: &mut impl Write, hosts: &[HostSummary], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => writeln!(w, "{}", serde_json::to_string_pretty(hosts)?)?,
        OutputFormat::Jsonl => {
            for h in hosts {
                writeln!(w, "{}", serde_json::to_string(h)?)?;
            }
        }
        OutputFormat::Text => {
            for h in hosts {
                writeln!(
                    w,
                    "{:<39}  {:<8}  {:>3} ports  {}  {}",
                    h.host.address,
                    if h.host.active { "active" } else { "inactive" },
                    h.port_count,
                    format_ms(h.host.last_seen_ms),
                    h.host.hostname.as_deref().unwrap_or("-"),
                )?;
            }
        }
    }
    Ok(())
}

fn write_events_csv(path: &Path, events: &[ScanEvent]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(std::fs::File::create(path)?);
    wtr.write_record(["event_id", "scan_id", "event_type", "host_id", "port_id", "details", "created_at"])?;
    for e in events {
        wtr.write_record([
            e.event_id.to_string(),
            e.scan_id.clone(),
            e.event_type.to_string(),
            e.host_id.map(|v| v.to_string()).unwrap_or_default(),
            e.port_id.map(|v| v.to_string()).unwrap_or_default(),
            e.details.to_string(),
            format_ms(e.created_ms),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_event_filters() {
        let cli = Cli::parse_from(["netinv", "events", "--event-type", "port_closed", "--event-type", "port_opened", "--limit", "5"]);
        match cli.command {
            Commands::Events { event_type, limit, .. } => {
                assert_eq!(event_type, vec![EventType::PortClosed, EventType::PortOpened]);
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["netinv", "events", "--event-type", "port_changed"]).is_err());
        assert!(Cli::try_parse_from(["netinv", "events", "--csv"]).is_err());
    }

    #[test]
    fn csv_export_has_one_row_per_event() {
        let mut db = Db::open_in_memory().unwrap();
        let snap: ScanSnapshot = serde_json::from_value(serde_json::json!({
            "scan_id": "6f1c1f0e-8d6a-4b8e-9d53-3a4f6f1f2b10",
            "hosts": [{"ip_address": "10.1.1.1", "ports": [{"port_number": 22}]}]
        }))
        .unwrap();
        Reconciler::default().ingest_at(&mut db, &snap, 1_000).unwrap();
        let events = db.list_events(&EventFilter::default()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.csv");
        write_events_csv(&path, &events).unwrap();
        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| &r[2] == "host_discovered"));
        assert_eq!(&rows[0][6], "1970-01-01T00:00:01Z");
    }

    #[test]
    fn hosts_listing_shows_active_port_counts() {
        let mut db = Db::open_in_memory().unwrap();
        let snap: ScanSnapshot = serde_json::from_value(serde_json::json!({
            "scan_id": "6f1c1f0e-8d6a-4b8e-9d53-3a4f6f1f2b12",
            "hosts": [
                {"ip_address": "10.1.1.3", "hostname": "printer", "ports": [{"port_number": 631}]},
                {"ip_address": "10.1.1.4", "ports": []}
            ]
        }))
        .unwrap();
        Reconciler::default().ingest_at(&mut db, &snap, 1_000).unwrap();
        let hosts = db.list_hosts(&HostFilter::default()).unwrap();

        let mut buf = Vec::new();
        write_hosts(&mut buf, &hosts, OutputFormat::Text).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let printer = text.lines().find(|l| l.starts_with("10.1.1.3")).unwrap();
        assert!(printer.contains("  1 ports") && printer.ends_with("printer"), "{printer}");

        let mut buf = Vec::new();
        write_hosts(&mut buf, &hosts, OutputFormat::Jsonl).unwrap();
        let rows: Vec<serde_json::Value> =
            String::from_utf8(buf).unwrap().lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r["active"] == true));

        let cli = Cli::parse_from(["netinv", "hosts", "--active-only", "--limit", "10"]);
        assert!(matches!(cli.command, Commands::Hosts { active_only: true, limit: 10, .. }));
    }

    #[test]
    fn jsonl_has_one_line_per_event() {
        let mut db = Db::open_in_memory().unwrap();
        let snap: ScanSnapshot = serde_json::from_value(serde_json::json!({
            "scan_id": "6f1c1f0e-8d6a-4b8e-9d53-3a4f6f1f2b11",
            "hosts": [{"ip_address": "10.1.1.2", "ports": [{"port_number": 80}, {"port_number": 443}]}]
        }))
        .unwrap();
        Reconciler::default().ingest_at(&mut db, &snap, 1_000).unwrap();
        let events = db.list_events(&EventFilter::default()).unwrap();
        let mut buf = Vec::new();
        write_events(&mut buf, &events, OutputFormat::Jsonl).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 3);
        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["scan_id"], "6f1c1f0e-8d6a-4b8e-9d53-3a4f6f1f2b11");
        }
    }
}
