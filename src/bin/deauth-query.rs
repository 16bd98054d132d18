use anyhow::{bail, Context, Result};
use deauth_collector::persistence::{group_by_attacker, SqliteStore};

struct Args {
    db: String,
    center_us: i64,
    window_us: i64,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut db = "./deployment/events.db".to_string();
    let mut center_us = None;
    let mut window_us = None;

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
        };
        match arg.as_str() {
            "--db" => db = value("--db")?,
            "--center" => {
                let raw = value("--center")?;
                let parsed = raw.parse::<i64>();
                center_us = Some(parsed.with_context(|| format!("invalid --center '{raw}'"))?);
            }
            "--window" => {
                let raw = value("--window")?;
                let parsed = raw.parse::<i64>();
                window_us = Some(parsed.with_context(|| format!("invalid --window '{raw}'"))?);
            }
            "--help" | "-h" => {
                println!(
                    "Usage: deauth-query [--db <path>] --center <timestamp_us> --window <us>\n\
                     Lists stored events within center +/- window, grouped by attacker MAC."
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument '{other}'"),
        }
    }

    let center_us = center_us.context("--center is required")?;
    let window_us = window_us.context("--window is required")?;
    if window_us < 0 {
        bail!("--window must not be negative");
    }
    Ok(Args {
        db,
        center_us,
        window_us,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args = parse_args()?;
    let from = args.center_us.saturating_sub(args.window_us);
    let to = args.center_us.saturating_add(args.window_us);
    println!("Window between {from} and {to}");

    let store = SqliteStore::open(&args.db)?;
    let events = store
        .events_between(from, to)
        .context("query events window")?;

    for (attacker, events) in group_by_attacker(events) {
        println!("\nAttacker MAC: {attacker} ({} events)", events.len());
        for event in events {
            let received = event
                .received_at()
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  ts={}  at={received}  sensor={}  rssi={}",
                event.timestamp_us, event.sensor_mac, event.rssi
            );
        }
    }
    Ok(())
}
