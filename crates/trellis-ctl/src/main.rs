//! trellis-ctl: inspect, decode and generate Trellis row streams.

use anyhow::{Context, Result};

use trellis_core::config::TrellisConfig;

mod cmd;

fn print_usage() {
    println!("Usage: trellis-ctl <command>");
    println!();
    println!("Commands:");
    println!("  rows [FILE|-]                 Print each row of a stream");
    println!("  decode [FILE|-]               Read a whole stream and print the root as JSON");
    println!("  demo [--abort-after-ms <N>]   Render a built-in tree to stdout");
    println!("  help                          Show this message");
    println!();
    println!("FILE defaults to stdin. Set RUST_LOG=debug for chunk lifecycle logs.");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = TrellisConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TrellisConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --abort-after-ms option
    let mut abort_after_ms = None;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--abort-after-ms" {
            i += 1;
            let ms: u64 = args
                .get(i)
                .context("--abort-after-ms requires a value")?
                .parse()
                .context("--abort-after-ms must be a number")?;
            abort_after_ms = Some(ms);
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["rows"] => cmd::rows::cmd_rows(None).await,
        ["rows", path] => cmd::rows::cmd_rows(Some(*path)).await,
        ["decode"] => cmd::decode::cmd_decode(None, &config).await,
        ["decode", path] => cmd::decode::cmd_decode(Some(*path), &config).await,
        ["demo"] => cmd::demo::cmd_demo(abort_after_ms, &config).await,
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
