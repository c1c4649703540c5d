#![forbid(unsafe_code)]

use std::io;

use fc_conformance::{HarnessConfig, SuiteOptions, run_packets_grouped};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut packet_filter: Option<String> = None;
    let mut fixture_root: Option<String> = None;
    let mut require_green = false;
    let mut json = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--packet-id" => {
                let value = args
                    .next()
                    .ok_or("--packet-id requires a value (e.g. FC-P-001)")?;
                packet_filter = Some(value);
            }
            "--fixtures" => {
                let value = args.next().ok_or("--fixtures requires a directory")?;
                fixture_root = Some(value);
            }
            "--require-green" => {
                require_green = true;
            }
            "--json" => {
                json = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let mut config = HarnessConfig::default_paths();
    if let Some(root) = fixture_root {
        config.fixture_root = root.into();
    }
    let options = SuiteOptions { packet_filter };

    let reports = run_packets_grouped(&config, &options)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!(
                "packet={} suite={} fixtures={} passed={} failed={} green={}",
                report.packet_id.as_deref().unwrap_or("<all>"),
                report.suite,
                report.fixture_count,
                report.passed,
                report.failed,
                report.is_green()
            );
            for result in report.results.iter().filter(|r| r.mismatch.is_some()) {
                println!(
                    "  FAIL case={} op={} mismatch={}",
                    result.case_id,
                    result.operation.operation_name(),
                    result.mismatch.as_deref().unwrap_or_default()
                );
            }
        }
    }

    if require_green && (reports.is_empty() || !reports.iter().all(|r| r.is_green())) {
        return Err("packet suite is not green".into());
    }
    Ok(())
}

fn print_help() {
    println!(
        "fc-conformance-cli\n\
         Usage:\n\
         \tfc-conformance-cli [--packet-id FC-P-001] [--fixtures DIR] [--json] [--require-green]\n\
         Options:\n\
         \t--packet-id <id>   Run only one packet id\n\
         \t--fixtures <dir>   Fixture root holding packets/ (defaults to the crate's fixtures)\n\
         \t--json             Print the parity reports as JSON\n\
         \t--require-green    Fail with non-zero exit when any packet has failures\n\
         \t-h, --help         Show this help\n\
         Logging follows RUST_LOG (default: warn)."
    );
}
