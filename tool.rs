use clap::Parser as ArgParser;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use thiserror::Error;

use futurepcr::predict::{Policy, Predictor, ReplayState, Settings, SystemEnvironment};
use futurepcr::report::{self, Comparison, Results};
use futurepcr::tpm::SysfsPcrReader;
use futurepcr::{Parser, NUM_PCRS};

#[derive(Debug, Error)]
enum ToolError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Prediction(#[from] futurepcr::Error),
    #[error("YAML Error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Calculate future TPM PCR[4] and PCR[8] after a bootloader or kernel update
#[derive(ArgParser, Debug)]
#[command(name = "tpm-futurepcr", version)]
struct Args {
    /// Limit output to the given PCRs
    #[arg(
        short = 'L',
        long = "pcr-list",
        value_name = "PCRS",
        value_delimiter = ',',
        value_parser = clap::value_parser!(u32).range(0..NUM_PCRS as i64)
    )]
    pcr_list: Option<Vec<u32>>,

    /// Write binary PCR values to this file ("-" for stdout)
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Compare the replayed log against the live TPM instead of predicting
    #[arg(long)]
    compare: bool,

    /// Show the replay entry by entry and keep going past unmapped boot applications
    #[arg(short, long)]
    verbose: bool,

    /// Read the event log from this file instead of the kernel's copy
    #[arg(long, value_name = "PATH")]
    log_path: Option<PathBuf>,

    /// Take this PCR from the live TPM if the log never extended it
    #[arg(
        long,
        value_name = "PCR",
        value_parser = clap::value_parser!(u32).range(0..NUM_PCRS as i64)
    )]
    live_fallback: Option<u32>,

    /// Print the final values as YAML instead of a table
    #[arg(long)]
    yaml: bool,
}

fn init_logging(verbose: bool) {
    if verbose && std::env::var_os("RUST_LOG").is_none() {
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        pretty_env_logger::init();
    }
}

/// Exit status of a finished run. With `--compare` only a disagreeing live
/// TPM fails it, otherwise any error the replay skipped past does.
fn exit_code(comparison: Option<&Comparison>, state: &ReplayState) -> i32 {
    match comparison {
        Some(comparison) if comparison.mismatches() > 0 => 1,
        Some(_) => 0,
        None if state.errors > 0 => 1,
        None => 0,
    }
}

fn main() -> Result<(), ToolError> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut settings = Settings::new();
    if args.verbose {
        settings.set_policy(Policy::BestEffort);
    }
    if let Some(pcrs) = &args.pcr_list {
        settings.set_wanted(pcrs.clone());
    }
    settings.set_live_fallback(args.live_fallback);
    let wanted = settings.wanted_pcrs();

    let predictor = Predictor::new(settings, SystemEnvironment::default());
    let parser = Parser::open(args.log_path.as_deref())?;

    let stdout = io::stdout();
    let mut state = predictor.replay(parser, |entry, decision, state| {
        if args.verbose && predictor.settings().is_wanted(entry.pcr_index) {
            report::write_trace(&mut stdout.lock(), entry, decision, state)?;
        }
        Ok(())
    })?;

    let tpm = SysfsPcrReader::default();
    predictor.apply_live_fallback(&mut state, &tpm)?;

    if args.compare {
        let comparison = report::compare(&state, &wanted, &tpm)?;
        comparison.write(&mut stdout.lock())?;
        let code = exit_code(Some(&comparison), &state);
        if code != 0 {
            process::exit(code);
        }
        return Ok(());
    }

    if args.verbose || args.output.is_none() {
        if args.yaml {
            serde_yaml::to_writer(stdout.lock(), &Results::new(&state, &wanted)?)?;
        } else {
            report::write_final_table(&mut stdout.lock(), &state, &wanted)?;
        }
    }

    let code = exit_code(None, &state);
    if code != 0 {
        eprintln!("fatal errors occured");
        process::exit(code);
    }

    if let Some(output) = &args.output {
        let mut out: Box<dyn Write> = if output.as_os_str() == "-" {
            Box::new(io::stdout())
        } else {
            Box::new(File::create(output)?)
        };
        report::write_predicted(&mut out, &state, &wanted)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futurepcr::report::ComparedPcr;

    fn comparison(real: [u8; 20]) -> Comparison {
        Comparison {
            pcrs: vec![ComparedPcr {
                index: 4,
                real,
                computed: [0x11; 20],
            }],
        }
    }

    #[test]
    fn compare_fails_only_on_mismatch() {
        let mut state = ReplayState::new();
        assert_eq!(exit_code(Some(&comparison([0x11; 20])), &state), 0);
        assert_eq!(exit_code(Some(&comparison([0x22; 20])), &state), 1);

        state.errors = 2;
        assert_eq!(exit_code(Some(&comparison([0x11; 20])), &state), 0);
    }

    #[test]
    fn skipped_errors_fail_prediction() {
        let mut state = ReplayState::new();
        assert_eq!(exit_code(None, &state), 0);
        state.errors = 1;
        assert_eq!(exit_code(None, &state), 1);
    }

    #[test]
    fn pcr_list_arguments() {
        let args = Args::try_parse_from(["tpm-futurepcr", "-L", "4,8", "--compare"]).unwrap();
        assert_eq!(args.pcr_list, Some(vec![4, 8]));
        assert!(args.compare);

        assert!(Args::try_parse_from(["tpm-futurepcr", "-L", "24"]).is_err());
        assert!(Args::try_parse_from(["tpm-futurepcr", "--live-fallback", "30"]).is_err());
    }
}
