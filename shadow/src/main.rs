#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, NamedSource};
use rayon::prelude::*;
use shadow_core::{FunctionReport, Ratio, TransformOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod report;
mod verifier;

use config::Config;
use report::{FileReport, TransformReport};
use verifier::{Checker, Verdict};

#[derive(Parser, Debug)]
#[command(
    name = "shadowdp",
    version,
    about = "Instrument annotated differential privacy algorithms for verification"
)]
struct Cli {
    /// Configuration file. Defaults to `shadowdp.toml` in the current directory when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Instrument annotated functions and write `<stem>_t.c` files
    Transform {
        #[command(flatten)]
        transform: TransformArgs,
    },

    /// Run the verifier on already-instrumented files
    Check {
        /// Instrumented C files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        checker: CheckerArgs,
    },

    /// Instrument, then run the verifier on the output
    Verify {
        #[command(flatten)]
        transform: TransformArgs,

        #[command(flatten)]
        checker: CheckerArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct TransformArgs {
    /// Annotated C files
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Output file (single input only)
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Check for `GOAL * epsilon` privacy instead of `epsilon`
    #[arg(short, long)]
    goal: Option<String>,

    /// Use a concrete epsilon to keep the obligations linear
    #[arg(short, long)]
    epsilon: Option<String>,

    /// Write a machine-readable transformation report (JSON)
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct CheckerArgs {
    /// Checker root directory. Overrides `verifier.path`.
    #[arg(short, long)]
    checker: Option<PathBuf>,

    /// Extra arguments for every checker run. Overrides `verifier.args`.
    #[arg(short = 'a', long = "arguments", allow_hyphen_values = true)]
    arguments: Option<String>,
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;
    init_logging(&config, cli.log_json);

    match cli.cmd {
        Cmd::Transform { transform } => {
            transform_files(&transform, &config)?;
            Ok(())
        }
        Cmd::Check { files, checker } => check_files(&files, &checker, &config),
        Cmd::Verify { transform, checker } => {
            let outputs = transform_files(&transform, &config)?;
            check_files(&outputs, &checker, &config)
        }
    }
}

fn init_logging(config: &Config, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn parse_positive(flag: &str, text: Option<&str>) -> miette::Result<Option<Ratio>> {
    let Some(text) = text else {
        return Ok(None);
    };
    match Ratio::parse(text) {
        Some(r) if !r.is_zero() && !r.is_negative() => Ok(Some(r)),
        _ => Err(miette::miette!("{flag} expects a positive number, got `{text}`")),
    }
}

fn transform_options(args: &TransformArgs, config: &Config) -> miette::Result<TransformOptions> {
    Ok(TransformOptions {
        primitives: (&config.primitives).into(),
        element_bound: config.policy.element_bound(),
        goal: parse_positive("--goal", args.goal.as_deref())?,
        epsilon: parse_positive("--epsilon", args.epsilon.as_deref())?,
    })
}

/// Instrument every input in parallel. Returns the written files; fails
/// when any input fails, after reporting all of them.
fn transform_files(args: &TransformArgs, config: &Config) -> miette::Result<Vec<PathBuf>> {
    if args.out.is_some() && args.files.len() > 1 {
        return Err(miette::miette!("--out can only be used with a single input file"));
    }
    let options = transform_options(args, config)?;

    let results: Vec<(PathBuf, miette::Result<(PathBuf, Vec<FunctionReport>)>)> = args
        .files
        .par_iter()
        .map(|path| (path.clone(), transform_file(path, args.out.as_deref(), &options)))
        .collect();

    let mut outputs = Vec::new();
    let mut files = Vec::new();
    let mut failed = 0usize;
    for (input, result) in results {
        match result {
            Ok((output, functions)) => {
                files.push(FileReport {
                    input: display_path(&input),
                    ok: true,
                    output: Some(display_path(&output)),
                    error: None,
                    functions,
                });
                outputs.push(output);
            }
            Err(err) => {
                failed += 1;
                files.push(FileReport {
                    input: display_path(&input),
                    ok: false,
                    output: None,
                    error: Some(err.to_string()),
                    functions: Vec::new(),
                });
                eprintln!("{err:?}");
            }
        }
    }

    if let Some(path) = &args.report {
        report::write_report(path, &TransformReport::new(files))?;
        info!(report = %path.display(), "report written");
    }

    if failed > 0 {
        return Err(miette::miette!("{failed} of {} file(s) failed to transform", args.files.len()));
    }
    Ok(outputs)
}

fn transform_file(
    path: &Path,
    out: Option<&Path>,
    options: &TransformOptions,
) -> miette::Result<(PathBuf, Vec<FunctionReport>)> {
    let start = Instant::now();
    info!(file = %path.display(), "parsing");
    let src = fs::read_to_string(path)
        .into_diagnostic()
        .map_err(|e| e.wrap_err(format!("failed to read {}", path.display())))?;
    let source = NamedSource::new(display_path(path), src.clone());

    let program = shadow_parse::parse_program(&src).map_err(|e| miette::Report::new(e).with_source_code(source.clone()))?;
    let (program, functions) = shadow_core::transform_program(&program, options)
        .map_err(|e| miette::Report::new(e).with_source_code(source.clone()))?;
    if functions.is_empty() {
        warn!(file = %path.display(), "no annotated function found");
    }
    let unit = shadow_backend_c::emit_translation_unit(&program)
        .map_err(|e| miette::Report::new(e).with_source_code(source.clone()))?;

    let output = out.map(Path::to_path_buf).unwrap_or_else(|| default_output(path));
    fs::write(&output, unit).into_diagnostic()?;
    info!(
        file = %path.display(),
        output = %output.display(),
        functions = functions.len(),
        "transformation finished in {:.3} seconds",
        start.elapsed().as_secs_f64()
    );
    Ok((output, functions))
}

fn check_files(files: &[PathBuf], args: &CheckerArgs, config: &Config) -> miette::Result<()> {
    let mut verifier = config.verifier.clone();
    if let Some(path) = &args.checker {
        verifier.path = path.clone();
    }
    if let Some(extra) = &args.arguments {
        verifier.args = extra.clone();
    }
    let checker = Checker::from_config(&verifier);
    checker.validate()?;

    let verdicts: Vec<(PathBuf, miette::Result<Verdict>)> = files
        .par_iter()
        .map(|file| (file.clone(), verifier::check(&checker, file)))
        .collect();

    let mut unverified = 0usize;
    for (file, verdict) in verdicts {
        match verdict {
            Ok(Verdict::Verified {
                solver,
                output_dir,
                total_time,
            }) => {
                let time = total_time.map(|t| format!(" in {t}")).unwrap_or_default();
                println!(
                    "{}: verified with {solver}{time}, reports in {}",
                    display_path(&file),
                    output_dir.display()
                );
            }
            Ok(Verdict::Unverified { .. }) => {
                unverified += 1;
                println!("{}: not verified", display_path(&file));
            }
            Err(err) => {
                unverified += 1;
                eprintln!("{err:?}");
            }
        }
    }
    if unverified > 0 {
        return Err(miette::miette!("{unverified} of {} file(s) could not be verified", files.len()));
    }
    Ok(())
}

/// `dir/name.c` becomes `dir/name_t.c`.
fn default_output(input: &Path) -> PathBuf {
    let stem = input.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    input.with_file_name(format!("{stem}_t.c"))
}

fn display_path(p: &Path) -> String {
    p.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_lands_next_to_the_input() {
        assert_eq!(default_output(Path::new("algs/noisymax.c")), PathBuf::from("algs/noisymax_t.c"));
        assert_eq!(default_output(Path::new("smartsum.c")), PathBuf::from("smartsum_t.c"));
    }

    #[test]
    fn goal_and_epsilon_must_be_positive() {
        assert_eq!(parse_positive("--goal", Some("2")).unwrap(), Some(Ratio::integer(2)));
        assert_eq!(parse_positive("--epsilon", Some("0.5")).unwrap(), Some(Ratio::new(1, 2).unwrap()));
        assert_eq!(parse_positive("--goal", None).unwrap(), None);
        assert!(parse_positive("--goal", Some("0")).is_err());
        assert!(parse_positive("--goal", Some("two")).is_err());
    }

    #[test]
    fn cli_accepts_hyphenated_checker_arguments() {
        let cli = Cli::try_parse_from([
            "shadowdp",
            "verify",
            "noisymax.c",
            "-g",
            "2",
            "-a",
            "-setprop cpa.predicate.memoryAllocationsAlwaysSucceed=true",
        ])
        .unwrap();
        let Cmd::Verify { transform, checker } = cli.cmd else {
            panic!("expected verify");
        };
        assert_eq!(transform.files, [PathBuf::from("noisymax.c")]);
        assert_eq!(transform.goal.as_deref(), Some("2"));
        assert_eq!(
            checker.arguments.as_deref(),
            Some("-setprop cpa.predicate.memoryAllocationsAlwaysSucceed=true")
        );
    }

    #[test]
    fn transform_writes_instrumented_unit_and_report() {
        let dir = std::env::temp_dir().join(format!("shadowdp-cli-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let input = dir.join("noisymax.c");
        fs::write(&input, include_str!("../../shadow-core/tests/fixtures/noisymax.c")).unwrap();
        let report_path = dir.join("report.json");

        let args = TransformArgs {
            files: vec![input.clone()],
            out: None,
            goal: None,
            epsilon: None,
            report: Some(report_path.clone()),
        };
        let outputs = transform_files(&args, &Config::default()).unwrap();
        assert_eq!(outputs, [dir.join("noisymax_t.c")]);

        let unit = fs::read_to_string(&outputs[0]).unwrap();
        assert!(unit.starts_with("extern void __VERIFIER_error()"));
        assert!(unit.contains("__VERIFIER_nondet_float()"));

        let report: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(report["files"][0]["ok"], true);
        assert_eq!(report["files"][0]["functions"][0]["name"], "noisymax");

        let _ = fs::remove_dir_all(&dir);
    }
}
