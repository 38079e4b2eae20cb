#![forbid(unsafe_code)]

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use miette::{Diagnostic, IntoDiagnostic};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::VerifierConfig;

const VERIFIED_MARKER: &str = "Verification result: TRUE";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error, Diagnostic)]
#[error("verifier error: {message}")]
#[diagnostic(code(shadowdp::verifier))]
pub struct VerifierError {
    pub message: String,
    #[help]
    pub help: Option<String>,
}

/// A checker installation plus the solver configurations to race.
#[derive(Clone, Debug)]
pub struct Checker {
    pub root: PathBuf,
    pub extra_args: Vec<String>,
    pub timeout: Duration,
    pub solvers: Vec<String>,
}

impl Checker {
    pub fn from_config(config: &VerifierConfig) -> Self {
        Self {
            root: config.path.clone(),
            extra_args: config.args.split_whitespace().map(str::to_string).collect(),
            timeout: Duration::from_secs(config.timeout_secs),
            solvers: config.configs.clone(),
        }
    }

    pub fn script(&self) -> PathBuf {
        self.root.join("scripts").join("cpa.sh")
    }

    /// Fails early when the installation or a solver name is unusable.
    pub fn validate(&self) -> Result<(), VerifierError> {
        if !self.script().is_file() {
            return Err(VerifierError {
                message: format!("{} does not exist", self.script().display()),
                help: Some("point `--checker` or `verifier.path` at a CPAchecker root directory".to_string()),
            });
        }
        for solver in &self.solvers {
            if solver_args(solver, Path::new(""), Path::new("")).is_none() {
                return Err(VerifierError {
                    message: format!("unknown solver configuration `{solver}`"),
                    help: Some("known configurations: MathSat, Z3, SMTInterpol".to_string()),
                });
            }
        }
        Ok(())
    }
}

/// Arguments for one solver configuration, or `None` for an unknown name.
pub fn solver_args(solver: &str, file: &Path, output: &Path) -> Option<Vec<String>> {
    let file = file.to_string_lossy().to_string();
    let output = format!("output.path={}", output.to_string_lossy());
    let rational = |backend: &str| {
        vec![
            "-predicateAnalysis".to_string(),
            file.clone(),
            "-preprocess".to_string(),
            "-setprop".to_string(),
            "cpa.predicate.encodeFloatAs=RATIONAL".to_string(),
            "-setprop".to_string(),
            "cpa.predicate.encodeBitvectorAs=INTEGER".to_string(),
            "-setprop".to_string(),
            "solver.nonLinearArithmetic=USE".to_string(),
            "-setprop".to_string(),
            output.clone(),
            "-setprop".to_string(),
            format!("solver.solver={backend}"),
        ]
    };
    match solver {
        "MathSat" => Some(rational("MATHSAT5")),
        "Z3" => Some(rational("Z3")),
        "SMTInterpol" => Some(vec![
            "-predicateAnalysis-linear".to_string(),
            file.clone(),
            "-preprocess".to_string(),
            "-setprop".to_string(),
            "solver.solver=smtinterpol".to_string(),
            "-setprop".to_string(),
            output.clone(),
        ]),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolverRun {
    pub solver: String,
    pub verified: bool,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Debug)]
pub enum Verdict {
    Verified {
        solver: String,
        output_dir: PathBuf,
        total_time: Option<String>,
    },
    Unverified {
        runs: Vec<SolverRun>,
    },
}

pub fn output_dir(file: &Path, solver: &str) -> PathBuf {
    let stem = file.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    PathBuf::from(format!("output-{stem}-{solver}"))
}

/// Race every solver configuration on `file`. The first run that reports
/// success wins and the rest are killed.
pub fn check(checker: &Checker, file: &Path) -> miette::Result<Verdict> {
    info!(file = %file.display(), solvers = ?checker.solvers, "checking");
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    let mut planned = Vec::with_capacity(checker.solvers.len());
    for solver in &checker.solvers {
        let Some(mut args) = solver_args(solver, file, &output_dir(file, solver)) else {
            return Err(VerifierError {
                message: format!("unknown solver configuration `{solver}`"),
                help: None,
            }
            .into());
        };
        args.extend(checker.extra_args.iter().cloned());
        planned.push((solver.clone(), args));
    }

    let mut workers = Vec::with_capacity(planned.len());
    for (solver, args) in planned {
        let mut cmd = Command::new(checker.script());
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                wind_down(&stop, workers, checker, file, None);
                return Err(e).into_diagnostic();
            }
        };
        debug!(solver = %solver, pid = child.id(), "solver started");

        let stop = stop.clone();
        let tx = tx.clone();
        let timeout = checker.timeout;
        workers.push(thread::spawn(move || {
            let run = supervise(solver, child, timeout, &stop);
            let _ = tx.send(run);
        }));
    }
    drop(tx);

    let mut runs = Vec::new();
    let mut winner = None;
    for run in rx.iter() {
        if run.verified {
            info!(file = %file.display(), solver = %run.solver, "verified");
            stop.store(true, Ordering::SeqCst);
            winner = Some(run.solver.clone());
            break;
        }
        debug!(solver = %run.solver, timed_out = run.timed_out, "solver failed");
        runs.push(run);
    }
    wind_down(&stop, workers, checker, file, winner.as_deref());

    match winner {
        Some(solver) => {
            let dir = output_dir(file, &solver);
            let total_time = fs::read_to_string(dir.join("Statistics.txt"))
                .ok()
                .and_then(|stats| total_time(&stats));
            if let Some(t) = &total_time {
                info!("verification finished in {t}");
            }
            info!("checker reports can be found at {}", dir.display());
            Ok(Verdict::Verified {
                solver,
                output_dir: dir,
                total_time,
            })
        }
        None => {
            warn!(file = %file.display(), "no solver could verify the program");
            for run in &runs {
                warn!(
                    solver = %run.solver,
                    timed_out = run.timed_out,
                    stdout = %run.stdout.trim_end(),
                    stderr = %run.stderr.trim_end(),
                    "solver output"
                );
            }
            Ok(Verdict::Unverified { runs })
        }
    }
}

/// Stop every solver run, wait until each one has exited, then remove the
/// output directories of all solvers except `winner`.
fn wind_down(
    stop: &AtomicBool,
    workers: Vec<thread::JoinHandle<()>>,
    checker: &Checker,
    file: &Path,
    winner: Option<&str>,
) {
    stop.store(true, Ordering::SeqCst);
    for w in workers {
        let _ = w.join();
    }
    for solver in &checker.solvers {
        if winner != Some(solver.as_str()) {
            let _ = fs::remove_dir_all(output_dir(file, solver));
        }
    }
}

fn supervise(solver: String, mut child: std::process::Child, timeout: Duration, stop: &AtomicBool) -> SolverRun {
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if stop.load(Ordering::SeqCst) => {
                let _ = child.kill();
                let _ = child.wait();
                break;
            }
            Ok(None) if Instant::now() >= deadline => {
                timed_out = true;
                let _ = child.kill();
                let _ = child.wait();
                break;
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(_) => break,
        }
    }

    let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
    let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
    SolverRun {
        verified: !timed_out && stdout.contains(VERIFIED_MARKER),
        solver,
        timed_out,
        stdout,
        stderr,
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// The `Total time for CPAchecker` entry of a statistics file.
pub fn total_time(stats: &str) -> Option<String> {
    let line = stats.lines().find(|l| l.contains("Total time for CPAchecker"))?;
    line.split_whitespace()
        .rev()
        .find(|tok| tok.ends_with('s') && tok[..tok.len() - 1].parse::<f64>().is_ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solver_arguments_follow_the_configuration() {
        let file = Path::new("noisymax_t.c");
        let out = output_dir(file, "Z3");
        assert_eq!(out, PathBuf::from("output-noisymax_t-Z3"));

        let z3 = solver_args("Z3", file, &out).unwrap();
        assert_eq!(z3[0], "-predicateAnalysis");
        assert_eq!(z3[1], "noisymax_t.c");
        assert!(z3.contains(&"solver.solver=Z3".to_string()));
        assert!(z3.contains(&"output.path=output-noisymax_t-Z3".to_string()));

        let linear = solver_args("SMTInterpol", file, &out).unwrap();
        assert_eq!(linear[0], "-predicateAnalysis-linear");
        assert!(!linear.iter().any(|a| a.contains("encodeFloatAs")));

        assert!(solver_args("Yices", file, &out).is_none());
    }

    #[test]
    fn statistics_time_is_extracted() {
        let stats = "CPAchecker general statistics\n\
                     Total time for CPAchecker:     3.217s (Max: 3.217s)\n";
        assert_eq!(total_time(stats), Some("3.217s".to_string()));
        assert_eq!(total_time("nothing here"), None);
    }

    #[test]
    fn missing_installation_is_reported() {
        let checker = Checker::from_config(&VerifierConfig {
            path: PathBuf::from("/nonexistent/cpachecker"),
            ..VerifierConfig::default()
        });
        let err = checker.validate().unwrap_err();
        assert!(err.message.contains("cpa.sh"), "{}", err.message);
    }

    #[test]
    fn winding_down_waits_for_runs_before_removing_their_output() {
        let file = Path::new("wind_down_t.c");
        let checker = Checker {
            root: PathBuf::from("."),
            extra_args: Vec::new(),
            timeout: Duration::from_secs(1),
            solvers: vec!["MathSat".to_string(), "Z3".to_string()],
        };
        let stop = Arc::new(AtomicBool::new(false));
        let workers = checker
            .solvers
            .iter()
            .map(|solver| {
                let (stop, dir) = (stop.clone(), output_dir(file, solver));
                thread::spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                    // A killed checker may still have written part of its output.
                    thread::sleep(Duration::from_millis(50));
                    fs::create_dir_all(&dir).unwrap();
                })
            })
            .collect();

        wind_down(&stop, workers, &checker, file, None);
        for solver in &checker.solvers {
            assert!(!output_dir(file, solver).exists(), "{solver}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn first_successful_solver_wins_and_slow_ones_time_out() {
        use std::os::unix::fs::PermissionsExt;

        let root = std::env::temp_dir().join(format!("shadowdp-fake-checker-{}", std::process::id()));
        let scripts = root.join("scripts");
        fs::create_dir_all(&scripts).unwrap();
        let script = scripts.join("cpa.sh");
        fs::write(
            &script,
            "#!/bin/sh\ncase \"$*\" in\n  *solver.solver=Z3*) echo 'Verification result: TRUE.' ;;\n  *) exec sleep 5 ;;\nesac\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let file = root.join("prog_t.c");
        let mut checker = Checker {
            root: root.clone(),
            extra_args: Vec::new(),
            timeout: Duration::from_secs(10),
            solvers: vec!["MathSat".to_string(), "Z3".to_string()],
        };
        checker.validate().unwrap();

        let started = Instant::now();
        let verdict = check(&checker, &file).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        match verdict {
            Verdict::Verified { solver, .. } => assert_eq!(solver, "Z3"),
            other => panic!("expected a verified verdict, got {other:?}"),
        }

        checker.solvers = vec!["MathSat".to_string()];
        checker.timeout = Duration::from_millis(300);
        match check(&checker, &file).unwrap() {
            Verdict::Unverified { runs } => {
                assert_eq!(runs.len(), 1);
                assert!(runs[0].timed_out);
            }
            other => panic!("expected an unverified verdict, got {other:?}"),
        }

        let _ = fs::remove_dir_all(&root);
    }
}
