use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use iatro_reasoning::{
    Answer, Diagnosis, DiagnosisEngine, DiagnosisSession, EngineConfig, EvidenceIndex,
    KnowledgeBase, Progress, Question, ReasoningTelemetry, Standing, Turn,
};
use iatro_simulationengine::{
    HarnessReport, HarnessSettings, SimulationEngine, SimulationTelemetry,
};
use shared_logging::{EventJournal, LogLevel};
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "iatro", version, about = "Interactive diagnostic reasoning engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs an interactive session on stdin.
    Diagnose(DiagnoseArgs),
    /// Shows the phenotypes a fresh session would ask about first.
    Preview {
        #[arg(long)]
        kb: PathBuf,
        /// Number of recommendations.
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Runs the simulation harness and writes a JSON report.
    Simulate(SimulateArgs),
    /// Prints index diagnostics and the evidence held for every disease.
    Inspect {
        #[arg(long)]
        kb: PathBuf,
    },
}

#[derive(Args, Debug)]
struct DiagnoseArgs {
    #[arg(long)]
    kb: PathBuf,
    /// Engine configuration (TOML).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    top_k: Option<usize>,
    /// JSON-lines session log.
    #[arg(long)]
    log: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[arg(long)]
    kb: PathBuf,
    /// Harness settings (TOML).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Scenarios per disease.
    #[arg(long)]
    scenarios: Option<usize>,
    #[arg(long)]
    max_steps: Option<u32>,
    /// Usable evidence rows a disease needs to be tested.
    #[arg(long)]
    min_evidence: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    /// Comma-separated disease names.
    #[arg(long)]
    only: Option<String>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    log: Option<PathBuf>,
    /// Exports the harness event journal as JSON lines.
    #[arg(long)]
    event_log: Option<PathBuf>,
    /// Logs per-scenario and per-session detail.
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Diagnose(args) => handle_diagnose(args),
        Commands::Preview { kb, count } => handle_preview(&kb, count),
        Commands::Simulate(args) => handle_simulate(args),
        Commands::Inspect { kb } => handle_inspect(&kb),
    }
}

fn load_index(path: &Path) -> Result<Arc<EvidenceIndex>> {
    let kb = KnowledgeBase::load(path)
        .with_context(|| format!("loading knowledge base {}", path.display()))?;
    let index = EvidenceIndex::build(&kb).context("building evidence index")?;
    Ok(Arc::new(index))
}

fn handle_diagnose(args: DiagnoseArgs) -> Result<()> {
    let index = load_index(&args.kb)?;
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading engine config {}", path.display()))?,
        None => EngineConfig::interactive(),
    };
    if let Some(top_k) = args.top_k {
        config.top_k = top_k;
    }
    let mut engine = DiagnosisEngine::new(index, config).context("invalid engine configuration")?;
    if let Some(path) = &args.log {
        let telemetry = ReasoningTelemetry::builder("iatro-cli")
            .log_path(path)
            .min_level(LogLevel::Debug)
            .build()?;
        engine = engine.with_telemetry(telemetry);
    }

    let mut session = engine.start_session();
    println!("session {}", session.id());
    let stdin = io::stdin();
    let stdout = io::stdout();
    let diagnosis = run_dialogue(&mut session, stdin.lock(), &mut stdout.lock())?;
    println!("{}", serde_json::to_string_pretty(&diagnosis)?);
    Ok(())
}

/// Reply typed at the prompt, before it is resolved against the displayed candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Confirm(usize),
    Skip(usize),
    NoneOfThese,
    Quit,
}

fn parse_reply(line: &str) -> Option<Reply> {
    let line = line.trim();
    if line.eq_ignore_ascii_case("q") || line.eq_ignore_ascii_case("quit") {
        return Some(Reply::Quit);
    }
    if let Some(rest) = line.strip_prefix('s').or_else(|| line.strip_prefix('S')) {
        return rest.trim().parse().ok().filter(|n| *n > 0).map(Reply::Skip);
    }
    match line.parse::<usize>().ok()? {
        0 => Some(Reply::NoneOfThese),
        n => Some(Reply::Confirm(n)),
    }
}

fn resolve(reply: Reply, question: &Question) -> Option<Answer> {
    let pick = |n: usize| question.candidates.get(n - 1).map(|c| c.phenotype);
    match reply {
        Reply::Confirm(n) => pick(n).map(Answer::Confirm),
        Reply::Skip(n) => pick(n).map(Answer::Skip),
        Reply::NoneOfThese => Some(Answer::NoneOfThese),
        Reply::Quit => Some(Answer::Quit),
    }
}

/// Drives a session from line-oriented input. End of input quits.
fn run_dialogue<R: BufRead, W: Write>(
    session: &mut DiagnosisSession,
    input: R,
    out: &mut W,
) -> Result<Diagnosis> {
    let mut lines = input.lines();
    loop {
        let question = match session.next_question() {
            Turn::Ask(question) => question,
            Turn::Finished(diagnosis) => return Ok(diagnosis),
        };
        write_question(out, &question)?;
        let answer = match lines.next().transpose()? {
            None => Answer::Quit,
            Some(line) => {
                let answer = parse_reply(&line).and_then(|reply| resolve(reply, &question));
                if let Some(answer) = answer {
                    answer
                } else {
                    writeln!(out, "unrecognised reply `{}`", line.trim())?;
                    continue;
                }
            }
        };
        match session.answer(answer) {
            Ok(Progress::Updated { leaderboard, .. }) => write_leaderboard(out, &leaderboard)?,
            Ok(Progress::Finished(diagnosis)) => return Ok(diagnosis),
            Err(err) => writeln!(out, "rejected: {err}")?,
        }
    }
}

fn write_question<W: Write>(out: &mut W, question: &Question) -> Result<()> {
    writeln!(out, "\nstep {}: which of these is present?", question.step)?;
    if question.fallback {
        writeln!(out, "(no strongly discriminating findings left)")?;
    }
    for (position, candidate) in question.candidates.iter().enumerate() {
        writeln!(
            out,
            "  {:>2}. {} [{} diseases]",
            position + 1,
            candidate.name,
            candidate.coverage
        )?;
        writeln!(out, "      What it means: {}", candidate.description)?;
    }
    writeln!(out, "   0. none of these   s N. skip   q. quit")?;
    write!(out, "> ")?;
    out.flush()?;
    Ok(())
}

fn write_leaderboard<W: Write>(out: &mut W, leaderboard: &[Standing]) -> Result<()> {
    for standing in leaderboard {
        writeln!(
            out,
            "  {:<48} {:>6.1}%  hits {}",
            standing.name,
            standing.posterior * 100.0,
            standing.hits
        )?;
    }
    Ok(())
}

fn handle_preview(kb: &Path, count: usize) -> Result<()> {
    let index = load_index(kb)?;
    let config = EngineConfig {
        top_k: count.max(1),
        ..EngineConfig::interactive()
    };
    let engine = DiagnosisEngine::new(index, config).context("invalid engine configuration")?;
    let mut session = engine.start_session();
    match session.next_question() {
        Turn::Ask(question) => {
            println!("top {} recommended findings:", question.candidates.len());
            for (position, candidate) in question.candidates.iter().enumerate() {
                println!(
                    "  {:>2}. {:<44} score {:>7.4}  coverage {}  cluster {}",
                    position + 1,
                    candidate.name,
                    candidate.score,
                    candidate.coverage,
                    candidate.cluster.as_deref().unwrap_or("-")
                );
                println!("      What it means: {}", candidate.description);
            }
            println!("\nprior leaders:");
            write_leaderboard(&mut io::stdout().lock(), &question.leaderboard)?;
        }
        Turn::Finished(diagnosis) => {
            println!("nothing to ask ({})", diagnosis.reason);
        }
    }
    Ok(())
}

fn handle_simulate(args: SimulateArgs) -> Result<()> {
    let index = load_index(&args.kb)?;
    let mut settings = match &args.config {
        Some(path) => HarnessSettings::load(path)
            .with_context(|| format!("loading harness settings {}", path.display()))?,
        None => HarnessSettings::default(),
    };
    if let Some(scenarios) = args.scenarios {
        settings.generator.scenarios_per_disease = scenarios;
    }
    if let Some(max_steps) = args.max_steps {
        settings.engine.max_steps = max_steps;
    }
    if let Some(min_evidence) = args.min_evidence {
        settings.generator.min_evidence = min_evidence;
    }

    let journal = EventJournal::new(4096);
    let level = if args.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let mut telemetry = SimulationTelemetry::builder("iatro-simulate")
        .min_level(level)
        .journal(journal.clone());
    if let Some(path) = &args.log {
        telemetry = telemetry.log_path(path);
    }
    let mut builder = SimulationEngine::builder(Arc::clone(&index))
        .settings(settings)
        .telemetry(telemetry.build()?);
    if let Some(seed) = args.seed {
        builder = builder.seed(seed);
    }
    if let Some(only) = &args.only {
        builder = builder.only(only.split(',').map(str::trim).filter(|s| !s.is_empty()));
    }
    if args.verbose {
        let mut reasoning = ReasoningTelemetry::builder("iatro-reasoning")
            .min_level(LogLevel::Debug)
            .journal(journal.clone());
        if let Some(path) = &args.log {
            reasoning = reasoning.log_path(path.with_extension("reasoning.jsonl"));
        }
        builder = builder.reasoning_telemetry(reasoning.build()?);
    }
    let engine = builder.build()?;

    let runtime = Runtime::new()?;
    let report = runtime.block_on(engine.run())?;
    print_summary(&report);

    let output = args.output.unwrap_or_else(|| {
        PathBuf::from("reports").join(format!(
            "simulation-{}.json",
            Utc::now().format("%Y%m%d-%H%M%S")
        ))
    });
    report.write_json(&output)?;
    println!("report written to {}", output.display());
    if let Some(path) = &args.event_log {
        let exported = journal.export(path)?;
        println!("{exported} events written to {}", path.display());
    }
    Ok(())
}

fn print_summary(report: &HarnessReport) {
    let summary = &report.summary;
    println!("seed {}", report.seed);
    println!(
        "{} scenarios over {} diseases ({} skipped)",
        summary.total_tests, summary.total_diseases, summary.skipped_diseases
    );
    println!(
        "converged {} ({:.1}%), avg steps {:.2}, avg confidence {:.3}",
        summary.total_converged,
        summary.overall_convergence_rate * 100.0,
        summary.avg_steps,
        summary.avg_confidence
    );
    println!();
    for metrics in &report.disease_metrics {
        println!(
            "  {:<48} {:>5.1}%  steps {:>5.2} [{}..{}]  conf {:.3}",
            metrics.name,
            metrics.convergence_rate * 100.0,
            metrics.avg_steps,
            metrics.min_steps,
            metrics.max_steps,
            metrics.avg_confidence
        );
        for (mode, count) in &metrics.failure_modes {
            println!("      {mode}: {count}");
        }
    }
    for skipped in &report.skipped {
        println!(
            "  skipped {} ({} of {} usable rows)",
            skipped.name, skipped.usable, skipped.required
        );
    }
    if !report.anomalies.is_empty() {
        println!("\n{} anomalies:", report.anomalies.len());
        for anomaly in &report.anomalies {
            let tags: Vec<&str> = anomaly.reasons.iter().map(|r| r.tag()).collect();
            println!("  {} {}: {}", anomaly.label, anomaly.disease, tags.join(", "));
        }
    }
}

fn handle_inspect(kb: &Path) -> Result<()> {
    let index = load_index(kb)?;
    println!("{}", serde_json::to_string_pretty(index.diagnostics())?);
    for disease in index.diseases() {
        println!(
            "\n{} {} (prior {:.3}, severity {})",
            disease.id, disease.name, disease.prior, disease.triage_severity
        );
        let mut rows: Vec<_> = index.evidence_for_disease(disease.id).collect();
        rows.sort_by(|a, b| {
            b.lr_pos
                .unwrap_or(0.0)
                .total_cmp(&a.lr_pos.unwrap_or(0.0))
        });
        for row in rows {
            let name = index
                .phenotype(row.phenotype)
                .map_or("?", |p| p.name.as_str());
            println!(
                "  {:<40} LR+ {:>7}  LR- {:>7}  {}",
                name,
                fmt_lr(row.lr_pos),
                fmt_lr(row.lr_neg),
                index.cluster_of(row.phenotype).unwrap_or("-")
            );
        }
    }
    Ok(())
}

fn fmt_lr(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".into(), |v| format!("{v:.2}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use iatro_reasoning::{SessionStatus, TerminationReason};
    use std::io::Cursor;

    fn engine() -> DiagnosisEngine {
        let kb = KnowledgeBase::default()
            .disease(1, "D1", 0.3)
            .disease(2, "D2", 0.3)
            .disease(3, "D3", 0.3)
            .phenotype(1, "P1", None)
            .phenotype(2, "P2", None)
            .phenotype(3, "P3", None)
            .phenotype(4, "P4", None)
            .phenotype(5, "P5", None)
            .lr(1, 1, 10.0)
            .lr(1, 2, 6.0)
            .lr(1, 3, 3.5)
            .lr(2, 2, 2.0)
            .lr(2, 4, 5.0)
            .lr(3, 3, 2.0)
            .lr(3, 5, 4.0);
        let index = Arc::new(EvidenceIndex::build(&kb).unwrap());
        DiagnosisEngine::new(index, EngineConfig::simulation()).unwrap()
    }

    #[test]
    fn parses_replies() {
        assert_eq!(parse_reply(" 3 "), Some(Reply::Confirm(3)));
        assert_eq!(parse_reply("0"), Some(Reply::NoneOfThese));
        assert_eq!(parse_reply("s 2"), Some(Reply::Skip(2)));
        assert_eq!(parse_reply("S4"), Some(Reply::Skip(4)));
        assert_eq!(parse_reply("Q"), Some(Reply::Quit));
        assert_eq!(parse_reply("s 0"), None);
        assert_eq!(parse_reply("maybe"), None);
    }

    #[test]
    fn dialogue_confirms_until_converged() {
        let engine = engine();
        let mut session = engine.start_session();
        let mut out = Vec::new();
        // P1 ranks first on a fresh session; P2 leads once P1 is asked.
        let diagnosis = run_dialogue(&mut session, Cursor::new("1\n1\n"), &mut out).unwrap();
        assert_eq!(diagnosis.status, SessionStatus::Converged);
        assert_eq!(diagnosis.name.as_deref(), Some("D1"));
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("step 0"));
        assert!(text.contains("What it means: Plain terms: p1."));
    }

    #[test]
    fn end_of_input_quits() {
        let engine = engine();
        let mut session = engine.start_session();
        let mut out = Vec::new();
        let diagnosis =
            run_dialogue(&mut session, Cursor::new("nonsense\n"), &mut out).unwrap();
        assert_eq!(diagnosis.reason, TerminationReason::Quit);
        assert!(String::from_utf8(out).unwrap().contains("unrecognised reply"));
    }
}
