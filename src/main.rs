use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use zapline::cli::{Cli, OutputFormat};
use zapline::config::EngineConfig;
use zapline::scenario::Scenario;
use zapline::stats::DurationSummary;
use zapline::{ProgressEvent, RunReport, StimulusAction, ZapEngine};

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(args: &Cli) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if args.no_settle {
        config.settle_delay_ms = 0;
    }
    Ok(config)
}

fn print_progress(event: &ProgressEvent) {
    match event {
        ProgressEvent::RunStarted {
            run_id,
            requested_iterations,
        } => eprintln!("run {run_id}: {requested_iterations} iterations"),
        ProgressEvent::IterationStarted { iteration } => eprintln!("[{iteration}] stimulus"),
        ProgressEvent::ActionCompleted {
            iteration,
            success,
            duration_ms,
        } => eprintln!(
            "[{iteration}] action {} in {duration_ms} ms",
            if *success { "ok" } else { "FAILED" }
        ),
        ProgressEvent::AnalysisCompleted {
            iteration,
            success,
            detection_method,
        } => eprintln!(
            "[{iteration}] analysis {} (method: {})",
            if *success { "ok" } else { "failed" },
            detection_method.label()
        ),
        ProgressEvent::RunFinished {
            overall_success,
            cancelled,
        } => eprintln!("run finished: success={overall_success} cancelled={cancelled}"),
    }
}

fn format_summary(label: &str, summary: Option<DurationSummary>) -> String {
    match summary {
        Some(s) => format!(
            "{label:<18} n={:<4} mean={:>9.1} min={:>9.1} max={:>9.1} median={:>9.1} stddev={:>8.1}",
            s.count, s.mean, s.min, s.max, s.median, s.stddev
        ),
        None => format!("{label:<18} n=0"),
    }
}

fn print_text_report(report: &RunReport) {
    let stats = &report.statistics;
    let rates = report.rates();

    println!("run {} on {} ({})", report.run_id, report.device_id, report.action_id);
    println!("iter  action   motion  transition   method        message");
    println!("----- -------- ------- ------------ ------------- ----------------------------");
    for record in &report.records {
        let (motion, transition, method, message) = match &record.analysis {
            Some(a) => (
                if a.motion_detected() { "yes" } else { "no" },
                if a.transition_detected() { "yes" } else { "no" },
                a.detection_method().label(),
                a.message.clone(),
            ),
            None => (
                "-",
                "-",
                "-",
                record
                    .action_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default(),
            ),
        };
        println!(
            "{:>5} {:<8} {:<7} {:<12} {:<13} {}",
            record.iteration,
            if record.action_success { "ok" } else { "FAILED" },
            motion,
            transition,
            method,
            message
        );
    }
    println!("----- -------- ------- ------------ ------------- ----------------------------");
    println!(
        "successful: {}/{} ({:.1}%)",
        stats.successful_iterations,
        stats.total_iterations,
        rates.success_rate * 100.0
    );
    println!(
        "motion {:.1}%  subtitles {:.1}%  speech {:.1}%  zapping {:.1}%",
        rates.motion_rate * 100.0,
        rates.subtitles_rate * 100.0,
        rates.audio_speech_rate * 100.0,
        rates.zapping_rate * 100.0
    );
    println!("{}", format_summary("action (ms)", stats.action_duration_summary()));
    println!("{}", format_summary("zapping (ms)", stats.zapping_duration_summary()));
    println!("{}", format_summary("gap (ms)", stats.gap_duration_summary()));
    let methods: Vec<String> = stats
        .method_histogram()
        .iter()
        .map(|(method, count)| format!("{}={count}", method.label()))
        .collect();
    println!("methods: {}", methods.join(" "));
    match report.learned_at_iteration {
        Some(iteration) => println!(
            "learned method: {} (iteration {iteration})",
            report.learned_method
        ),
        None => println!("learned method: {}", report.learned_method),
    }
    if report.cancelled {
        println!("run cancelled");
    }
    println!(
        "overall: {}",
        if report.overall_success { "PASS" } else { "FAIL" }
    );
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let config = load_config(&args)?;
    let scenario = Scenario::from_file(&args.scenario)?;
    let action = scenario
        .action
        .clone()
        .unwrap_or_else(StimulusAction::default);

    let (device, detectors, _log) = scenario.build();
    let engine = ZapEngine::new(config, Box::new(device), Box::new(detectors))
        .context("Invalid engine configuration")?;
    let count = engine.config().iterations;

    let report = if args.progress {
        let handle = engine
            .spawn(action, count)
            .context("Failed to start engine thread")?;
        for event in handle.progress().iter() {
            print_progress(&event);
            if matches!(event, ProgressEvent::RunFinished { .. }) {
                break;
            }
        }
        handle.wait()?
    } else {
        engine.run_iterations(&action, count)
    };

    match args.format {
        OutputFormat::Json => println!("{}", report.to_json()?),
        OutputFormat::Text => print_text_report(&report),
    }

    if !report.overall_success {
        std::process::exit(1);
    }
    Ok(())
}
