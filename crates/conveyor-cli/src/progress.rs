//! Renders lifecycle events as terminal progress.

use conveyor_core::events::{Event, OutputStream};
use conveyor_core::run::{JobStatus, StepStatus, WorkflowRun};
use console::style;
use tokio::sync::mpsc;

/// Format one event as a line of output, or `None` for events that are not
/// shown.
pub fn render(event: &Event) -> Option<String> {
    match event {
        Event::WorkflowStarted(p) => Some(format!(
            "{} Running workflow {} for {} ({})",
            style("▶").cyan().bold(),
            style(&p.workflow).bold(),
            p.git_ref,
            style(short(&p.revision)).dim()
        )),
        Event::JobStarted(p) => Some(format!(
            "{} {}",
            style("━━▶").cyan(),
            style(&p.job).bold()
        )),
        Event::JobSkipped(p) => Some(format!(
            "{} {} skipped: {}",
            style("⏭").dim(),
            style(&p.job).dim(),
            p.reason
        )),
        Event::JobCompleted(p) => {
            let marker = match p.status {
                JobStatus::Succeeded => style("✓").green().bold(),
                _ => style("✗").red().bold(),
            };
            let mut line = format!(
                "{} {} {} in {}",
                marker,
                style(&p.job).bold(),
                p.status,
                format_duration(p.duration_ms)
            );
            if let Some(message) = &p.message {
                line.push_str(&format!(": {}", message));
            }
            Some(line)
        }
        Event::StepStarted(p) => Some(format!(
            "  [{}] {}",
            style(&p.job).dim(),
            style(&p.step_name).bold()
        )),
        Event::StepOutput(p) => Some(match p.stream {
            OutputStream::Stdout => format!("  [{}]   {}", style(&p.job).dim(), style(&p.line).dim()),
            OutputStream::Stderr => {
                format!("  [{}]   {}", style(&p.job).dim(), style(&p.line).red().dim())
            }
        }),
        Event::StepCompleted(p) if p.status == StepStatus::Failed => Some(format!(
            "  [{}] {} {} failed{}",
            style(&p.job).dim(),
            style("✗").red(),
            p.step_name,
            p.exit_code
                .map(|code| format!(" with exit code {code}"))
                .unwrap_or_default()
        )),
        Event::CacheRestored(p) => Some(match &p.matched_key {
            Some(key) => format!(
                "  [{}] {} Restored cache {} ({} bytes)",
                style(&p.job).dim(),
                style("↻").yellow(),
                key,
                p.size_bytes
            ),
            None => format!(
                "  [{}] {} No cache found for {}",
                style(&p.job).dim(),
                style("i").blue(),
                p.keys.join(", ")
            ),
        }),
        Event::CacheSaved(p) => Some(format!(
            "  [{}] {} Saved cache {} ({} bytes)",
            style(&p.job).dim(),
            style("✓").green(),
            p.key,
            p.size_bytes
        )),
        Event::WorkflowCompleted(_)
        | Event::JobQueued(_)
        | Event::StepCompleted(_) => None,
    }
}

/// Print events until every sender is gone.
pub async fn print_events(mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        if let Some(line) = render(&event) {
            println!("{}", line);
        }
    }
}

/// Final summary table for a finished run.
pub fn summary(run: &WorkflowRun) -> String {
    let width = run.jobs.iter().map(|job| job.name.len()).max().unwrap_or(0);
    let mut out = String::new();

    out.push_str(&format!("\n{}\n", style("Summary").bold().underlined()));
    for job in &run.jobs {
        let status = match job.status {
            JobStatus::Succeeded => style(job.status.to_string()).green(),
            JobStatus::Failed => style(job.status.to_string()).red(),
            _ => style(job.status.to_string()).dim(),
        };
        let duration = job.duration_ms.map(format_duration).unwrap_or_default();
        out.push_str(&format!(
            "  {:<width$}  {:<9}  {}\n",
            job.name,
            status,
            duration,
            width = width
        ));
    }
    if !run.filtered_out.is_empty() {
        out.push_str(&format!(
            "  {} {}\n",
            style("filtered out:").dim(),
            run.filtered_out.join(", ")
        ));
    }

    let marker = if run.is_success() {
        style("✓").green().bold()
    } else {
        style("✗").red().bold()
    };
    out.push_str(&format!(
        "{} Workflow {} {} in {}\n",
        marker,
        style(&run.workflow).bold(),
        run.status,
        format_duration(run.duration_ms.unwrap_or(0))
    ));
    out
}

pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

fn short(revision: &str) -> &str {
    revision.get(..7).unwrap_or(revision)
}
