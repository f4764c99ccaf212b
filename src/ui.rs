//! Terminal output: spinners and coloured status reports.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::store::{LifecycleStatus, StepRecord, StepStatus, WorkUnit};
use crate::tracker::StepProgress;
use crate::translate::ValidationSummary;

/// Spinner for a long-running foreground command.
///
/// The bar is cleared when the command finishes and replaced by a single
/// ✓ or ✗ line.
pub struct Spinner {
    pb: ProgressBar,
    /// Success marker.
    green: Style,
    /// Failure marker.
    red: Style,
}

impl Spinner {
    /// Starts ticking immediately with `message` beside the spinner.
    pub fn start(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(message.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
        }
    }

    pub fn succeed(&self, message: &str) {
        self.pb.finish_and_clear();
        println!("  {} {message}", self.green.apply_to("✓"));
    }

    pub fn fail(&self, message: &str) {
        self.pb.finish_and_clear();
        println!("  {} {message}", self.red.apply_to("✗"));
    }
}

fn lifecycle_style(status: LifecycleStatus) -> Style {
    match status {
        LifecycleStatus::Ready | LifecycleStatus::FullyPublished => Style::new().green(),
        LifecycleStatus::PrimaryPublished => Style::new().cyan(),
        LifecycleStatus::Failed
        | LifecycleStatus::PrimaryPublishFailed
        | LifecycleStatus::SecondaryPublishFailed => Style::new().red().bold(),
        _ => Style::new().yellow(),
    }
}

fn step_style(status: StepStatus) -> Style {
    match status {
        StepStatus::Completed => Style::new().green(),
        StepStatus::Skipped => Style::new().dim(),
        StepStatus::Failed => Style::new().red().bold(),
        StepStatus::Running => Style::new().cyan(),
        StepStatus::Pending => Style::new().yellow(),
    }
}

/// One line per unit: reference, lifecycle code and name, creation time.
pub fn print_units(units: &[WorkUnit]) {
    if units.is_empty() {
        println!("No units.");
        return;
    }
    for unit in units {
        let status = format!("{} {}", unit.status.code(), unit.status);
        println!(
            "{:<28} {:<34} {}",
            unit.source_ref,
            lifecycle_style(unit.status).apply_to(status),
            unit.created_at.format("%Y-%m-%d %H:%M")
        );
    }
}

/// Unit header followed by every step with its status, duration and error.
pub fn print_unit(unit: &WorkUnit, steps: &[StepRecord], progress: &StepProgress) {
    let bold = Style::new().bold();
    println!("{}", bold.apply_to(&unit.source_ref));
    println!(
        "  status   {}",
        lifecycle_style(unit.status).apply_to(format!("{} {}", unit.status.code(), unit.status))
    );
    if let Some(title) = unit.generated_title.as_deref().or(Some(unit.title.as_str())).filter(|t| !t.is_empty()) {
        println!("  title    {title}");
    }
    if let Some(id) = unit.publish_id() {
        println!("  id       {id}");
    }
    println!(
        "  progress {}% ({}/{} done, {} failed)",
        progress.percent, progress.completed, progress.total, progress.failed
    );
    println!();
    for step in steps {
        let duration = step
            .duration_ms
            .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
            .unwrap_or_default();
        println!(
            "  {}. {:<20} {:<10} {}",
            step.step_order,
            step.step_name,
            step_style(step.status).apply_to(step.status.as_str()),
            duration
        );
        if let Some(error) = &step.error_message {
            println!("     {}", Style::new().red().apply_to(error));
        }
    }
}

pub fn print_validation(summary: &ValidationSummary) {
    let style = if summary.is_clean() {
        Style::new().green()
    } else {
        Style::new().yellow()
    };
    println!(
        "  {}",
        style.apply_to(format!(
            "{} entries, {} valid, {} unresolved, {} repaired",
            summary.total, summary.valid, summary.missing, summary.fixed
        ))
    );
}
