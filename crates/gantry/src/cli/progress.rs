//! Publish progress on the terminal

use std::time::Duration;

use console::style;
use gantry_core::monorepo::{PackagePublishResult, PublishCallback, PublishPlan, SkipReason};
use indicatif::{ProgressBar, ProgressStyle};

use super::output;

/// Progress bar for a publish run, hidden unless `visible`
pub fn publish_bar(visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new(0);
    if let Ok(template) =
        ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
    {
        bar.set_style(template.progress_chars("=> "));
    }
    bar
}

/// Drives a progress bar from publish events
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl PublishCallback for ProgressReporter {
    fn on_plan_ready(&self, plan: &PublishPlan) {
        self.bar.set_length(plan.total() as u64);
        self.bar.set_position(0);
        if !self.bar.is_hidden() {
            self.bar.enable_steady_tick(Duration::from_millis(120));
        }
    }

    fn on_publish_start(&self, package: &str, version: &str) {
        self.bar.set_message(format!("{}@{}", package, version));
    }

    fn on_publish_complete(&self, package: &str, result: &PackagePublishResult) {
        if result.success {
            let tag = result.dist_tag.as_deref().unwrap_or("latest");
            self.bar.println(format!(
                "{} {} {}",
                style("✓").green().bold(),
                output::package_version(package, &result.version),
                output::tag_style().apply_to(tag)
            ));
        } else {
            self.bar.println(format!(
                "{} {}: {}",
                style("✗").red().bold(),
                package,
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }
        self.bar.inc(1);
    }

    fn on_skip(&self, package: &str, reason: &SkipReason) {
        self.bar.println(format!(
            "{} {} skipped: {}",
            style("!").yellow().bold(),
            package,
            reason
        ));
        self.bar.inc(1);
    }
}
