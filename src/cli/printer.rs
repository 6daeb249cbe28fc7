//! Console progress output.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::{CompileError, StageListener};
use crate::domain::{CompiledStage, DynamicStep, StageProgress, StepProgress, SubResult};

/// Listener printing stage progress to stdout, one line per transition
#[derive(Debug, Default)]
pub struct ProgressPrinter {
    total_steps: AtomicUsize,
}

impl ProgressPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, step: &StepProgress) -> String {
        format!(
            "[{}/{}]",
            step.step.order(),
            self.total_steps.load(Ordering::Relaxed)
        )
    }
}

fn status(success: Option<bool>) -> &'static str {
    match success {
        Some(true) => "ok",
        Some(false) => "failed",
        None => "unknown",
    }
}

impl StageListener for ProgressPrinter {
    fn stage_parsing_started(&self, stage_name: &str) {
        println!("Parsing {} steps...", stage_name);
    }

    fn stage_parsing_finished(
        &self,
        stage: Option<&CompiledStage>,
        output: &str,
        error: Option<&CompileError>,
    ) {
        if let Some(err) = error {
            println!("Parsing failed:");
            for message in err.messages() {
                println!("  {}", message);
            }
            return;
        }
        if let Some(stage) = stage {
            println!("Parsed {}: {} steps", stage.name, stage.total_steps());
        }
        if !output.trim().is_empty() {
            println!("{}", output.trim_end());
        }
    }

    fn stage_started(&self, stage: &StageProgress) {
        self.total_steps.store(stage.total_steps(), Ordering::Relaxed);
        println!("Starting stage: {}", stage.name);
    }

    fn stage_finished(&self, stage: &StageProgress) {
        let total = stage.total_steps();
        println!(
            "Ended stage: {} succeeded={}/{} failed={}/{} skipped={}/{} result={}",
            stage.name,
            stage.succeeded_count(),
            total,
            stage.failed_count(),
            total,
            stage.skipped_count(),
            total,
            status(stage.success())
        );
    }

    fn step_runner_started(&self, step: &StepProgress) {
        println!(
            "{} Executing runner {}({})...",
            self.position(step),
            step.step.match_name(),
            step.args_summary
        );
    }

    fn step_runner_finished(&self, step: &StepProgress) {
        println!(
            "{} {}... {}",
            self.position(step),
            step.step.match_name(),
            status(step.success())
        );
    }

    fn step_state_started(&self, step: &StepProgress) {
        println!(
            "{} Executing {} on {}",
            self.position(step),
            step.step.match_name(),
            step.target_names().join(", ")
        );
    }

    fn step_state_minion_finished(&self, step: &StepProgress, node: &str) {
        let success = step.node(node).and_then(|n| n.success());
        println!("         |_ {}... {}", node, status(success));
    }

    fn step_state_result(&self, _step: &StepProgress, event: &SubResult) {
        println!(
            "         |  {}: {} {}",
            event.node,
            event.name,
            status(Some(event.result))
        );
    }

    fn step_state_finished(&self, step: &StepProgress) {
        println!(
            "{} {}... {}",
            self.position(step),
            step.step.match_name(),
            status(step.success())
        );
    }

    fn step_skipped(&self, step: &StepProgress) {
        println!(
            "{} Skipping {} ({})",
            self.position(step),
            step.step.match_name(),
            step.step.description
        );
    }

    fn dynamic_step_started(&self, step: &DynamicStep) {
        let mut line = format!("[*] Executing {}", step.name);
        if step.targets.is_some() {
            line.push_str(&format!(" on {}", step.target_names().join(", ")));
        } else if !step.args_summary.is_empty() {
            line.push_str(&format!("({})", step.args_summary));
        }
        println!("{}", line);
    }

    fn dynamic_step_finished(&self, step: &DynamicStep) {
        println!("[*] {}... {}", step.name, status(step.success()));
    }
}

/// Print a compiled stage, one step per line with its sub-steps and
/// dependency positions
pub fn print_steps(stage: &CompiledStage) {
    println!("{} ({} steps)", stage.name, stage.total_steps());
    println!("{}", "-".repeat(60));

    for step in &stage.steps {
        let mut line = format!(
            "[{}] {}: {} {}",
            step.order(),
            step.description,
            step.declared_as.label(),
            step.match_name()
        );
        if let Some(target) = step.target_selector() {
            line.push_str(&format!(" on '{}'", target));
        }

        let requires = step.success_dep_orders();
        if !requires.is_empty() {
            line.push_str(&format!(" requires {}", join_orders(&requires)));
        }
        let on_fail = step.failure_dep_orders();
        if !on_fail.is_empty() {
            line.push_str(&format!(" onfail {}", join_orders(&on_fail)));
        }
        println!("{}", line);

        for sub_step in step.sub_steps() {
            let hidden = if sub_step.visible { "" } else { " (silent)" };
            println!("      - {}{}", sub_step.pretty(), hidden);
        }
    }
}

fn join_orders(orders: &[usize]) -> String {
    orders
        .iter()
        .map(|o| o.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
