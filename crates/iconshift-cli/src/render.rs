use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use iconshift_core::IconError;
use iconshift_engine::{
    Backup, BatchReport, CacheClearReport, IntegrityReport, Operation, RestoreReport,
};
use iconshift_security::{Preflight, PrivilegeAssessment};
use indicatif::{HumanCount, ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UiMode {
    Plain,
    Interactive,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
    mode: UiMode,
}

pub(crate) struct TerminalProgress {
    style: OutputStyle,
    label: String,
    total: u64,
    current: u64,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self {
            style,
            mode: ui_mode_from_style(style),
        }
    }

    pub(crate) fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.mode, title) {
            println!();
            let rendered = match self.style {
                OutputStyle::Plain => line,
                OutputStyle::Rich => colorize(section_style(), &line),
            };
            println!("{rendered}");
        }
    }

    pub(crate) fn start_progress(self, label: &str, total: u64) -> TerminalProgress {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new(total.max(1));
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} {msg:<8} [{bar:20.cyan/blue}] {pos:>3}/{len:3} {elapsed_precise}",
            ) {
                progress_bar.set_style(style.tick_chars("|/-\\ ").progress_chars("=>-"));
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        TerminalProgress {
            style: self.style,
            label: label.to_string(),
            total,
            current: 0,
            progress_bar,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }
}

impl TerminalProgress {
    pub(crate) fn set(&mut self, current: u64) {
        self.current = current.min(self.total);

        let Some(progress_bar) = &self.progress_bar else {
            return;
        };

        let safe_total = self.total.max(1);
        progress_bar.set_length(safe_total);
        progress_bar.set_position(self.current.min(safe_total));
    }

    /// Prints above the bar when one is drawn.
    pub(crate) fn println(&self, line: &str) {
        match &self.progress_bar {
            Some(progress_bar) => progress_bar.println(line),
            None => println!("{line}"),
        }
    }

    pub(crate) fn finish_success(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };

        progress_bar.finish_and_clear();
        if let Some(line) = render_progress_line(
            self.style,
            &self.label,
            self.current,
            self.total,
            Some(self.started_at.elapsed()),
        ) {
            println!("{line}");
        }
    }

    pub(crate) fn finish_abandon(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::env::var_os("NO_COLOR").is_some(),
    )
}

pub(crate) fn resolve_output_style(stdout_is_terminal: bool, no_color: bool) -> OutputStyle {
    if stdout_is_terminal && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

pub(crate) fn format_operation_line(operation: &Operation, style: OutputStyle) -> String {
    render_status_line(
        style,
        "ok",
        &format!("{} ({})", operation.describe(), operation.id),
    )
}

pub(crate) fn format_backup_list_lines(backups: &[Backup], style: OutputStyle) -> Vec<String> {
    if backups.is_empty() {
        return vec![render_status_line(style, "step", "no backups")];
    }

    let mut lines = Vec::new();
    for backup in backups {
        lines.push(render_status_line(
            style,
            "step",
            &format!(
                "{} created_at={} entries={}",
                backup.id,
                backup.created_at,
                backup.entries.len()
            ),
        ));
        for entry in &backup.entries {
            lines.push(format!(
                "  {} -> {} [{}]",
                entry.target,
                entry.new_value.location(),
                entry.resource_kind
            ));
        }
    }
    lines
}

pub(crate) fn format_restore_lines(report: &RestoreReport, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![render_status_line(
        style,
        "ok",
        &format!(
            "restored {} entries from backup {}",
            report.restored, report.backup_id
        ),
    )];
    lines.extend(
        report
            .restored_files
            .iter()
            .map(|path| format!("  file: {}", path.display())),
    );
    lines
}

pub(crate) fn format_integrity_lines(report: &IntegrityReport, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    for (backup_id, object) in &report.missing_objects {
        lines.push(render_status_line(
            style,
            "err",
            &format!("backup {backup_id}: object {object} is missing"),
        ));
    }
    for (backup_id, object) in &report.corrupt_objects {
        lines.push(render_status_line(
            style,
            "err",
            &format!("backup {backup_id}: object {object} does not match its hash"),
        ));
    }
    if report.unreferenced_objects > 0 {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "{} unreferenced objects (removed by the next delete or cleanup)",
                report.unreferenced_objects
            ),
        ));
    }
    if !report.stale_tmp_files.is_empty() {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "{} stale temporary files (removed by clear-cache)",
                report.stale_tmp_files.len()
            ),
        ));
    }

    let summary = format!(
        "checked {} backups and {} objects",
        report.backups_checked, report.objects_checked
    );
    lines.push(render_status_line(
        style,
        if report.is_clean() { "ok" } else { "err" },
        &summary,
    ));
    lines
}

pub(crate) fn format_cache_report_lines(
    report: &CacheClearReport,
    style: OutputStyle,
) -> Vec<String> {
    let mut lines = report
        .removed_cache_files
        .iter()
        .map(|path| render_status_line(style, "ok", &format!("removed {}", path.display())))
        .collect::<Vec<_>>();
    if report.shell_step_skipped {
        lines.push(render_status_line(
            style,
            "warn",
            "shell icon cache refresh skipped on this host",
        ));
    } else if report.shell_refreshed {
        lines.push(render_status_line(style, "ok", "shell icon cache refreshed"));
    }
    lines.extend(
        report
            .warnings
            .iter()
            .map(|warning| render_status_line(style, "warn", warning)),
    );
    lines.push(render_status_line(
        style,
        "ok",
        &format!("removed {} stale temporary files", report.stale_tmp_removed),
    ));
    lines
}

pub(crate) fn format_batch_item_line(
    index: usize,
    total: usize,
    target: &str,
    succeeded: bool,
    style: OutputStyle,
) -> String {
    let (status, outcome) = if succeeded {
        ("ok", "applied")
    } else {
        ("err", "failed")
    };
    render_status_line(style, status, &format!("[{index}/{total}] {target} {outcome}"))
}

pub(crate) fn format_batch_report_lines(report: &BatchReport, style: OutputStyle) -> Vec<String> {
    let mut lines = report
        .failed
        .iter()
        .map(|failure| {
            render_status_line(
                style,
                "err",
                &format!(
                    "item {} {} ({}): {}",
                    failure.index + 1,
                    failure.target,
                    failure.kind,
                    failure.reason
                ),
            )
        })
        .collect::<Vec<_>>();

    let status = if report.failed.is_empty() && !report.cancelled() {
        "ok"
    } else {
        "warn"
    };
    lines.push(render_status_line(
        style,
        status,
        &format!(
            "batch: {} of {} applied, {} failed, {} skipped",
            HumanCount(report.succeeded() as u64),
            HumanCount(report.total as u64),
            report.failed.len(),
            report.skipped
        ),
    ));
    lines
}

pub(crate) fn format_assessment_lines(
    assessment: &PrivilegeAssessment,
    preflight: &Preflight,
    style: OutputStyle,
) -> Vec<String> {
    let status = if preflight.can_proceed {
        "ok"
    } else if preflight.needs_elevation {
        "warn"
    } else {
        "err"
    };
    vec![
        format!("administrator: {}", assessment.is_admin),
        format!("protected location: {}", assessment.path_is_protected),
        format!("elevation required: {}", assessment.elevation_required),
        format!("guidance: {}", assessment.guidance_message),
        render_status_line(style, status, &format!("pre-flight: {}", preflight.message)),
    ]
}

/// The error itself, then the stable kind and remedy when the engine raised it.
pub(crate) fn format_error_lines(style: OutputStyle, err: &anyhow::Error) -> Vec<String> {
    let mut lines = vec![render_status_line(style, "err", &format!("error: {err:#}"))];
    if let Some(engine_err) = err.downcast_ref::<IconError>() {
        if let IconError::PartialBatchFailure { failures, .. } = engine_err {
            lines.extend(
                failures
                    .iter()
                    .map(|(target, reason)| format!("  - {target}: {reason}")),
            );
        }
        lines.push(format!("kind: {}", engine_err.kind()));
        lines.push(format!("hint: {}", engine_err.remedy()));
    }
    lines
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn progress_bar_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightBlue.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn ui_mode_from_style(style: OutputStyle) -> UiMode {
    match style {
        OutputStyle::Plain => UiMode::Plain,
        OutputStyle::Rich => UiMode::Interactive,
    }
}

fn render_section_header(mode: UiMode, title: &str) -> Option<String> {
    match mode {
        UiMode::Plain => None,
        UiMode::Interactive => Some(format!("== {title} ==")),
    }
}

pub(crate) fn render_progress_line(
    style: OutputStyle,
    label: &str,
    current: u64,
    total: u64,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let width = 18_usize;
    let safe_total = total.max(1);
    let bounded_current = current.min(safe_total);
    let filled = ((bounded_current as usize) * width) / (safe_total as usize);
    let bar = format!(
        "{}{}",
        "=".repeat(filled),
        "-".repeat(width.saturating_sub(filled))
    );
    let percent = (bounded_current * 100) / safe_total;
    let counts = format!("{}/{}", HumanCount(current), HumanCount(total));
    let suffix = elapsed
        .map(|value| format!(" complete in {}", format_elapsed(value)))
        .unwrap_or_default();

    Some(format!(
        "{} [{}] {:>3}% {}{}",
        colorize(progress_label_style(), label),
        colorize(progress_bar_style(), &bar),
        percent,
        counts,
        suffix
    ))
}
