//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the fitting code stays clean and testable
//! - output changes are localized

use crate::app::pipeline::RunOutput;
use crate::domain::{ModelSpec, RunConfig, YearStatus};
use crate::index::IndexResult;

/// Format the run header (inputs, settings, totals).
pub fn format_run_summary(run: &RunOutput) -> String {
    let config = &run.config;
    let result = &run.result;
    let mut out = String::new();

    out.push_str("=== survey-index - Age-based abundance index ===\n");
    out.push_str(&format!(
        "Hauls: {} used / {} read | Grid cells: {} used / {} read\n",
        run.hauls.rows.len(),
        run.hauls.rows_read,
        run.grid.rows.len(),
        run.grid.rows_read
    ));
    out.push_str(&format!(
        "Family: {} | zero link: {:?} | cutoff: {} | penalty: {}\n",
        config.family.display_name(),
        config.zero_link,
        config.cutoff,
        if config.use_bic {
            "BIC".to_string()
        } else {
            format!("gamma={}", config.gamma)
        }
    ));
    if config.bootstrap().enabled() {
        out.push_str(&format!(
            "Bootstrap: {} draws | {:.0}% intervals | seed {}\n",
            config.n_boot,
            config.ci_level * 100.0,
            config.seed
        ));
    } else {
        out.push_str("Bootstrap: off (bounds equal the point estimate)\n");
    }
    out.push_str(&format!(
        "Total edf={:.2} | logLik={:.3} | AIC={:.3}\n",
        result.total_edf,
        result.total_log_likelihood,
        result.aic()
    ));

    let skipped = run.hauls.row_errors.len() + run.grid.row_errors.len();
    if skipped > 0 {
        out.push_str(&format!("Skipped rows: {skipped}\n"));
        for e in run.hauls.row_errors.iter().chain(&run.grid.row_errors).take(10) {
            out.push_str(&format!(
                "  line {}{}: {}\n",
                e.line,
                e.id.as_deref().map(|id| format!(" ({id})")).unwrap_or_default(),
                e.message
            ));
        }
    }

    out
}

/// Format the index table: one row per year, `index [lower, upper]` per age.
///
/// Degenerate entries are marked `*` (no catch above the cutoff) or `!`
/// (prediction failed).
pub fn format_index_table(result: &IndexResult) -> String {
    let mut out = String::new();

    out.push_str(format!("{:<6}", "year").trim_end());
    for age in &result.ages {
        out.push_str(&format!(" {:>36}", format!("age {age}")));
    }
    out.push('\n');
    out.push_str(&format!("{:-<6}", ""));
    for _ in &result.ages {
        out.push_str(&format!(" {:-<36}", ""));
    }
    out.push('\n');

    for (y, year) in result.years.iter().enumerate() {
        out.push_str(&format!("{year:<6}"));
        for a in 0..result.n_ages() {
            let cell = format!(
                "{} [{}, {}]{}",
                fmt_num(result.index[(y, a)]),
                fmt_num(result.lower[(y, a)]),
                fmt_num(result.upper[(y, a)]),
                status_mark(result.status[(y, a)])
            );
            out.push_str(&format!(" {cell:>36}"));
        }
        out.push('\n');
    }

    if result.degenerate_count() > 0 {
        out.push_str("  * no catch above cutoff   ! prediction failed\n");
    }

    out
}

/// Format per-age model diagnostics.
pub fn format_diagnostics(result: &IndexResult) -> String {
    let mut out = String::new();
    out.push_str("Model diagnostics:\n");
    for (a, pair) in result.models.iter().enumerate() {
        out.push_str(&format!(
            "  age {:<4} hauls={} positive={} edf={:.2} (pos {:.2}, zero {:.2}) logLik={:.3} sig2={:.4}\n",
            pair.age_label,
            pair.n_hauls,
            pair.n_positive,
            result.age_edf[a],
            pair.positive.edf,
            pair.zero.edf,
            result.age_log_likelihood[a],
            pair.sig2
        ));
        out.push_str(&format!(
            "           lambdas pos={} zero={}\n",
            fmt_vec(&pair.positive.lambdas),
            fmt_vec(&pair.zero.lambdas)
        ));
    }
    out
}

/// Format the result of `survey-index check`.
pub fn format_check(config: &RunConfig, specs: &[ModelSpec]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Configuration OK: {} age classes, family {}, {} workers\n",
        specs.len(),
        config.family.display_name(),
        config.workers
    ));
    for spec in specs {
        out.push_str(&format!(
            "  age {:<4} positive (k={}): {}\n           zero     (k={}): {}\n",
            spec.age_label, spec.k_positive, spec.formula_positive, spec.k_zero, spec.formula_zero
        ));
    }
    out
}

fn status_mark(status: YearStatus) -> &'static str {
    match status {
        YearStatus::Estimated => " ",
        YearStatus::NoPositiveCatch => "*",
        YearStatus::PredictionFailed => "!",
    }
}

fn fmt_num(v: f64) -> String {
    if v == 0.0 {
        "0".to_string()
    } else if v.abs() >= 1e5 || v.abs() < 1e-2 {
        format!("{v:.3e}")
    } else {
        format!("{v:.2}")
    }
}

fn fmt_vec(v: &[f64]) -> String {
    let parts: Vec<String> = v.iter().map(|x| format!("{x:.3e}")).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_compact() {
        assert_eq!(fmt_num(0.0), "0");
        assert_eq!(fmt_num(12.345), "12.35");
        assert_eq!(fmt_num(123456.0), "1.235e5");
        assert_eq!(fmt_vec(&[1.0, 250.0]), "[1.000e0, 2.500e2]");
    }

    #[test]
    fn status_marks_are_distinct() {
        assert_ne!(status_mark(YearStatus::NoPositiveCatch), status_mark(YearStatus::PredictionFailed));
        assert_eq!(status_mark(YearStatus::Estimated).trim(), "");
    }
}
