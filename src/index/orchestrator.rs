//! Per-age fitting, prediction and bootstrap on a worker pool.
//!
//! Age classes are independent: each worker fits the two-part model of one
//! age, predicts every year on the grid and bootstraps the intervals. Results
//! are written to the column of their age index, so the assembled matrices do
//! not depend on scheduling. Each age seeds its own generator from
//! `seed + age_index`.
//!
//! Any fitting failure fails the whole run; workers are joined first and the
//! lowest failing age is reported.

use std::collections::BTreeSet;

use nalgebra::DMatrix;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::domain::{Frame, GridCell, HaulRecord, ModelSpec, RunConfig, YearStatus};
use crate::error::{Result, SurveyIndexError};
use crate::fit::{FittedModelPair, PenalizedIrls, SmoothRegression, TwoPartModelFitter};
use crate::index::bootstrap::{BootstrapEstimator, BootstrapInterval};
use crate::index::predict::{GridPredictor, YearPrediction, prediction_defaults};
use crate::index::result::IndexResult;

/// Everything one worker produces for its age class.
#[derive(Debug, Clone)]
struct AgeOutcome {
    pair: FittedModelPair,
    counts: Vec<f64>,
    predictions: Vec<YearPrediction>,
    intervals: Vec<BootstrapInterval>,
}

/// Compute the survey index with the default P-IRLS backend.
pub fn run_survey_index(
    hauls: &[HaulRecord],
    grid: &[GridCell],
    config: &RunConfig,
) -> Result<IndexResult> {
    run_survey_index_with(&TwoPartModelFitter::new(PenalizedIrls::default()), hauls, grid, config)
}

/// Compute the survey index with a caller-supplied regression backend.
pub fn run_survey_index_with<R: SmoothRegression>(
    fitter: &TwoPartModelFitter<R>,
    hauls: &[HaulRecord],
    grid: &[GridCell],
    config: &RunConfig,
) -> Result<IndexResult> {
    let specs = config.model_specs()?;
    validate_inputs(hauls, grid, specs.len())?;

    // Result rows are the distinct years in increasing order.
    let years: Vec<i32> = match &config.years {
        Some(years) if years.is_empty() => {
            return Err(SurveyIndexError::Configuration("`years` is empty".to_string()));
        }
        Some(years) => years.iter().copied().collect::<BTreeSet<_>>().into_iter().collect(),
        None => hauls
            .iter()
            .map(|h| h.year)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
    };
    let frame = Frame::from_hauls(hauls)?;

    log::info!(
        "survey index: {} ages, {} years, {} hauls, {} grid cells, {} workers",
        specs.len(),
        years.len(),
        hauls.len(),
        grid.len(),
        config.workers
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .map_err(|e| SurveyIndexError::Configuration(format!("cannot start worker pool: {e}")))?;

    let job = AgeJob {
        hauls,
        grid,
        frame: &frame,
        years: &years,
        config,
    };
    let outcomes: Vec<Result<AgeOutcome>> =
        pool.install(|| specs.par_iter().map(|spec| job.run(fitter, spec)).collect());

    // Collected in age order, so the first error is the lowest failing age.
    let outcomes = outcomes.into_iter().collect::<Result<Vec<_>>>()?;

    let result = assemble(&years, &config.ages, outcomes);
    log::info!(
        "survey index done: total edf={:.2}, total loglik={:.3}, {} degenerate entries",
        result.total_edf,
        result.total_log_likelihood,
        result.degenerate_count()
    );
    Ok(result)
}

fn validate_inputs(hauls: &[HaulRecord], grid: &[GridCell], n_ages: usize) -> Result<()> {
    if hauls.is_empty() {
        return Err(SurveyIndexError::Configuration("no haul observations".to_string()));
    }
    if grid.is_empty() {
        return Err(SurveyIndexError::Configuration("prediction grid is empty".to_string()));
    }
    if let Some(h) = hauls.iter().find(|h| h.numbers_at_age.len() != n_ages) {
        return Err(SurveyIndexError::Configuration(format!(
            "haul `{}` has {} age counts, {n_ages} age classes are configured",
            h.haul_id,
            h.numbers_at_age.len()
        )));
    }
    Ok(())
}

/// Shared, read-only inputs of every age worker.
struct AgeJob<'a> {
    hauls: &'a [HaulRecord],
    grid: &'a [GridCell],
    frame: &'a Frame,
    years: &'a [i32],
    config: &'a RunConfig,
}

impl AgeJob<'_> {
    fn run<R: SmoothRegression>(
        &self,
        fitter: &TwoPartModelFitter<R>,
        spec: &ModelSpec,
    ) -> Result<AgeOutcome> {
        let age = spec.age_index;
        log::info!("age {}: start", spec.age_label);

        let counts: Vec<f64> = self.hauls.iter().map(|h| h.numbers_at_age[age]).collect();
        let pair = fitter.fit(spec, self.frame, &counts)?;

        let defaults = prediction_defaults(self.frame, self.grid);
        let predictor = GridPredictor::new(&pair, self.grid, &defaults, &self.config.predfix);
        let predictions: Vec<YearPrediction> = self
            .years
            .iter()
            .map(|&year| {
                let has_positive = self
                    .hauls
                    .iter()
                    .zip(&counts)
                    .any(|(h, &c)| h.year == year && c > spec.cutoff);
                predictor.predict_year(year, has_positive)
            })
            .collect();

        let settings = self.config.bootstrap();
        let mut rng = StdRng::seed_from_u64(settings.seed.wrapping_add(age as u64));
        let intervals = BootstrapEstimator::new(settings).intervals(&pair, &predictions, &mut rng)?;

        log::info!(
            "age {}: done ({} of {} years estimated)",
            spec.age_label,
            predictions.iter().filter(|p| p.status == YearStatus::Estimated).count(),
            predictions.len()
        );

        Ok(AgeOutcome {
            pair,
            counts,
            predictions,
            intervals,
        })
    }
}

fn assemble(years: &[i32], ages: &[String], outcomes: Vec<AgeOutcome>) -> IndexResult {
    let (n_years, n_ages) = (years.len(), ages.len());
    let mut index = DMatrix::zeros(n_years, n_ages);
    let mut lower = DMatrix::zeros(n_years, n_ages);
    let mut upper = DMatrix::zeros(n_years, n_ages);
    let mut log_sd = DMatrix::from_element(n_years, n_ages, f64::NAN);
    let mut status = DMatrix::from_element(n_years, n_ages, YearStatus::Estimated);
    let mut models = Vec::with_capacity(n_ages);
    let mut cell_predictions = Vec::with_capacity(n_ages);
    let mut age_log_likelihood = Vec::with_capacity(n_ages);
    let mut age_edf = Vec::with_capacity(n_ages);
    let mut age_counts = Vec::with_capacity(n_ages);

    for outcome in outcomes {
        let a = outcome.pair.age_index;
        for (y, (prediction, interval)) in outcome
            .predictions
            .iter()
            .zip(&outcome.intervals)
            .enumerate()
        {
            index[(y, a)] = prediction.index;
            lower[(y, a)] = interval.lower;
            upper[(y, a)] = interval.upper;
            log_sd[(y, a)] = interval.log_sd;
            status[(y, a)] = prediction.status;
        }
        age_log_likelihood.push(outcome.pair.log_likelihood);
        age_edf.push(outcome.pair.edf);
        age_counts.push(outcome.counts);
        cell_predictions.push(outcome.predictions.into_iter().map(|p| p.cells).collect());
        models.push(outcome.pair);
    }

    IndexResult {
        years: years.to_vec(),
        ages: ages.to_vec(),
        index,
        lower,
        upper,
        log_sd,
        status,
        total_log_likelihood: age_log_likelihood.iter().sum(),
        total_edf: age_edf.iter().sum(),
        models,
        cell_predictions,
        age_log_likelihood,
        age_edf,
        age_counts,
    }
}
