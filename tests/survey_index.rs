use std::collections::BTreeMap;

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use survey_index::domain::{
    CovariateValue, Family, Frame, GridCell, HaulRecord, RunConfig, YearStatus,
};
use survey_index::error::SurveyIndexError;
use survey_index::index::{GridPredictor, prediction_defaults, run_survey_index};

const YEARS: [i32; 5] = [2001, 2002, 2003, 2004, 2005];

/// Hauls for three age classes with a smooth depth/longitude signal.
fn synthetic_hauls(seed: u64) -> Vec<HaulRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.4).unwrap();
    let mut hauls = Vec::new();

    for &year in &YEARS {
        let year_effect = 0.15 * (year - 2003) as f64;
        for i in 0..50 {
            let lon = rng.gen_range(0.0..10.0);
            let lat = rng.gen_range(54.0..58.0);
            let depth = rng.gen_range(20.0..120.0);
            let numbers_at_age = (0..3)
                .map(|age| {
                    let p_presence = 1.0 / (1.0 + (-(0.8 + 0.4 * (lon * 0.5_f64).sin())).exp());
                    if rng.r#gen::<f64>() > p_presence {
                        0.0
                    } else {
                        let log_mean = 3.0 - 0.6 * age as f64 + year_effect - depth / 100.0;
                        (log_mean + noise.sample(&mut rng)).exp() + 1.0
                    }
                })
                .collect();
            hauls.push(HaulRecord {
                haul_id: format!("{year}-{i}"),
                year,
                lon,
                lat,
                depth,
                gear: ["GOV", "TVL"][i % 2].to_string(),
                ship: ["DAN2", "SOL", "WAH3"][i % 3].to_string(),
                time_of_year: rng.gen_range(30.0..70.0),
                haul_dur: rng.gen_range(20.0..40.0),
                extra: BTreeMap::new(),
                numbers_at_age,
            });
        }
    }
    hauls
}

fn grid() -> Vec<GridCell> {
    let mut cells = Vec::new();
    for i in 0..6 {
        for j in 0..4 {
            cells.push(GridCell {
                lon: 0.5 + 1.5 * i as f64,
                lat: 54.5 + j as f64,
                depth: 25.0 + 15.0 * (i + j) as f64,
                extra: BTreeMap::new(),
            });
        }
    }
    cells
}

fn config(n_ages: usize) -> RunConfig {
    RunConfig {
        ages: (1..=n_ages).map(|a| a.to_string()).collect(),
        formula_positive: vec!["year + s(depth, k = k)".to_string(); n_ages],
        formula_zero: vec!["s(lon, k = k)".to_string(); n_ages],
        k_positive: vec![6; n_ages],
        k_zero: vec![5; n_ages],
        cutoff: 0.0,
        n_boot: 0,
        ..RunConfig::default()
    }
}

#[test]
fn index_matrix_has_one_row_per_year_and_column_per_age() {
    let hauls = synthetic_hauls(1);
    let result = run_survey_index(&hauls, &grid(), &config(3)).unwrap();

    assert_eq!(result.years, YEARS.to_vec());
    assert_eq!(result.index.shape(), (5, 3));
    assert_eq!(result.cell_predictions.len(), 3);
    assert_eq!(result.cell_predictions[0].len(), 5);
    assert_eq!(result.cell_predictions[0][0].len(), grid().len());

    for y in 0..5 {
        for a in 0..3 {
            assert_eq!(result.status[(y, a)], YearStatus::Estimated);
            assert!(result.index[(y, a)] > 0.0);
            // No bootstrap: bounds collapse onto the point estimate.
            assert_eq!(result.lower[(y, a)], result.index[(y, a)]);
            assert_eq!(result.upper[(y, a)], result.index[(y, a)]);
            assert!(result.log_sd[(y, a)].is_nan());
        }
    }
    // Younger ages are more abundant in the simulation.
    assert!(result.index[(2, 0)] > result.index[(2, 2)]);
}

#[test]
fn year_without_positive_catch_is_exactly_zero() {
    let mut hauls = synthetic_hauls(2);
    for h in hauls.iter_mut().filter(|h| h.year == 2003) {
        h.numbers_at_age[0] = 0.0;
    }
    let mut cfg = config(2);
    cfg.n_boot = 50;
    let result = run_survey_index(&hauls, &grid(), &cfg).unwrap();

    let row = result.year_row(2003).unwrap();
    assert_eq!(result.status[(row, 0)], YearStatus::NoPositiveCatch);
    assert_eq!(result.index[(row, 0)], 0.0);
    assert_eq!(result.lower[(row, 0)], 0.0);
    assert_eq!(result.upper[(row, 0)], 0.0);
    assert!(result.cell_predictions[0][row].iter().all(|&c| c == 0.0));

    // The other age is unaffected.
    assert_eq!(result.status[(row, 1)], YearStatus::Estimated);
    assert!(result.index[(row, 1)] > 0.0);
    assert_eq!(result.degenerate_count(), 1);
}

#[test]
fn lognormal_index_matches_direct_computation_from_coefficients() {
    let hauls = synthetic_hauls(3);
    let grid = grid();
    let mut cfg = config(1);
    cfg.family = Family::LogNormal;
    let result = run_survey_index(&hauls, &grid, &cfg).unwrap();
    let pair = &result.models[0];
    assert!(pair.sig2 > 0.0);

    let frame = Frame::from_hauls(&hauls).unwrap();
    let defaults = prediction_defaults(&frame, &grid);
    let predfix = BTreeMap::new();
    let predictor = GridPredictor::new(pair, &grid, &defaults, &predfix);

    for (y, &year) in YEARS.iter().enumerate() {
        let cells = predictor.prediction_frame(year).unwrap();
        let eta_zero = pair.zero.predict_link(&cells).unwrap();
        let eta_positive = pair.positive.predict_link(&cells).unwrap();
        let expected: f64 = eta_zero
            .iter()
            .zip(eta_positive.iter())
            .map(|(&e0, &e1)| {
                let p = 1.0 / (1.0 + (-e0).exp());
                p * (e1 + pair.sig2 / 2.0).exp()
            })
            .sum();
        assert_relative_eq!(result.index[(y, 0)], expected, max_relative = 1e-10);
        let cell_total: f64 = result.cell_predictions[0][y].iter().sum();
        assert_relative_eq!(cell_total, expected, max_relative = 1e-10);
    }
}

#[test]
fn short_formula_vector_fails_before_fitting() {
    let mut cfg = config(3);
    cfg.formula_zero.truncate(2);
    // Empty inputs would fail later; the configuration is checked first.
    let err = run_survey_index(&[], &[], &cfg).unwrap_err();
    assert!(matches!(err, SurveyIndexError::Configuration(_)));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn total_edf_and_loglik_are_sums_over_models() {
    let hauls = synthetic_hauls(4);
    let result = run_survey_index(&hauls, &grid(), &config(2)).unwrap();

    let edf: f64 = result.models.iter().map(|m| m.positive.edf + m.zero.edf).sum();
    assert_relative_eq!(result.total_edf, edf, epsilon = 1e-9);
    assert_relative_eq!(result.total_edf, result.age_edf.iter().sum::<f64>(), epsilon = 1e-12);
    assert_relative_eq!(
        result.total_log_likelihood,
        result.age_log_likelihood.iter().sum::<f64>(),
        epsilon = 1e-9
    );
    assert_relative_eq!(
        result.aic(),
        2.0 * result.total_edf - 2.0 * result.total_log_likelihood
    );
}

#[test]
fn bootstrap_is_reproducible_and_ordered() {
    let hauls = synthetic_hauls(5);
    let mut cfg = config(2);
    cfg.formula_positive = vec!["year + s(depth, k = k) + s(ship, bs = \"re\", by = dum)".to_string(); 2];
    cfg.n_boot = 60;
    cfg.seed = 11;
    cfg.workers = 1;
    let a = run_survey_index(&hauls, &grid(), &cfg).unwrap();
    cfg.workers = 3;
    let b = run_survey_index(&hauls, &grid(), &cfg).unwrap();

    assert_eq!(a.index, b.index);
    assert_eq!(a.lower, b.lower);
    assert_eq!(a.upper, b.upper);

    for y in 0..a.n_years() {
        for age in 0..a.n_ages() {
            assert!(a.lower[(y, age)] <= a.upper[(y, age)]);
            assert!(a.lower[(y, age)] > 0.0);
            assert!(a.log_sd[(y, age)].is_finite() && a.log_sd[(y, age)] > 0.0);
        }
    }

    cfg.seed = 12;
    let c = run_survey_index(&hauls, &grid(), &cfg).unwrap();
    assert_eq!(a.index, c.index);
    assert_ne!(a.lower, c.lower);
}

#[test]
fn unknown_fixed_level_degrades_every_year_to_zero() {
    let hauls = synthetic_hauls(6);
    let mut cfg = config(1);
    cfg.formula_positive = vec!["year + gear + s(depth, k = k)".to_string()];
    cfg.predfix = BTreeMap::from([("gear".to_string(), CovariateValue::Level("BEAM".to_string()))]);
    let result = run_survey_index(&hauls, &grid(), &cfg).unwrap();

    for y in 0..result.n_years() {
        assert_eq!(result.status[(y, 0)], YearStatus::PredictionFailed);
        assert_eq!(result.index[(y, 0)], 0.0);
        assert_eq!(result.upper[(y, 0)], 0.0);
    }
}

#[test]
fn fitting_failure_reports_the_lowest_failing_age() {
    let hauls = synthetic_hauls(7);
    let mut cfg = config(3);
    cfg.formula_zero[1] = "s(temperature, k = k)".to_string();
    cfg.formula_zero[2] = "s(temperature, k = k)".to_string();
    let err = run_survey_index(&hauls, &grid(), &cfg).unwrap_err();
    match err {
        SurveyIndexError::Fitting { age, .. } => assert_eq!(age, 1),
        other => panic!("unexpected error {other}"),
    }
}


#[test]
fn configured_years_are_sorted_and_distinct() {
    let hauls = synthetic_hauls(9);
    let mut cfg = config(1);
    cfg.years = Some(vec![2003, 2001, 2002, 2001]);
    let result = run_survey_index(&hauls, &grid(), &cfg).unwrap();

    assert_eq!(result.years, vec![2001, 2002, 2003]);
    assert_eq!(result.index.nrows(), 3);
    assert_eq!(result.cell_predictions[0].len(), 3);

    let mut all_years = config(1);
    all_years.years = None;
    let full = run_survey_index(&hauls, &grid(), &all_years).unwrap();
    for (row, &year) in result.years.iter().enumerate() {
        let full_row = full.year_row(year).unwrap();
        assert_relative_eq!(result.index[(row, 0)], full.index[(full_row, 0)], max_relative = 1e-12);
    }
}

#[test]
fn fitted_counts_are_kept_per_age() {
    let hauls = synthetic_hauls(10);
    let result = run_survey_index(&hauls, &grid(), &config(3)).unwrap();

    assert_eq!(result.age_counts.len(), 3);
    for (a, counts) in result.age_counts.iter().enumerate() {
        let expected: Vec<f64> = hauls.iter().map(|h| h.numbers_at_age[a]).collect();
        assert_eq!(counts, &expected);
        assert_eq!(counts.len(), result.models[a].n_hauls);
        assert_eq!(
            counts.iter().filter(|&&c| c > 0.0).count(),
            result.models[a].n_positive
        );
    }
}
