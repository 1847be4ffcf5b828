//! Exponential-family distributions and link functions for penalised IRLS.
//!
//! The solver needs, per observation:
//! - the link `g(μ)`, its inverse and `dμ/dη` (working response and weights)
//! - the variance function `V(μ)` (working weights)
//! - the unit deviance (convergence and smoothing-parameter scores)
//!
//! and, once converged, the log-likelihood of the fitted model.

use statrs::function::gamma::ln_gamma;

use crate::domain::ZeroLink;

/// Probabilities are kept this far from 0 and 1.
const MU_EPS: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Identity,
    Log,
    Logit,
    Cloglog,
}

impl Link {
    pub fn link(self, mu: f64) -> f64 {
        match self {
            Link::Identity => mu,
            Link::Log => mu.ln(),
            Link::Logit => (mu / (1.0 - mu)).ln(),
            Link::Cloglog => (-(-mu).ln_1p()).ln(),
        }
    }

    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            Link::Identity => eta,
            Link::Log => eta.exp(),
            Link::Logit => 1.0 / (1.0 + (-eta).exp()),
            Link::Cloglog => -(-eta.exp()).exp_m1(),
        }
    }

    /// `dμ/dη` at `eta`.
    pub fn mu_eta(self, eta: f64) -> f64 {
        match self {
            Link::Identity => 1.0,
            Link::Log => eta.exp(),
            Link::Logit => {
                let mu = self.inverse(eta);
                mu * (1.0 - mu)
            }
            Link::Cloglog => (eta - eta.exp()).exp(),
        }
    }
}

impl From<ZeroLink> for Link {
    fn from(value: ZeroLink) -> Self {
        match value {
            ZeroLink::Logit => Link::Logit,
            ZeroLink::Cloglog => Link::Cloglog,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Gaussian,
    Gamma,
    Binomial,
}

/// A distribution paired with its link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlmFamily {
    pub distribution: Distribution,
    pub link: Link,
}

impl GlmFamily {
    pub fn gaussian() -> Self {
        Self {
            distribution: Distribution::Gaussian,
            link: Link::Identity,
        }
    }

    pub fn gamma() -> Self {
        Self {
            distribution: Distribution::Gamma,
            link: Link::Log,
        }
    }

    pub fn binomial(link: Link) -> Self {
        Self {
            distribution: Distribution::Binomial,
            link,
        }
    }

    pub fn name(self) -> &'static str {
        match (self.distribution, self.link) {
            (Distribution::Gaussian, _) => "gaussian(identity)",
            (Distribution::Gamma, _) => "Gamma(log)",
            (Distribution::Binomial, Link::Cloglog) => "binomial(cloglog)",
            (Distribution::Binomial, _) => "binomial(logit)",
        }
    }

    /// Binomial dispersion is fixed at 1; the others are estimated.
    pub fn known_scale(self) -> bool {
        self.distribution == Distribution::Binomial
    }

    pub fn valid_response(self, y: f64) -> bool {
        match self.distribution {
            Distribution::Gaussian => y.is_finite(),
            Distribution::Gamma => y.is_finite() && y > 0.0,
            Distribution::Binomial => y == 0.0 || y == 1.0,
        }
    }

    pub fn variance(self, mu: f64) -> f64 {
        match self.distribution {
            Distribution::Gaussian => 1.0,
            Distribution::Gamma => mu * mu,
            Distribution::Binomial => mu * (1.0 - mu),
        }
    }

    pub fn clamp_mu(self, mu: f64) -> f64 {
        match self.distribution {
            Distribution::Gaussian => mu,
            Distribution::Gamma => mu.max(MU_EPS),
            Distribution::Binomial => mu.clamp(MU_EPS, 1.0 - MU_EPS),
        }
    }

    /// Starting mean for IRLS.
    pub fn initial_mu(self, y: f64) -> f64 {
        match self.distribution {
            Distribution::Gaussian | Distribution::Gamma => y,
            Distribution::Binomial => (y + 0.5) / 2.0,
        }
    }

    pub fn unit_deviance(self, y: f64, mu: f64) -> f64 {
        match self.distribution {
            Distribution::Gaussian => (y - mu) * (y - mu),
            Distribution::Gamma => 2.0 * (-(y / mu).ln() + (y - mu) / mu),
            Distribution::Binomial => {
                let mu = self.clamp_mu(mu);
                -2.0 * (y * mu.ln() + (1.0 - y) * (1.0 - mu).ln())
            }
        }
    }

    pub fn deviance(self, y: &[f64], mu: &[f64]) -> f64 {
        y.iter()
            .zip(mu)
            .map(|(&yi, &mi)| self.unit_deviance(yi, mi))
            .sum()
    }

    /// Log-likelihood at the fitted means, with the dispersion of the
    /// unknown-scale families estimated as `deviance / n`.
    pub fn log_likelihood(self, y: &[f64], mu: &[f64]) -> f64 {
        let n = y.len() as f64;
        match self.distribution {
            Distribution::Gaussian => {
                let sigma2 = (self.deviance(y, mu) / n).max(f64::MIN_POSITIVE);
                -0.5 * n * ((2.0 * std::f64::consts::PI * sigma2).ln() + 1.0)
            }
            Distribution::Gamma => {
                let phi = (self.deviance(y, mu) / n).max(f64::MIN_POSITIVE);
                let shape = 1.0 / phi;
                y.iter()
                    .zip(mu)
                    .map(|(&yi, &mi)| {
                        let scale = mi * phi;
                        -ln_gamma(shape) - shape * scale.ln() + (shape - 1.0) * yi.ln() - yi / scale
                    })
                    .sum()
            }
            Distribution::Binomial => y
                .iter()
                .zip(mu)
                .map(|(&yi, &mi)| {
                    let mi = self.clamp_mu(mi);
                    yi * mi.ln() + (1.0 - yi) * (1.0 - mi).ln()
                })
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn links_invert() {
        for link in [Link::Identity, Link::Log, Link::Logit, Link::Cloglog] {
            for &eta in &[-3.0, -0.5, 0.0, 0.7, 2.0] {
                let mu = link.inverse(eta);
                assert_relative_eq!(link.link(mu), eta, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn mu_eta_matches_finite_difference() {
        let h = 1e-6;
        for link in [Link::Log, Link::Logit, Link::Cloglog] {
            for &eta in &[-2.0, 0.0, 1.0] {
                let fd = (link.inverse(eta + h) - link.inverse(eta - h)) / (2.0 * h);
                assert_relative_eq!(link.mu_eta(eta), fd, max_relative = 1e-6);
            }
        }
    }

    #[test]
    fn deviance_is_zero_at_saturation() {
        let gamma = GlmFamily::gamma();
        assert_relative_eq!(gamma.unit_deviance(3.0, 3.0), 0.0);
        assert!(gamma.unit_deviance(3.0, 1.0) > 0.0);
        let gauss = GlmFamily::gaussian();
        assert_relative_eq!(gauss.unit_deviance(2.0, 0.5), 2.25);
    }

    #[test]
    fn gaussian_log_likelihood_matches_closed_form() {
        let y = [1.0, 2.0, 4.0];
        let mu = [1.5, 2.0, 3.0];
        let n = 3.0;
        let sigma2: f64 = (0.25 + 0.0 + 1.0) / n;
        let expected = -0.5 * n * ((2.0 * std::f64::consts::PI * sigma2).ln() + 1.0);
        assert_relative_eq!(GlmFamily::gaussian().log_likelihood(&y, &mu), expected, epsilon = 1e-12);
    }

    #[test]
    fn gamma_log_likelihood_matches_density() {
        // With shape a and scale mu/a, log f(y) = -lnΓ(a) - a ln(mu/a) + (a-1) ln y - y a / mu.
        let y = [0.5, 2.0, 1.5, 3.0];
        let mu = [1.0, 1.5, 1.2, 2.5];
        let fam = GlmFamily::gamma();
        let phi = fam.deviance(&y, &mu) / 4.0;
        let a = 1.0 / phi;
        let expected: f64 = y
            .iter()
            .zip(&mu)
            .map(|(&yi, &mi)| -ln_gamma(a) - a * (mi / a).ln() + (a - 1.0) * yi.ln() - yi * a / mi)
            .sum();
        assert_relative_eq!(fam.log_likelihood(&y, &mu), expected, epsilon = 1e-9);
    }

    #[test]
    fn binomial_log_likelihood() {
        let fam = GlmFamily::binomial(Link::Logit);
        let ll = fam.log_likelihood(&[1.0, 0.0], &[0.8, 0.3]);
        assert_relative_eq!(ll, 0.8f64.ln() + 0.7f64.ln(), epsilon = 1e-12);
        assert!(fam.valid_response(1.0) && !fam.valid_response(0.5));
    }
}
