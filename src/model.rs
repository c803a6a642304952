use serde::{Deserialize, Serialize};

use crate::cluster::StateInit;
use crate::matrix::Matrix;
use crate::stats::{gamma_logpdf, von_mises_logpdf};

/// Gamma emission parameters (shape/rate).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GammaParams {
    pub shape: f64,
    pub rate: f64,
}

impl GammaParams {
    pub fn mean(&self) -> f64 {
        self.shape / self.rate
    }
    pub fn sd(&self) -> f64 {
        self.shape.sqrt() / self.rate
    }
    pub fn logpdf(&self, x: f64) -> f64 {
        gamma_logpdf(x, self.shape, self.rate)
    }
}

/// Von Mises emission parameters for turning angles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VonMisesParams {
    pub mu: f64,
    pub kappa: f64,
}

impl VonMisesParams {
    pub fn logpdf(&self, x: f64) -> f64 {
        von_mises_logpdf(x, self.mu, self.kappa)
    }
}

/// Emission parameters of one behavioral state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateParams {
    pub step: GammaParams,
    pub alt: GammaParams,
    pub angle: VonMisesParams,
}

impl StateParams {
    /// Joint log emission probability of one fix's observations.
    /// Missing (NaN) streams contribute probability 1.
    pub fn log_emission(&self, step: f64, angle: f64, alt: f64) -> f64 {
        let mut lp = 0.0;
        if !step.is_nan() {
            lp += self.step.logpdf(step);
        }
        if !angle.is_nan() {
            lp += self.angle.logpdf(angle);
        }
        if !alt.is_nan() {
            lp += self.alt.logpdf(alt);
        }
        lp
    }
}

/// Full model for one altitude source: initial distribution, transition
/// matrix (row-major, n x n) and per-state emissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub pi: Vec<f64>,
    pub trans: Vec<f64>,
    pub states: Vec<StateParams>,
    /// total log-likelihood of the last E-step under these parameters
    pub loglik: f64,
}

impl ModelParameters {
    /// Starting model from k-means cluster moments: uniform pi, a
    /// diagonal-dominant transition matrix, flat angle parameters.
    pub fn from_inits(inits: &[StateInit]) -> Self {
        let n = inits.len();
        let pi = vec![1.0 / n as f64; n];
        let mut trans = vec![0.0; n * n];
        // a single state absorbs all the mass; rows must stay stochastic
        let (diag, off) = if n > 1 {
            (0.9, 0.1 / (n - 1) as f64)
        } else {
            (1.0, 0.0)
        };
        for i in 0..n {
            for j in 0..n {
                trans[i * n + j] = if i == j { diag } else { off };
            }
        }
        let states = inits
            .iter()
            .map(|init| StateParams {
                step: GammaParams {
                    shape: init.step.shape,
                    rate: init.step.rate,
                },
                alt: GammaParams {
                    shape: init.alt.shape,
                    rate: init.alt.rate,
                },
                angle: VonMisesParams { mu: 0.0, kappa: 1.0 },
            })
            .collect();
        Self {
            pi,
            trans,
            states,
            loglik: f64::NEG_INFINITY,
        }
    }

    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    pub fn trans_at(&self, from: usize, to: usize) -> f64 {
        self.trans[from * self.n_states() + to]
    }

    /// Largest absolute change of any emission parameter relative to `other`,
    /// used as one of the convergence criteria.
    pub fn max_abs_param_delta(&self, other: &Self) -> f64 {
        let mut d = 0.0f64;
        for (a, b) in self.states.iter().zip(other.states.iter()) {
            d = d.max((a.step.shape - b.step.shape).abs());
            d = d.max((a.step.rate - b.step.rate).abs());
            d = d.max((a.alt.shape - b.alt.shape).abs());
            d = d.max((a.alt.rate - b.alt.rate).abs());
            d = d.max((a.angle.mu - b.angle.mu).abs());
            d = d.max((a.angle.kappa - b.angle.kappa).abs());
        }
        d
    }
}

/// Fit state carried across EM iterations.
pub struct ModelParamState {
    pub model: ModelParameters,
    pub last_model: ModelParameters,
    pub finish_fit: bool,
    pub iiter: usize,
}

impl ModelParamState {
    pub fn new(model: ModelParameters) -> Self {
        let last_model = model.clone();
        Self {
            model,
            last_model,
            finish_fit: false,
            iiter: 0,
        }
    }
    pub fn is_fit_finished(&self) -> bool {
        self.finish_fit
    }
}

/// Per-trip working variables, reused across trips and iterations.
pub struct PerTripVariables {
    /// Forward variable matrix (scaled): nstates x nobs
    pub alpha: Matrix<f64>,
    /// Backward variable matrix (scaled): nstates x nobs
    pub beta: Matrix<f64>,
    /// Viterbi best-score matrix (log scale): nstates x nobs
    pub phi: Matrix<f64>,
    /// Viterbi backpointers: nstates x nobs
    pub psi: Matrix<u8>,
    /// decoded state per observation
    pub traj: Vec<u8>,
    /// forward scale factors; sum of their logs is the trip log-likelihood
    pub scale: Vec<f64>,
}

impl Default for PerTripVariables {
    fn default() -> Self {
        Self::new()
    }
}

impl PerTripVariables {
    pub fn new() -> Self {
        Self {
            alpha: Matrix::from_shape(0, 0, 0.0),
            beta: Matrix::from_shape(0, 0, 0.0),
            phi: Matrix::from_shape(0, 0, 0.0),
            psi: Matrix::from_shape(0, 0, 0),
            traj: vec![],
            scale: vec![],
        }
    }

    pub fn resize_and_clear(&mut self, n_states: usize, nobs: usize) {
        self.alpha.resize_and_clear(n_states, nobs, 0.0);
        self.beta.resize_and_clear(n_states, nobs, 0.0);
        self.phi.resize_and_clear(n_states, nobs, 0.0);
        self.psi.resize_and_clear(n_states, nobs, 0);
        self.traj.clear();
        self.traj.resize(nobs, 0);
        self.scale.clear();
        self.scale.resize(nobs, 0.0);
    }
}

/// EM sufficient statistics accumulated over trips within one iteration.
/// `merge` lets rayon reduce per-trip contributions.
#[derive(Debug, Clone)]
pub struct RunningStats {
    pub loglik: f64,
    /// per-state posterior weight and weighted sums for step length
    pub w_step: Vec<f64>,
    pub s_step: Vec<f64>,
    pub ss_step: Vec<f64>,
    /// per-state posterior weight and weighted sums for altitude
    pub w_alt: Vec<f64>,
    pub s_alt: Vec<f64>,
    pub ss_alt: Vec<f64>,
    /// per-state posterior weight and circular sums for turning angle
    pub w_ang: Vec<f64>,
    pub s_cos: Vec<f64>,
    pub s_sin: Vec<f64>,
    /// xi sums (n x n, row-major) and gamma sums over t < T-1
    pub trans_num: Vec<f64>,
    pub trans_den: Vec<f64>,
    /// gamma at the first observation of each trip
    pub pi_acc: Vec<f64>,
    pub ntrips: usize,
}

impl RunningStats {
    pub fn new(n_states: usize) -> Self {
        Self {
            loglik: 0.0,
            w_step: vec![0.0; n_states],
            s_step: vec![0.0; n_states],
            ss_step: vec![0.0; n_states],
            w_alt: vec![0.0; n_states],
            s_alt: vec![0.0; n_states],
            ss_alt: vec![0.0; n_states],
            w_ang: vec![0.0; n_states],
            s_cos: vec![0.0; n_states],
            s_sin: vec![0.0; n_states],
            trans_num: vec![0.0; n_states * n_states],
            trans_den: vec![0.0; n_states],
            pi_acc: vec![0.0; n_states],
            ntrips: 0,
        }
    }

    pub fn merge(mut self, other: Self) -> Self {
        fn addv(a: &mut [f64], b: &[f64]) {
            for (x, y) in a.iter_mut().zip(b.iter()) {
                *x += y;
            }
        }
        self.loglik += other.loglik;
        addv(&mut self.w_step, &other.w_step);
        addv(&mut self.s_step, &other.s_step);
        addv(&mut self.ss_step, &other.ss_step);
        addv(&mut self.w_alt, &other.w_alt);
        addv(&mut self.s_alt, &other.s_alt);
        addv(&mut self.ss_alt, &other.ss_alt);
        addv(&mut self.w_ang, &other.w_ang);
        addv(&mut self.s_cos, &other.s_cos);
        addv(&mut self.s_sin, &other.s_sin);
        addv(&mut self.trans_num, &other.trans_num);
        addv(&mut self.trans_den, &other.trans_den);
        addv(&mut self.pi_acc, &other.pi_acc);
        self.ntrips += other.ntrips;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StreamInit;

    fn init(step_mean: f64) -> StateInit {
        StateInit {
            step: StreamInit {
                shape: 2.0,
                rate: 2.0 / step_mean,
            },
            alt: StreamInit {
                shape: 1.5,
                rate: 0.5,
            },
            n_members: 10,
        }
    }

    #[test]
    fn from_inits_builds_stochastic_matrices() {
        let m = ModelParameters::from_inits(&[init(10.0), init(100.0), init(1000.0)]);
        assert_eq!(m.n_states(), 3);
        assert!((m.pi.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        for i in 0..3 {
            let row: f64 = (0..3).map(|j| m.trans_at(i, j)).sum();
            assert!((row - 1.0).abs() < 1e-12);
            assert!(m.trans_at(i, i) > m.trans_at(i, (i + 1) % 3));
        }
    }

    #[test]
    fn single_state_transition_row_is_stochastic() {
        let m = ModelParameters::from_inits(&[init(10.0)]);
        assert_eq!(m.n_states(), 1);
        assert_eq!(m.trans_at(0, 0), 1.0);
        assert_eq!(m.pi, vec![1.0]);
    }

    #[test]
    fn missing_streams_contribute_nothing() {
        let m = ModelParameters::from_inits(&[init(10.0)]);
        let s = &m.states[0];
        let full = s.log_emission(8.0, 0.3, 12.0);
        let no_alt = s.log_emission(8.0, 0.3, f64::NAN);
        let none = s.log_emission(f64::NAN, f64::NAN, f64::NAN);
        assert!(full.is_finite());
        assert!(no_alt.is_finite());
        assert_eq!(none, 0.0);
        assert!((no_alt + s.alt.logpdf(12.0) - full).abs() < 1e-12);
    }

    #[test]
    fn param_delta_reflects_changes() {
        let a = ModelParameters::from_inits(&[init(10.0), init(100.0)]);
        let mut b = a.clone();
        assert_eq!(a.max_abs_param_delta(&b), 0.0);
        b.states[1].angle.kappa += 0.25;
        assert!((a.max_abs_param_delta(&b) - 0.25).abs() < 1e-12);
    }
}
