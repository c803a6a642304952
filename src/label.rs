//! Heuristic behavioral labels for fitted states.
//!
//! The fit itself is label-free; names are attached afterwards from the
//! fitted emission parameters: frigatebirds at rest barely move (smallest
//! mean step), soaring birds sit high (largest mean altitude), and flapping
//! flight is what remains.

use serde::Serialize;

use crate::model::ModelParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Behavior {
    Rest,
    Flap,
    Soar,
    /// extra states beyond the canonical three, numbered by step-mean rank
    Other(u8),
}

impl Behavior {
    pub fn name(&self) -> String {
        match self {
            Behavior::Rest => "rest".to_string(),
            Behavior::Flap => "flap".to_string(),
            Behavior::Soar => "soar".to_string(),
            Behavior::Other(k) => format!("state{k}"),
        }
    }
}

/// Map each fitted state index to a behavior label.
///
/// Rules, applied in order:
/// 1. the state with the smallest mean step length is `Rest`;
/// 2. of the remaining states, the one with the largest mean altitude is
///    `Soar`;
/// 3. the remaining state with the smallest step mean is `Flap`; any further
///    states are `Other(k)` in step-mean order.
pub fn label_states(model: &ModelParameters) -> Vec<Behavior> {
    let n = model.n_states();
    let mut labels = vec![Behavior::Other(0); n];
    if n == 0 {
        return labels;
    }

    let step_mean: Vec<f64> = model.states.iter().map(|s| s.step.mean()).collect();
    let alt_mean: Vec<f64> = model.states.iter().map(|s| s.alt.mean()).collect();

    let rest = argmin(&step_mean);
    labels[rest] = Behavior::Rest;
    if n == 1 {
        return labels;
    }

    let soar = alt_mean
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != rest)
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0);
    labels[soar] = Behavior::Soar;

    // remaining states, by ascending step mean: flap first, then numbered
    let mut remaining: Vec<usize> = (0..n).filter(|&i| i != rest && i != soar).collect();
    remaining.sort_by(|&a, &b| {
        step_mean[a]
            .partial_cmp(&step_mean[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for (rank, &i) in remaining.iter().enumerate() {
        labels[i] = if rank == 0 {
            Behavior::Flap
        } else {
            Behavior::Other(rank as u8 + 3)
        };
    }
    labels
}

fn argmin(xs: &[f64]) -> usize {
    let mut best = 0;
    for (i, x) in xs.iter().enumerate() {
        if *x < xs[best] {
            best = i;
        }
    }
    best
}
