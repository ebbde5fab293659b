use anyhow::Result;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::env::Action;

pub(crate) fn rng_from_seed(seed: Option<u64>) -> SmallRng {
    match seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_os_rng(),
    }
}

/// Epsilon-greedy action selector with a decaying exploration rate.
pub struct EpsilonGreedy {
    pub epsilon: f64,
    epsilon_min: f64,
    decay_rate: f64,
    rng: SmallRng,
}

impl EpsilonGreedy {
    pub fn new(epsilon: f64, epsilon_min: f64, decay_rate: f64, seed: Option<u64>) -> Self {
        Self {
            epsilon,
            epsilon_min,
            decay_rate,
            rng: rng_from_seed(seed),
        }
    }

    /// Explore with probability epsilon, otherwise exploit the argmax of the
    /// Q-values. `q_source` is evaluated only on the exploit branch, so a
    /// fully exploring policy never touches the approximator.
    pub fn select<Q>(&mut self, q_source: Q) -> Result<usize>
    where
        Q: FnOnce() -> Result<Vec<f32>>,
    {
        if self.rng.random::<f64>() < self.epsilon {
            return Ok(self.rng.random_range(0..Action::COUNT));
        }
        let q = q_source()?;
        Ok(argmax(&q))
    }

    /// Multiplicative decay with a floor, applied once per decision point.
    pub fn decay(&mut self) {
        self.epsilon = (self.epsilon * self.decay_rate).max(self.epsilon_min);
    }
}

/// Index of the largest value; ties resolve to the lowest index.
fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate().skip(1) {
        if *v > values[best] {
            best = i;
        }
    }
    best
}
