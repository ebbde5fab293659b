use anyhow::Result;

use crate::dqn::DqnAgent;
use crate::env::{Action, TrafficEnv, TrafficSim};

pub struct EvalStats {
    pub avg_total_wait: f64,
    pub final_total_wait: f64,
    pub decisions: u64,
    pub steps: u64,
}

/// Greedy rollout: always the argmax phase, same minimum-green gating, no
/// exploration and no learning.
pub fn run_eval<S: TrafficSim>(
    agent: &DqnAgent,
    env: &mut TrafficEnv<S>,
    steps: u64,
) -> Result<EvalStats> {
    let mut phase_timer = 0u32;
    let mut decisions = 0u64;
    let mut wait_sum = 0.0f64;
    let mut last_wait = 0.0f64;

    for step in 0..steps {
        env.step()?;
        let spawn_period = env.env_config.spawn_period;
        if spawn_period > 0 && step % spawn_period == 0 {
            env.spawn_demand()?;
        }

        if phase_timer >= env.env_config.min_green {
            let state = env.encode_state()?;
            let q_vals = agent.q_values(&state)?;
            let (action_idx, _) = q_vals
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .unwrap();
            env.apply_action(Action::from_index(action_idx))?;
            phase_timer = 0;
            decisions += 1;
        }
        phase_timer += 1;

        last_wait = env.total_waiting_time()?;
        wait_sum += last_wait;
    }
    env.close();

    Ok(EvalStats {
        avg_total_wait: wait_sum / steps.max(1) as f64,
        final_total_wait: last_wait,
        decisions,
        steps,
    })
}
