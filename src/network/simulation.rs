//! Network fault injection for testing

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Loss and jitter applied to received packets before processing
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IssueSimulation {
    /// Probability in `[0, 1]` that a packet is silently dropped
    pub loss_rate: f64,
    /// Probability in `[0, 1]` that processing is delayed
    pub jitter_rate: f64,
    /// Upper bound of the uniformly drawn delay
    pub max_delay: Duration,
}

impl IssueSimulation {
    pub fn new(loss_rate: f64, jitter_rate: f64, max_delay: Duration) -> Self {
        Self {
            loss_rate: loss_rate.clamp(0.0, 1.0),
            jitter_rate: jitter_rate.clamp(0.0, 1.0),
            max_delay,
        }
    }

    pub fn is_active(&self) -> bool {
        self.loss_rate > 0.0 || self.jitter_rate > 0.0
    }
}

/// Fate of one packet under simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueDecision {
    Deliver,
    Drop,
    Delay(Duration),
}

/// Draws [`IssueDecision`]s from an [`IssueSimulation`]
#[derive(Debug)]
pub struct IssueSimulator {
    settings: IssueSimulation,
}

impl IssueSimulator {
    pub fn new(settings: IssueSimulation) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> IssueSimulation {
        self.settings
    }

    pub fn decide(&self) -> IssueDecision {
        let mut rng = rand::thread_rng();
        if self.settings.loss_rate > 0.0 && rng.gen_bool(self.settings.loss_rate) {
            return IssueDecision::Drop;
        }
        if self.settings.jitter_rate > 0.0 && rng.gen_bool(self.settings.jitter_rate) {
            let max_us = self.settings.max_delay.as_micros() as u64;
            return IssueDecision::Delay(Duration::from_micros(rng.gen_range(0..=max_us)));
        }
        IssueDecision::Deliver
    }
}
