//! Predictive coordinator: sizes allocations for the expected final
//! sequence length so decode growth does not re-allocate every step.
//!
//! Two signals feed the prediction:
//! - A bounded history of observed completion lengths
//! - An exponential moving average of prompt lengths, used while the
//!   history is still empty

use std::collections::VecDeque;

use tracing::debug;

use crate::cache::block::BlockId;
use crate::cache::coordinator::{CoordinatorError, KvCacheCoordinator};
use crate::config::AllocationConfig;

/// EMA weight kept from the previous average.
const EMA_DECAY: f64 = 0.9;

pub struct PredictiveCoordinator {
    inner: KvCacheCoordinator,
    history: VecDeque<usize>,
    history_capacity: usize,
    history_trim_to: usize,
    average_length: f64,
    max_predicted_tokens: usize,
}

impl PredictiveCoordinator {
    pub fn new(inner: KvCacheCoordinator, config: &AllocationConfig) -> Self {
        Self {
            inner,
            history: VecDeque::with_capacity(config.history_capacity),
            history_capacity: config.history_capacity,
            history_trim_to: config.history_trim_to,
            average_length: config.initial_average_length,
            max_predicted_tokens: config.max_predicted_tokens,
        }
    }

    /// Record how many tokens a finished request generated.
    pub fn record_completion(&mut self, completion_tokens: usize) {
        self.history.push_back(completion_tokens);
        if self.history.len() > self.history_capacity {
            let excess = self.history.len() - self.history_trim_to;
            self.history.drain(..excess);
        }
    }

    /// Expected completion length from history, if any.
    fn mean_completion(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        Some(self.history.iter().sum::<usize>() as f64 / self.history.len() as f64)
    }

    /// Predict the final length of a request whose prompt is
    /// `prompt_tokens` long. Also folds the prompt into the moving average.
    pub fn predict_length(&mut self, prompt_tokens: usize) -> usize {
        self.average_length =
            EMA_DECAY * self.average_length + (1.0 - EMA_DECAY) * prompt_tokens as f64;

        let expected_completion = self.mean_completion().unwrap_or(self.average_length);
        let predicted = prompt_tokens + expected_completion.round() as usize;
        predicted.min(self.max_predicted_tokens).max(prompt_tokens)
    }

    /// Allocate for `max(tokens, predicted)`. If the pool cannot cover the
    /// prediction, fall back to exactly `tokens` before giving up.
    pub fn allocate_predictive(
        &mut self,
        request: &str,
        tokens: usize,
    ) -> Result<Vec<Vec<BlockId>>, CoordinatorError> {
        let predicted = self.predict_length(tokens);
        let target = tokens.max(predicted);
        match self.inner.allocate(request, target) {
            Ok(blocks) => Ok(blocks),
            Err(e) if e.is_out_of_blocks() && target > tokens => {
                debug!(request, tokens, predicted = target, "Prediction did not fit, allocating exact");
                self.inner.allocate(request, tokens)
            }
            Err(e) => Err(e),
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn average_length(&self) -> f64 {
        self.average_length
    }

    pub fn inner(&self) -> &KvCacheCoordinator {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut KvCacheCoordinator {
        &mut self.inner
    }
}
