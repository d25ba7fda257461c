//! Context budget tracking.
//!
//! Token counts are estimated from prompt length only (`ceil(chars /
//! chars_per_token)`), so the estimate is deterministic and needs no
//! tokenizer. The percentage of `max_tokens` maps onto four ascending levels.

use chrono::{DateTime, Utc};
use senseloop_config::ContextConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Threads whose trend is kept at once; the stalest thread is evicted first.
const DEFAULT_MAX_THREADS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextLevel {
    Green,
    Yellow,
    Orange,
    Red,
}

impl ContextLevel {
    pub fn warning(self) -> Option<&'static str> {
        match self {
            Self::Green => None,
            Self::Yellow => Some("context is filling up"),
            Self::Orange => Some("context is nearly full; wrap up the current task"),
            Self::Red => Some("context exhausted; hand off to a fresh session"),
        }
    }

    /// Only the highest level asks for a handoff.
    pub fn should_handoff(self) -> bool {
        self == Self::Red
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Orange => "orange",
            Self::Red => "red",
        }
    }
}

impl fmt::Display for ContextLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextMetrics {
    pub estimated_tokens: usize,
    /// Fraction of the budget in use, clamped to `[0, 1]`.
    pub percentage: f64,
    pub level: ContextLevel,
    pub warning: Option<&'static str>,
    pub should_handoff: bool,
    /// Only set when recent measurements for the thread show growth.
    pub estimated_time_to_full: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    percentage: f64,
    at: DateTime<Utc>,
}

pub struct ContextTracker {
    config: ContextConfig,
    max_threads: usize,
    history: Mutex<HashMap<String, VecDeque<Sample>>>,
}

impl ContextTracker {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            max_threads: DEFAULT_MAX_THREADS,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads.max(1);
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn estimate_tokens(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.config.chars_per_token.max(1))
    }

    pub fn level_for(&self, percentage: f64) -> ContextLevel {
        if percentage >= self.config.red_threshold {
            ContextLevel::Red
        } else if percentage >= self.config.orange_threshold {
            ContextLevel::Orange
        } else if percentage >= self.config.yellow_threshold {
            ContextLevel::Yellow
        } else {
            ContextLevel::Green
        }
    }

    /// Score a prompt without touching any thread's history.
    pub fn calculate_metrics(&self, prompt: &str) -> ContextMetrics {
        let estimated_tokens = self.estimate_tokens(prompt);
        let percentage = if self.config.max_tokens == 0 {
            1.0
        } else {
            (estimated_tokens as f64 / self.config.max_tokens as f64).clamp(0.0, 1.0)
        };
        let level = self.level_for(percentage);
        ContextMetrics {
            estimated_tokens,
            percentage,
            level,
            warning: level.warning(),
            should_handoff: level.should_handoff(),
            estimated_time_to_full: None,
        }
    }

    pub fn record(&self, thread_id: &str, prompt: &str) -> ContextMetrics {
        self.record_at(thread_id, prompt, Utc::now())
    }

    /// Score a prompt and keep the measurement for the thread's trend.
    pub fn record_at(&self, thread_id: &str, prompt: &str, at: DateTime<Utc>) -> ContextMetrics {
        let mut metrics = self.calculate_metrics(prompt);
        let window = self.config.trend_window.max(2);

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if !history.contains_key(thread_id) && history.len() >= self.max_threads {
            evict_stalest(&mut history);
        }
        let samples = history.entry(thread_id.to_string()).or_default();
        samples.push_back(Sample {
            percentage: metrics.percentage,
            at,
        });
        while samples.len() > window {
            samples.pop_front();
        }
        metrics.estimated_time_to_full = time_to_full(samples);

        debug!(
            thread_id,
            tokens = metrics.estimated_tokens,
            percentage = metrics.percentage,
            level = %metrics.level,
            "Context measured"
        );
        metrics
    }

    /// Drop a thread's measurements, typically after a handoff.
    pub fn forget(&self, thread_id: &str) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(thread_id);
    }

    pub fn tracked_threads(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn samples(&self, thread_id: &str) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(thread_id)
            .map_or(0, VecDeque::len)
    }
}

fn evict_stalest(history: &mut HashMap<String, VecDeque<Sample>>) {
    let stalest = history
        .iter()
        .min_by_key(|(_, samples)| samples.back().map(|s| s.at))
        .map(|(thread, _)| thread.clone());
    if let Some(thread) = stalest {
        debug!(thread_id = %thread, "Evicting context trend");
        history.remove(&thread);
    }
}

/// Linear extrapolation between the oldest and newest sample in the window.
fn time_to_full(samples: &VecDeque<Sample>) -> Option<Duration> {
    let (first, last) = (samples.front()?, samples.back()?);
    let growth = last.percentage - first.percentage;
    let elapsed = (last.at - first.at).to_std().ok()?.as_secs_f64();
    if growth <= 0.0 || elapsed <= 0.0 {
        return None;
    }
    let rate = growth / elapsed;
    let remaining = (1.0 - last.percentage).max(0.0) / rate;
    Duration::try_from_secs_f64(remaining).ok()
}
