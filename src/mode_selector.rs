use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationMode {
    /// Say/Gather turns driven by call-control documents.
    Traditional,
    /// Media stream bridged to the realtime assistant.
    Realtime,
}

impl fmt::Display for ConversationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationMode::Traditional => f.write_str("traditional"),
            ConversationMode::Realtime => f.write_str("realtime"),
        }
    }
}

impl FromStr for ConversationMode {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "traditional" | "turn" | "turn-based" => Ok(ConversationMode::Traditional),
            "realtime" => Ok(ConversationMode::Realtime),
            other => Err(CallError::InvalidConfiguration(format!(
                "unknown conversation mode: {}",
                other
            ))),
        }
    }
}

/// Uniform samples in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    fn sample(&self) -> f64;
}

pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn sample(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Always returns the same sample.
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn sample(&self) -> f64 {
        self.0
    }
}

pub struct ModeSelector {
    probability: RwLock<f64>,
    random: Box<dyn RandomSource>,
}

impl ModeSelector {
    pub fn new(probability: f64) -> Result<Self, CallError> {
        Self::with_random(probability, Box::new(ThreadRandom))
    }

    pub fn with_random(probability: f64, random: Box<dyn RandomSource>) -> Result<Self, CallError> {
        validate_probability(probability)?;
        Ok(Self {
            probability: RwLock::new(probability),
            random,
        })
    }

    /// Realtime iff one fresh sample is strictly below the current probability.
    pub fn choose_mode(&self) -> ConversationMode {
        let probability = *self.probability.read();
        let sample = self.random.sample();
        let mode = if sample < probability {
            ConversationMode::Realtime
        } else {
            ConversationMode::Traditional
        };
        log::debug!("Mode draw {:.3} against p={:.3} -> {}", sample, probability, mode);
        mode
    }

    pub fn get_probability(&self) -> f64 {
        *self.probability.read()
    }

    /// Applies to calls orchestrated after this returns.
    pub fn set_probability(&self, probability: f64) -> Result<(), CallError> {
        validate_probability(probability)?;
        *self.probability.write() = probability;
        log::info!("Realtime probability set to {}", probability);
        Ok(())
    }
}

fn validate_probability(probability: f64) -> Result<(), CallError> {
    // NaN 也会在这里被拒绝
    if (0.0..=1.0).contains(&probability) {
        Ok(())
    } else {
        Err(CallError::InvalidConfiguration(format!(
            "probability {} outside [0, 1]",
            probability
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probability_round_trips_exactly() {
        let selector = ModeSelector::new(0.5).unwrap();
        for p in [0.0, 0.1, 0.3333333333333333, 0.5, 0.99, 1.0] {
            selector.set_probability(p).unwrap();
            assert_eq!(selector.get_probability(), p);
        }
    }

    #[test]
    fn out_of_range_probability_leaves_value_unchanged() {
        let selector = ModeSelector::new(0.4).unwrap();
        for p in [-0.1, 1.01, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                selector.set_probability(p),
                Err(CallError::InvalidConfiguration(_))
            ));
            assert_eq!(selector.get_probability(), 0.4);
        }
        assert!(ModeSelector::new(2.0).is_err());
    }

    #[test]
    fn strict_less_than_tie_break() {
        let selector = ModeSelector::with_random(0.5, Box::new(FixedRandom(0.49))).unwrap();
        assert_eq!(selector.choose_mode(), ConversationMode::Realtime);

        selector.set_probability(0.49).unwrap();
        assert_eq!(selector.choose_mode(), ConversationMode::Traditional);
    }

    #[test]
    fn extremes_are_deterministic() {
        let never = ModeSelector::with_random(0.0, Box::new(FixedRandom(0.0))).unwrap();
        assert_eq!(never.choose_mode(), ConversationMode::Traditional);

        let always = ModeSelector::with_random(1.0, Box::new(FixedRandom(0.999_999))).unwrap();
        assert_eq!(always.choose_mode(), ConversationMode::Realtime);
    }

    #[test]
    fn modes_parse_and_serialize() {
        assert_eq!("Realtime".parse::<ConversationMode>().unwrap(), ConversationMode::Realtime);
        assert_eq!(
            "traditional".parse::<ConversationMode>().unwrap(),
            ConversationMode::Traditional
        );
        assert!("video".parse::<ConversationMode>().is_err());
        assert_eq!(
            serde_json::to_string(&ConversationMode::Realtime).unwrap(),
            "\"realtime\""
        );
    }
}
