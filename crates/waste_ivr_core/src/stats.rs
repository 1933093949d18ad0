//! crates/waste_ivr_core/src/stats.rs
//!
//! Aggregate figures over the live call sessions, served by the admin API.

use std::collections::{BTreeMap, HashMap};

use crate::domain::{CallSession, Rating};

/// Number of identifiers kept in [`CallStats::top_identifiers`].
pub const TOP_IDENTIFIERS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct RatingBucket {
    pub rating: u8,
    pub label: &'static str,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallStats {
    pub total_calls: usize,
    /// Calls whose caller answered every question.
    pub finished_calls: usize,
    /// Platform status (`completed`, `busy`, ...) to number of calls.
    pub status_totals: BTreeMap<String, usize>,
    pub average_duration_secs: Option<f64>,
    pub average_rating: Option<f64>,
    /// One bucket per rating value, lowest first, including empty ones.
    pub rating_distribution: Vec<RatingBucket>,
    /// Language name to number of calls.
    pub language_distribution: BTreeMap<String, usize>,
    /// Most frequently entered identifiers, busiest first.
    pub top_identifiers: Vec<(String, usize)>,
}

impl CallStats {
    pub fn from_sessions(sessions: &[CallSession]) -> Self {
        let mut stats = CallStats {
            total_calls: sessions.len(),
            ..Default::default()
        };
        let mut ratings = [0usize; Rating::MAX as usize];
        let mut duration_sum: u64 = 0;
        let mut timed: u32 = 0;
        let mut identifiers: HashMap<&str, usize> = HashMap::new();

        for session in sessions {
            if session.step.is_finished() {
                stats.finished_calls += 1;
            }
            *stats
                .status_totals
                .entry(session.status.as_str().to_string())
                .or_default() += 1;
            if let Some(duration) = session.duration_secs {
                duration_sum += u64::from(duration);
                timed += 1;
            }
            if let Some(rating) = session.rating {
                ratings[usize::from(rating.value() - Rating::MIN)] += 1;
            }
            if let Some(language) = session.language {
                *stats
                    .language_distribution
                    .entry(language.name().to_string())
                    .or_default() += 1;
            }
            if let Some(identifier) = session.service_identifier.as_deref() {
                *identifiers.entry(identifier).or_default() += 1;
            }
        }

        if timed > 0 {
            stats.average_duration_secs = Some(duration_sum as f64 / f64::from(timed));
        }

        let rated: usize = ratings.iter().sum();
        if rated > 0 {
            let weighted: usize = ratings
                .iter()
                .enumerate()
                .map(|(i, count)| (i + 1) * count)
                .sum();
            stats.average_rating = Some(weighted as f64 / rated as f64);
        }
        stats.rating_distribution = (Rating::MIN..=Rating::MAX)
            .filter_map(Rating::new)
            .map(|rating| RatingBucket {
                rating: rating.value(),
                label: rating.label(),
                count: ratings[usize::from(rating.value() - Rating::MIN)],
            })
            .collect();

        let mut top: Vec<(String, usize)> = identifiers
            .into_iter()
            .map(|(id, count)| (id.to_string(), count))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(TOP_IDENTIFIERS);
        stats.top_identifiers = top;

        stats
    }

    pub fn in_flight(&self) -> usize {
        self.total_calls - self.finished_calls
    }
}
