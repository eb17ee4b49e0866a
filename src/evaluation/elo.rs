//! Elo ratings from pairwise outcomes.

use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use super::{PairwiseOutcome, Winner};

pub const BASE_RATING: f64 = 1500.0;
pub const K_FACTOR: f64 = 32.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EloRating {
    pub rating: f64,
    pub games: u32,
    pub wins: u32,
    pub losses: u32,
    pub ties: u32,
}

impl Default for EloRating {
    fn default() -> Self {
        Self {
            rating: BASE_RATING,
            games: 0,
            wins: 0,
            losses: 0,
            ties: 0,
        }
    }
}

/// Logistic expected score of a player rated `rating` against `opponent`.
pub fn expected_score(rating: f64, opponent: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((opponent - rating) / 400.0))
}

#[derive(Debug, Clone)]
pub struct EloRanker {
    k: f64,
    base: f64,
    ratings: BTreeMap<String, EloRating>,
}

impl Default for EloRanker {
    fn default() -> Self {
        Self::new()
    }
}

impl EloRanker {
    pub fn new() -> Self {
        Self::with_params(K_FACTOR, BASE_RATING)
    }

    pub fn with_params(k: f64, base: f64) -> Self {
        Self {
            k,
            base,
            ratings: BTreeMap::new(),
        }
    }

    /// Ensures `document_id` has a rating, starting at the base rating.
    pub fn register(&mut self, document_id: &str) {
        let base = self.base;
        self.ratings
            .entry(document_id.to_string())
            .or_insert_with(|| EloRating {
                rating: base,
                ..EloRating::default()
            });
    }

    pub fn rating(&self, document_id: &str) -> Option<EloRating> {
        self.ratings.get(document_id).copied()
    }

    /// Applies one outcome and returns both sides' rating deltas.
    pub fn apply(&mut self, outcome: &PairwiseOutcome) -> (f64, f64) {
        self.record(&outcome.document_a, &outcome.document_b, outcome.winner)
    }

    pub fn record(&mut self, a: &str, b: &str, winner: Winner) -> (f64, f64) {
        self.register(a);
        self.register(b);
        let rating_a = self.ratings[a].rating;
        let rating_b = self.ratings[b].rating;

        let (score_a, score_b) = match winner {
            Winner::A => (1.0, 0.0),
            Winner::B => (0.0, 1.0),
            Winner::Tie => (0.5, 0.5),
        };
        let delta_a = self.k * (score_a - expected_score(rating_a, rating_b));
        let delta_b = self.k * (score_b - expected_score(rating_b, rating_a));

        for (id, delta, score) in [(a, delta_a, score_a), (b, delta_b, score_b)] {
            if let Some(entry) = self.ratings.get_mut(id) {
                entry.rating += delta;
                entry.games += 1;
                match score {
                    s if s > 0.5 => entry.wins += 1,
                    s if s < 0.5 => entry.losses += 1,
                    _ => entry.ties += 1,
                }
            }
        }
        (delta_a, delta_b)
    }

    /// Documents ordered by rating, highest first. Equal ratings are ordered
    /// by document id.
    pub fn ranking(&self) -> Vec<(String, EloRating)> {
        let mut ranked: Vec<(String, EloRating)> = self
            .ratings
            .iter()
            .map(|(id, rating)| (id.clone(), *rating))
            .collect();
        ranked.sort_by(|(id_a, a), (id_b, b)| {
            OrderedFloat(b.rating)
                .cmp(&OrderedFloat(a.rating))
                .then_with(|| id_a.cmp(id_b))
        });
        ranked
    }

    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }
}
