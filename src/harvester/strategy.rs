//! Fetch strategy rotation
//!
//! The rotator cycles through the four query modes in a fixed order to
//! diversify what the API hands back; the keyword pool feeds the search
//! strategy a vocabulary drawn without replacement.

use std::collections::HashSet;
use std::fmt;

use rand::seq::SliceRandom;
use tracing::{debug, info};

/// API query modes, in rotation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    Category,
    Search,
    Collections,
    Random,
}

impl FetchStrategy {
    pub const ALL: [FetchStrategy; 4] = [
        FetchStrategy::Category,
        FetchStrategy::Search,
        FetchStrategy::Collections,
        FetchStrategy::Random,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStrategy::Category => "category",
            FetchStrategy::Search => "search",
            FetchStrategy::Collections => "collections",
            FetchStrategy::Random => "random",
        }
    }
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Round-robin over the fixed strategy order, with a forced skip for
/// stagnation recovery.
#[derive(Debug, Default)]
pub struct StrategyRotator {
    position: usize,
}

impl StrategyRotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The strategy for the next batch; advances the rotation.
    pub fn next(&mut self) -> FetchStrategy {
        let strategy = FetchStrategy::ALL[self.position % FetchStrategy::ALL.len()];
        self.position = (self.position + 1) % FetchStrategy::ALL.len();
        strategy
    }

    /// Skip the strategy that would have come next. Invoked when consecutive
    /// batches stop yielding new images.
    pub fn force_advance(&mut self) {
        let skipped = FetchStrategy::ALL[self.position % FetchStrategy::ALL.len()];
        self.position = (self.position + 1) % FetchStrategy::ALL.len();
        info!(skipped = %skipped, "Force-advanced strategy rotation");
    }
}

/// Search vocabulary drawn without replacement. When every keyword has been
/// used once the exhausted set resets and the cycle starts over. Duplicate
/// entries in the configured vocabulary collapse to one.
#[derive(Debug)]
pub struct KeywordPool {
    keywords: Vec<String>,
    used: HashSet<String>,
}

impl KeywordPool {
    pub fn new(keywords: Vec<String>) -> Self {
        let mut seen = HashSet::new();
        let keywords = keywords
            .into_iter()
            .filter(|keyword| seen.insert(keyword.clone()))
            .collect();

        Self {
            keywords,
            used: HashSet::new(),
        }
    }

    /// Draw a keyword not used in the current cycle, or None when the pool is
    /// empty altogether.
    pub fn next_keyword(&mut self) -> Option<String> {
        if self.keywords.is_empty() {
            return None;
        }

        if self.used.len() == self.keywords.len() {
            info!(
                pool_size = self.keywords.len(),
                "Keyword pool exhausted, resetting"
            );
            self.used.clear();
        }

        let remaining: Vec<&String> = self
            .keywords
            .iter()
            .filter(|keyword| !self.used.contains(*keyword))
            .collect();

        let drawn = remaining.choose(&mut rand::thread_rng()).map(|k| (*k).clone())?;
        self.used.insert(drawn.clone());
        debug!(keyword = %drawn, remaining = remaining.len() - 1, "Drew search keyword");
        Some(drawn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_wraps_in_declared_order() {
        let mut rotator = StrategyRotator::new();
        let first_cycle: Vec<FetchStrategy> = (0..4).map(|_| rotator.next()).collect();
        assert_eq!(first_cycle, FetchStrategy::ALL);
        // wraps back to the start
        assert_eq!(rotator.next(), FetchStrategy::Category);
    }

    #[test]
    fn force_advance_skips_one_strategy() {
        let mut rotator = StrategyRotator::new();
        assert_eq!(rotator.next(), FetchStrategy::Category);
        rotator.force_advance();
        assert_eq!(rotator.next(), FetchStrategy::Collections);
    }

    #[test]
    fn keywords_draw_without_replacement_then_reset() {
        let pool_words = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut pool = KeywordPool::new(pool_words.clone());

        let mut first_cycle = HashSet::new();
        for _ in 0..3 {
            assert!(first_cycle.insert(pool.next_keyword().unwrap()));
        }
        assert_eq!(first_cycle.len(), 3);

        // fourth draw starts a fresh cycle instead of running dry
        let after_reset = pool.next_keyword().unwrap();
        assert!(pool_words.contains(&after_reset));
    }

    #[test]
    fn empty_pool_yields_nothing() {
        let mut pool = KeywordPool::new(Vec::new());
        assert_eq!(pool.next_keyword(), None);
    }

    #[test]
    fn duplicate_keywords_collapse_and_still_cycle() {
        let mut pool = KeywordPool::new(vec![
            "sunset".to_string(),
            "sunset".to_string(),
            "ocean".to_string(),
        ]);

        let mut first_cycle = HashSet::new();
        for _ in 0..2 {
            assert!(first_cycle.insert(pool.next_keyword().unwrap()));
        }
        assert_eq!(first_cycle.len(), 2);

        // the third draw starts a fresh cycle instead of running dry
        assert!(pool.next_keyword().is_some());
    }
}
