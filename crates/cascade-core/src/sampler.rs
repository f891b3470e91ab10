//! Balanced foreground/background resampling for training stages

use crate::error::{CascadeError, Result};
use crate::matcher::Assignment;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Number of candidates kept per image
    pub batch_size_per_image: usize,
    /// Upper bound on the foreground share of the batch (0.0-1.0)
    pub foreground_fraction: f32,
    /// Background candidates with overlap below this are left out of the pool
    pub background_floor: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            batch_size_per_image: 512,
            foreground_fraction: 0.25,
            background_floor: 0.0,
        }
    }
}

impl SamplingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size_per_image == 0 {
            return Err(CascadeError::Config(
                "batch_size_per_image must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.foreground_fraction) {
            return Err(CascadeError::Config(format!(
                "foreground_fraction must be in [0, 1], got {}",
                self.foreground_fraction
            )));
        }
        if !(0.0..=1.0).contains(&self.background_floor) {
            return Err(CascadeError::Config(format!(
                "background_floor must be in [0, 1], got {}",
                self.background_floor
            )));
        }
        Ok(())
    }
}

/// Indices into the stage's candidate list, foreground first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampledIndices {
    pub foreground: Vec<usize>,
    pub background: Vec<usize>,
}

impl SampledIndices {
    #[must_use]
    pub fn len(&self) -> usize {
        self.foreground.len() + self.background.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.foreground.iter().chain(self.background.iter()).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageResampler {
    config: SamplingConfig,
}

impl StageResampler {
    pub fn new(config: SamplingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Maximum foreground count per image
    #[must_use]
    pub fn foreground_quota(&self) -> usize {
        (self.config.foreground_fraction * self.config.batch_size_per_image as f32).floor() as usize
    }

    /// Sample without replacement
    ///
    /// Foreground is capped by the quota and by availability; background fills
    /// the rest of the batch. Each returned list is sorted ascending.
    pub fn sample<R: Rng + ?Sized>(&self, assignments: &[Assignment], rng: &mut R) -> SampledIndices {
        let mut fg_pool = Vec::new();
        let mut bg_pool = Vec::new();
        for (i, a) in assignments.iter().enumerate() {
            if a.is_foreground() {
                fg_pool.push(i);
            } else if a.overlap() >= self.config.background_floor {
                bg_pool.push(i);
            }
        }

        let fg_take = self.foreground_quota().min(fg_pool.len());
        let bg_take = (self.config.batch_size_per_image - fg_take).min(bg_pool.len());

        SampledIndices {
            foreground: choose(&fg_pool, fg_take, rng),
            background: choose(&bg_pool, bg_take, rng),
        }
    }
}

fn choose<R: Rng + ?Sized>(pool: &[usize], amount: usize, rng: &mut R) -> Vec<usize> {
    if amount >= pool.len() {
        return pool.to_vec();
    }
    let mut picked: Vec<usize> = rand::seq::index::sample(rng, pool.len(), amount)
        .into_iter()
        .map(|i| pool[i])
        .collect();
    picked.sort_unstable();
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fg(overlap: f32) -> Assignment {
        Assignment::Foreground {
            gt_index: 0,
            class_id: 1,
            overlap,
        }
    }

    fn bg(overlap: f32) -> Assignment {
        Assignment::Background {
            gt_index: Some(0),
            overlap,
        }
    }

    fn resampler(batch: usize, fraction: f32) -> StageResampler {
        StageResampler::new(SamplingConfig {
            batch_size_per_image: batch,
            foreground_fraction: fraction,
            background_floor: 0.0,
        })
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        let mut config = SamplingConfig::default();
        assert!(config.validate().is_ok());
        config.foreground_fraction = 1.5;
        assert!(config.validate().is_err());
        config.foreground_fraction = 0.25;
        config.batch_size_per_image = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quota() {
        assert_eq!(resampler(512, 0.25).foreground_quota(), 128);
        assert_eq!(resampler(10, 0.25).foreground_quota(), 2);
    }

    #[test]
    fn test_takes_all_when_pool_is_small() {
        let assignments = vec![fg(0.8), bg(0.1), bg(0.2), fg(0.6)];
        let mut rng = StdRng::seed_from_u64(7);
        let s = resampler(512, 0.25).sample(&assignments, &mut rng);
        assert_eq!(s.foreground, vec![0, 3]);
        assert_eq!(s.background, vec![1, 2]);
    }

    #[test]
    fn test_foreground_capped_by_quota() {
        let assignments: Vec<_> = (0..20).map(|_| fg(0.9)).chain((0..20).map(|_| bg(0.1))).collect();
        let mut rng = StdRng::seed_from_u64(1);
        let s = resampler(16, 0.25).sample(&assignments, &mut rng);
        assert_eq!(s.foreground.len(), 4);
        assert_eq!(s.background.len(), 12);
        assert!(s.foreground.iter().all(|&i| i < 20));
        assert!(s.background.iter().all(|&i| i >= 20));
    }

    #[test]
    fn test_background_backfills_missing_foreground() {
        let assignments: Vec<_> = std::iter::once(fg(0.7)).chain((0..30).map(|_| bg(0.0))).collect();
        let mut rng = StdRng::seed_from_u64(3);
        let s = resampler(16, 0.5).sample(&assignments, &mut rng);
        assert_eq!(s.foreground, vec![0]);
        assert_eq!(s.background.len(), 15);
    }

    #[test]
    fn test_no_duplicates() {
        let assignments: Vec<_> = (0..100).map(|_| bg(0.3)).collect();
        let mut rng = StdRng::seed_from_u64(11);
        let s = resampler(40, 0.25).sample(&assignments, &mut rng);
        let mut seen = s.background.clone();
        seen.dedup();
        assert_eq!(seen.len(), 40);
    }

    #[test]
    fn test_same_seed_same_sample() {
        let assignments: Vec<_> = (0..50).map(|i| if i % 3 == 0 { fg(0.8) } else { bg(0.2) }).collect();
        let r = resampler(12, 0.25);
        let a = r.sample(&assignments, &mut StdRng::seed_from_u64(99));
        let b = r.sample(&assignments, &mut StdRng::seed_from_u64(99));
        assert_eq!(a, b);
    }

    #[test]
    fn test_background_floor_excludes_easy_negatives() {
        let r = StageResampler::new(SamplingConfig {
            batch_size_per_image: 8,
            foreground_fraction: 0.25,
            background_floor: 0.1,
        })
        .unwrap();
        let assignments = vec![bg(0.0), bg(0.05), bg(0.2), bg(0.4)];
        let s = r.sample(&assignments, &mut StdRng::seed_from_u64(0));
        assert_eq!(s.background, vec![2, 3]);
    }

    #[test]
    fn test_iter_order() {
        let s = SampledIndices {
            foreground: vec![4, 9],
            background: vec![1],
        };
        assert_eq!(s.iter().collect::<Vec<_>>(), vec![4, 9, 1]);
        assert_eq!(s.len(), 3);
    }
}
