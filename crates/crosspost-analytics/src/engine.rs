//! Feedback engine: ranks publish hours and tags by engagement.
//!
//! Signals are derived from a snapshot of the metrics store, cached, and
//! recomputed whenever the store's write generation moves.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{MetricsStore, OutcomeRecord, RunStatus, StoreError};

/// Default smoothing constant for the `n / (n + k)` confidence factor.
pub const DEFAULT_SMOOTHING_K: f64 = 3.0;

/// Tuning for the feedback engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Smoothing constant `k`; larger values distrust small samples more.
    pub smoothing_k: f64,
    /// Timezone used to bucket publish times into hours.
    pub reporting_timezone: Tz,
    /// Below this many ranked records no time slots are suggested.
    pub min_ranked_records: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            smoothing_k: DEFAULT_SMOOTHING_K,
            reporting_timezone: Tz::UTC,
            min_ranked_records: 0,
        }
    }
}

/// A ranked hour-of-day bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSlot {
    /// Hour of day in the reporting timezone (0-23).
    pub hour: u32,
    /// Mean engagement rate weighted by sample confidence.
    pub score: f64,
    /// Unweighted mean engagement rate (percent).
    pub mean_rate: f64,
    pub samples: usize,
}

impl TimeSlot {
    /// The slot as a `HH:MM` time of day, suitable for a recurring schedule.
    pub fn time_of_day(&self) -> String {
        format!("{:02}:00", self.hour)
    }
}

/// A ranked tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagScore {
    pub tag: String,
    pub score: f64,
    pub mean_rate: f64,
    pub samples: usize,
}

/// Run outcome counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTally {
    pub published: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Aggregate snapshot over all outcome records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_posts: usize,
    /// Posts with at least one view, i.e. those that take part in rankings.
    pub ranked_posts: usize,
    pub total_likes: u64,
    pub total_comments: u64,
    pub total_views: u64,
    /// Likes plus comments across all posts.
    pub total_engagement: u64,
    /// Mean engagement rate (percent) over ranked posts.
    pub mean_engagement_rate: f64,
    pub avg_likes_per_post: f64,
    pub avg_comments_per_post: f64,
    pub avg_views_per_post: f64,
    pub runs: RunTally,
}

/// Full dump of analytics data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Export {
    pub statistics: Statistics,
    pub posts: Vec<OutcomeRecord>,
    pub exported_at: DateTime<Utc>,
}

/// Both rankings, fully sorted.
#[derive(Debug)]
struct Signals {
    time_slots: Vec<TimeSlot>,
    tags: Vec<TagScore>,
}

/// Ranked group produced by [`rank`].
struct Ranked<K> {
    key: K,
    score: f64,
    mean_rate: f64,
    samples: usize,
}

/// Score groups of engagement rates and sort them deterministically:
/// score descending, then sample count descending, then key ascending.
fn rank<K: Ord>(groups: BTreeMap<K, Vec<f64>>, k: f64) -> Vec<Ranked<K>> {
    let mut ranked: Vec<Ranked<K>> = groups
        .into_iter()
        .filter(|(_, rates)| !rates.is_empty())
        .map(|(key, rates)| {
            let n = rates.len() as f64;
            let mean_rate = rates.iter().sum::<f64>() / n;
            let confidence = n / (n + k);
            Ranked {
                key,
                score: mean_rate * confidence,
                mean_rate,
                samples: rates.len(),
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.samples.cmp(&a.samples))
            .then_with(|| a.key.cmp(&b.key))
    });
    ranked
}

/// Turns outcome records into ranked signals and statistics.
pub struct FeedbackEngine {
    store: Arc<dyn MetricsStore>,
    config: AnalyticsConfig,
    cache: RwLock<Option<(u64, Arc<Signals>)>>,
}

impl FeedbackEngine {
    pub fn new(store: Arc<dyn MetricsStore>, config: AnalyticsConfig) -> Self {
        Self {
            store,
            config,
            cache: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    /// Top `limit` publish hours by confidence-weighted engagement rate.
    pub async fn best_time_slots(&self, limit: usize) -> Result<Vec<TimeSlot>, StoreError> {
        let signals = self.signals().await?;
        Ok(signals.time_slots.iter().take(limit).cloned().collect())
    }

    /// Top `limit` tags by confidence-weighted engagement rate.
    pub async fn best_hashtags(&self, limit: usize) -> Result<Vec<TagScore>, StoreError> {
        let signals = self.signals().await?;
        Ok(signals.tags.iter().take(limit).cloned().collect())
    }

    /// Aggregate statistics over one snapshot of the store.
    pub async fn statistics(&self) -> Result<Statistics, StoreError> {
        let records = self.store.all().await?;
        let runs = self.store.runs().await?;

        let mut stats = Statistics {
            total_posts: records.len(),
            ..Default::default()
        };

        let mut rate_sum = 0.0;
        for record in &records {
            stats.total_likes += record.engagement.likes;
            stats.total_comments += record.engagement.comments;
            stats.total_views += record.engagement.views;
            if let Some(rate) = record.engagement_rate() {
                stats.ranked_posts += 1;
                rate_sum += rate;
            }
        }
        stats.total_engagement = stats.total_likes + stats.total_comments;

        if stats.ranked_posts > 0 {
            stats.mean_engagement_rate = rate_sum / stats.ranked_posts as f64;
        }
        if stats.total_posts > 0 {
            let n = stats.total_posts as f64;
            stats.avg_likes_per_post = stats.total_likes as f64 / n;
            stats.avg_comments_per_post = stats.total_comments as f64 / n;
            stats.avg_views_per_post = stats.total_views as f64 / n;
        }

        for run in &runs {
            match run.status {
                RunStatus::Published => stats.runs.published += 1,
                RunStatus::Skipped => stats.runs.skipped += 1,
                RunStatus::Failed => stats.runs.failed += 1,
            }
        }

        Ok(stats)
    }

    /// Ranked posts ordered by engagement rate, best first.
    pub async fn best_performing_posts(
        &self,
        limit: usize,
    ) -> Result<Vec<OutcomeRecord>, StoreError> {
        let mut posts: Vec<(f64, OutcomeRecord)> = self
            .store
            .all()
            .await?
            .into_iter()
            .filter_map(|r| r.engagement_rate().map(|rate| (rate, r)))
            .collect();

        posts.sort_by(|(ra, a), (rb, b)| {
            rb.total_cmp(ra)
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        Ok(posts.into_iter().take(limit).map(|(_, r)| r).collect())
    }

    /// Statistics plus every post, stamped with the export time.
    pub async fn export(&self) -> Result<Export, StoreError> {
        Ok(Export {
            statistics: self.statistics().await?,
            posts: self.store.all().await?,
            exported_at: Utc::now(),
        })
    }

    /// Return cached signals, recomputing if the store changed since they were built.
    async fn signals(&self) -> Result<Arc<Signals>, StoreError> {
        let generation = self.store.generation();

        if let Some((cached_gen, signals)) = self.cache.read().await.as_ref()
            && *cached_gen == generation
        {
            return Ok(Arc::clone(signals));
        }

        let records = self.store.all().await?;
        let signals = Arc::new(self.compute(&records));
        debug!(
            generation,
            records = records.len(),
            slots = signals.time_slots.len(),
            tags = signals.tags.len(),
            "recomputed feedback signals"
        );

        *self.cache.write().await = Some((generation, Arc::clone(&signals)));
        Ok(signals)
    }

    fn compute(&self, records: &[OutcomeRecord]) -> Signals {
        let tz = self.config.reporting_timezone;
        let k = self.config.smoothing_k;

        let mut by_hour: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
        let mut by_tag: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut ranked_records = 0;

        for record in records {
            let Some(rate) = record.engagement_rate() else {
                continue;
            };
            ranked_records += 1;

            let hour = record.published_at.with_timezone(&tz).hour();
            by_hour.entry(hour).or_default().push(rate);

            // A tag repeated within one post counts once for that post
            let mut seen: HashSet<&str> = HashSet::new();
            for tag in &record.tags {
                if seen.insert(tag.as_str()) {
                    by_tag.entry(tag.clone()).or_default().push(rate);
                }
            }
        }

        let time_slots = if ranked_records < self.config.min_ranked_records {
            Vec::new()
        } else {
            rank(by_hour, k)
                .into_iter()
                .map(|r| TimeSlot {
                    hour: r.key,
                    score: r.score,
                    mean_rate: r.mean_rate,
                    samples: r.samples,
                })
                .collect()
        };

        let tags = rank(by_tag, k)
            .into_iter()
            .map(|r| TagScore {
                tag: r.key,
                score: r.score,
                mean_rate: r.mean_rate,
                samples: r.samples,
            })
            .collect();

        Signals { time_slots, tags }
    }
}
