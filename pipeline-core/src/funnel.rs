use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{debug, instrument};

use crate::config::FunnelConfig;
use crate::error::{FunnelError, StoreError};
use crate::metrics_consts::{FUNNEL_DURATION, FUNNEL_QUERIES, STORAGE_TIMEOUTS};
use crate::store::EventStore;
use crate::time::Clock;
use crate::types::{FunnelResponse, FunnelStage, Stage};

/// The window a funnel covers. Relative periods end at the time of the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FunnelPeriod {
    /// Since local midnight in the display timezone.
    #[default]
    Today,
    Last24Hours,
    Last7Days,
    Last30Days,
    Custom {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

impl FunnelPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunnelPeriod::Today => "today",
            FunnelPeriod::Last24Hours => "24h",
            FunnelPeriod::Last7Days => "7d",
            FunnelPeriod::Last30Days => "30d",
            FunnelPeriod::Custom { .. } => "custom",
        }
    }

    /// The `[from, to)` window this period denotes at `now`.
    pub fn resolve(&self, now: DateTime<Utc>, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
        match *self {
            FunnelPeriod::Today => (start_of_day(now, tz), now),
            FunnelPeriod::Last24Hours => (now - Duration::hours(24), now),
            FunnelPeriod::Last7Days => (now - Duration::days(7), now),
            FunnelPeriod::Last30Days => (now - Duration::days(30), now),
            FunnelPeriod::Custom { from, to } => (from, to),
        }
    }
}

impl FromStr for FunnelPeriod {
    type Err = FunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "today" => Ok(FunnelPeriod::Today),
            "24h" => Ok(FunnelPeriod::Last24Hours),
            "7d" => Ok(FunnelPeriod::Last7Days),
            "30d" => Ok(FunnelPeriod::Last30Days),
            _ => Err(FunnelError::InvalidPeriod(s.to_owned())),
        }
    }
}

impl fmt::Display for FunnelPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local midnight of the day containing `now`. Some zones skip midnight on DST days, in which
/// case the day starts at the first local time that exists.
fn start_of_day(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let day = now.with_timezone(&tz).date_naive();
    let Some(mut local) = day.and_hms_opt(0, 0, 0) else {
        return now - Duration::hours(24);
    };

    for _ in 0..4 {
        if let Some(start) = tz.from_local_datetime(&local).earliest() {
            return start.with_timezone(&Utc);
        }
        local += Duration::minutes(30);
    }

    // No transition is wider than two hours
    now - Duration::hours(24)
}

/// Answers funnel queries: per-stage event and distinct-article counts over a window.
#[derive(Clone)]
pub struct FunnelAggregator {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    config: FunnelConfig,
}

impl FunnelAggregator {
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>, config: FunnelConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.config.timezone
    }

    #[instrument(skip(self))]
    pub async fn funnel(&self, period: FunnelPeriod) -> Result<FunnelResponse, FunnelError> {
        let start = Instant::now();
        let now = self.clock.now();
        let tz = self.config.timezone;

        let (from, to) = period.resolve(now, tz);
        if from > to {
            return Err(FunnelError::InvalidWindow { from, to });
        }

        let labels = [("period", period.as_str())];
        metrics::counter!(FUNNEL_QUERIES, &labels).increment(1);

        let stages = self.stages(from, to).await?;
        debug!(%from, %to, "computed funnel");
        metrics::histogram!(FUNNEL_DURATION).record(start.elapsed().as_secs_f64());

        Ok(FunnelResponse {
            period: period.as_str().to_owned(),
            timezone: tz.name().to_owned(),
            from: from.with_timezone(&tz).fixed_offset(),
            to: to.with_timezone(&tz).fixed_offset(),
            stages,
            generated_at: now,
        })
    }

    pub async fn funnel_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<FunnelResponse, FunnelError> {
        self.funnel(FunnelPeriod::Custom { from, to }).await
    }

    /// Exactly one entry per stage, in funnel order. Stages without events report zeros.
    async fn stages(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FunnelStage>, FunnelError> {
        let counts =
            match tokio::time::timeout(self.config.storage_timeout, self.store.stage_counts(from, to))
                .await
            {
                Ok(counts) => counts?,
                Err(_) => {
                    metrics::counter!(STORAGE_TIMEOUTS).increment(1);
                    return Err(StoreError::Timeout(self.config.storage_timeout).into());
                }
            };

        let stages = Stage::ALL
            .iter()
            .map(|stage| {
                counts
                    .iter()
                    .find(|count| count.stage == *stage)
                    .map(|count| FunnelStage {
                        name: stage.as_str().to_owned(),
                        count: count.count,
                        unique_articles: count.unique_articles,
                    })
                    .unwrap_or_else(|| FunnelStage::empty(*stage))
            })
            .collect();

        Ok(stages)
    }
}
