use std::{
  net::IpAddr,
  sync::Arc,
  time::{Duration, Instant},
};

use anyhow::anyhow;
use cache::CloneCache;
use tokio::sync::RwLock;

/// Trait to extend fallible futures with stateful rate limiting,
/// keyed by the peer IP of an inbound response-manager connection.
pub trait WithFailureRateLimit<R, E>
where
  Self: Future<Output = Result<R, E>> + Sized,
  E: Into<anyhow::Error> + Send,
{
  /// Ensure `ip` is not violating `limiter`'s rate limit before
  /// executing this fallible future.
  ///
  /// If the rules are violated, returns an error before the future
  /// runs at all. If the future itself fails, the attempt is recorded
  /// against the limit; successes are never counted, so the limiter
  /// only ever throttles repeated failures (e.g. malformed payloads
  /// probing the response port).
  fn with_failure_rate_limit(
    self,
    limiter: &RateLimiter,
    ip: &IpAddr,
  ) -> impl Future<Output = anyhow::Result<R>> {
    async {
      if limiter.disabled {
        return self.await.map_err(Into::into);
      }

      let attempts = limiter.attempts.get_or_insert_default(ip).await;
      let read = attempts.read().await;

      let now = Instant::now();
      let window_start = now - limiter.window;
      let count =
        read.iter().filter(|&&time| time > window_start).count();
      drop(read);

      if count >= limiter.max_attempts {
        attempts.write().await.retain(|&time| time > window_start);
        return Err(anyhow!(
          "too many attempts from {ip}, try again in {:?}",
          limiter.window
        ));
      }

      match self.await {
        Ok(res) => Ok(res),
        Err(e) => {
          let mut write = attempts.write().await;
          write.retain(|&time| time > window_start);
          write.push(now);
          Err(e.into())
        }
      }
    }
  }
}

impl<F, R, E> WithFailureRateLimit<R, E> for F
where
  F: Future<Output = Result<R, E>> + Sized,
  E: Into<anyhow::Error> + Send,
{
}

type RateLimiterMapEntry = Arc<RwLock<Vec<Instant>>>;

pub struct RateLimiter {
  attempts: CloneCache<IpAddr, RateLimiterMapEntry>,
  disabled: bool,
  max_attempts: usize,
  window: Duration,
}

impl RateLimiter {
  /// Creates a rate limiter and spawns a background task that clears
  /// entries untouched for 15+ minutes.
  pub fn new(
    disabled: bool,
    max_attempts: usize,
    window_seconds: u64,
  ) -> Arc<Self> {
    let limiter = Arc::new(Self {
      attempts: CloneCache::default(),
      disabled,
      max_attempts,
      window: Duration::from_secs(window_seconds),
    });
    if !disabled {
      spawn_cleanup_task(limiter.clone());
    }
    limiter
  }
}

fn spawn_cleanup_task(limiter: Arc<RateLimiter>) {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
      interval.tick().await;
      let remove_before =
        Instant::now() - Duration::from_secs(15 * 60);
      limiter
        .attempts
        .retain(|_, attempts| {
          let Ok(attempts) = attempts.try_read() else {
            return true;
          };
          let Some(&last) = attempts.last() else {
            return false;
          };
          last > remove_before
        })
        .await;
    }
  });
}
