use std::time::Duration;
use tokio::time::Instant;

/// Keeps the average transfer rate of one session under a byte limit
#[derive(Debug)]
pub struct BandwidthThrottle {
    max_bytes_per_sec: Option<u64>,
    bytes: u64,
    started: Instant,
}

impl BandwidthThrottle {
    pub fn new(max_bytes_per_sec: Option<u64>) -> Self {
        Self {
            max_bytes_per_sec: max_bytes_per_sec.filter(|&limit| limit > 0),
            bytes: 0,
            started: Instant::now(),
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Account for `n` transferred bytes, sleeping if we are ahead of the limit
    pub async fn consume(&mut self, n: u64) {
        self.bytes = self.bytes.saturating_add(n);
        let Some(limit) = self.max_bytes_per_sec else {
            return;
        };
        let expected = Duration::from_secs_f64(self.bytes as f64 / limit as f64);
        let elapsed = self.started.elapsed();
        if expected > elapsed {
            tokio::time::sleep(expected - elapsed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_does_not_sleep() {
        let mut throttle = BandwidthThrottle::new(None);
        let start = Instant::now();
        throttle.consume(100 * 1024 * 1024).await;
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(throttle.bytes(), 100 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_limit_delays_transfer() {
        // 100 KiB/s, 20 KiB should take about 200ms
        let mut throttle = BandwidthThrottle::new(Some(100 * 1024));
        let start = Instant::now();
        throttle.consume(10 * 1024).await;
        throttle.consume(10 * 1024).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(180), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(600), "{:?}", elapsed);
    }
}
