use std::time::Duration;
use tokio::time::Instant;

const THROTTLE_PERIOD: Duration = Duration::from_millis(500);

/// Token-bucket throttle for image transfers. The configured rate is
/// split into 500ms periods; a transfer debits bytes as it copies and
/// sleeps out the remainder of the period once the reserve is spent.
pub struct TransferThrottler {
    bytes_per_period: u64,
    cur_reserve: i64,
    period_start: Instant,
}

impl TransferThrottler {
    /// A rate of 0 means unlimited: no throttler at all.
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        if bytes_per_sec == 0 {
            return None;
        }
        let bytes_per_period = std::cmp::max(
            1,
            bytes_per_sec.saturating_mul(THROTTLE_PERIOD.as_millis() as u64) / 1000,
        );
        Some(Self {
            bytes_per_period,
            cur_reserve: bytes_per_period as i64,
            period_start: Instant::now(),
        })
    }

    pub fn bytes_per_period(&self) -> u64 {
        self.bytes_per_period
    }

    /// Debit bytes from the current period's reserve. Returns true
    /// when the reserve is exhausted and the caller must wait for a
    /// refill before copying more.
    pub fn debit(&mut self, num_bytes: u64) -> bool {
        self.cur_reserve -= num_bytes as i64;
        self.cur_reserve <= 0
    }

    pub fn refill(&mut self) {
        self.cur_reserve += self.bytes_per_period as i64;
        if self.cur_reserve > self.bytes_per_period as i64 {
            self.cur_reserve = self.bytes_per_period as i64;
        }
    }

    pub async fn throttle(&mut self, num_bytes: u64) {
        if !self.debit(num_bytes) {
            return;
        }
        while self.cur_reserve <= 0 {
            let period_end = self.period_start + THROTTLE_PERIOD;
            tokio::time::sleep_until(period_end).await;
            self.period_start = Instant::now();
            self.refill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rate_is_unlimited() {
        assert!(TransferThrottler::new(0).is_none());
    }

    #[test]
    fn test_period_sizing() {
        assert_eq!(TransferThrottler::new(1024).unwrap().bytes_per_period(), 512);
        // Tiny rates still move at least one byte per period.
        assert_eq!(TransferThrottler::new(1).unwrap().bytes_per_period(), 1);
        // Absurdly large rates clamp instead of overflowing.
        assert_eq!(
            TransferThrottler::new(u64::MAX).unwrap().bytes_per_period(),
            u64::MAX / 1000
        );
    }

    #[test]
    fn test_debit_and_refill() {
        let mut throttler = TransferThrottler::new(1024).unwrap();
        assert!(!throttler.debit(100));
        assert!(!throttler.debit(300));
        assert!(throttler.debit(112));
        // One refill covers the reserve again.
        throttler.refill();
        assert!(!throttler.debit(100));
    }

    #[test]
    fn test_refill_does_not_bank_idle_periods() {
        let mut throttler = TransferThrottler::new(1024).unwrap();
        throttler.refill();
        throttler.refill();
        // Reserve is capped at one period's worth.
        assert!(throttler.debit(512));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_sleeps_out_period() {
        let mut throttler = TransferThrottler::new(1024).unwrap();
        let start = Instant::now();
        throttler.throttle(512).await;
        throttler.throttle(512).await;
        // The second call had to wait for the next period.
        assert!(Instant::now() - start >= Duration::from_millis(500));
    }
}
