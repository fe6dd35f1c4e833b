use std::time::Duration;

/// Delay policy between bulk retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Never retry.
    Stop,
    /// Same delay before every retry.
    Constant { interval: Duration, max_retries: u32 },
    /// Delay doubles from `initial` up to `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        max_retries: u32,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(10),
            max_retries: 5,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (0-indexed), or `None` once the
    /// policy gives up.
    pub fn next(&self, retry: u32) -> Option<Duration> {
        match *self {
            Backoff::Stop => None,
            Backoff::Constant {
                interval,
                max_retries,
            } => (retry < max_retries).then_some(interval),
            Backoff::Exponential {
                initial,
                max,
                max_retries,
            } => {
                if retry >= max_retries {
                    return None;
                }
                let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
                Some(initial.checked_mul(factor).map_or(max, |d| d.min(max)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
            max_retries: 4,
        };
        let delays: Vec<_> = (0..5).map(|r| backoff.next(r)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_millis(100)),
                Some(Duration::from_millis(200)),
                Some(Duration::from_millis(350)),
                Some(Duration::from_millis(350)),
                None,
            ]
        );
    }

    #[test]
    fn huge_retry_counts_do_not_overflow() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_retries: u32::MAX,
        };
        assert_eq!(backoff.next(200), Some(Duration::from_secs(30)));
    }

    #[test]
    fn stop_never_retries() {
        assert_eq!(Backoff::Stop.next(0), None);
        assert_eq!(Backoff::Stop.next(5), None);
    }
}
