use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

pub const DEFAULT_MAX_TIMES: u32 = 10;
const DEFAULT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Reintento acotado con predicado.
///
/// `times` son reintentos adicionales (acotados por `max_times`); el backoff es
/// `delay * exponential_rate^(intento-1)` con techo `max_backoff`. Un `delay`
/// cero desactiva las esperas.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub times: u32,
    pub max_times: u32,
    pub delay: Duration,
    pub exponential_rate: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            times: 3,
            max_times: DEFAULT_MAX_TIMES,
            delay: DEFAULT_DELAY,
            exponential_rate: 1.0,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(times: u32) -> Self {
        Self {
            times,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_exponential_rate(mut self, rate: f64) -> Self {
        self.exponential_rate = rate;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn effective_times(&self) -> u32 {
        self.times.min(self.max_times)
    }

    /// Espera antes del reintento número `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.delay.as_secs_f64() * self.exponential_rate.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    pub async fn run<T, E, Op, Fut, C>(&self, op: Op, condition: C) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        self.run_with_hook(op, condition, |_: &E, _| {}).await
    }

    /// Como `run`, pero invoca `on_failure(err, intentos)` al agotar los reintentos.
    pub async fn run_with_hook<T, E, Op, Fut, C, H>(
        &self,
        mut op: Op,
        condition: C,
        on_failure: H,
    ) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        H: FnOnce(&E, u32),
        E: std::fmt::Display,
    {
        let times = self.effective_times();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !condition(&err) {
                return Err(err);
            }

            if attempts > times {
                on_failure(&err, attempts);
                return Err(err);
            }

            let wait = self.backoff(attempts);
            warn!(
                "intento {}/{} falló ({}), reintentando en {:?}",
                attempts,
                times + 1,
                err,
                wait
            );
            if !wait.is_zero() {
                sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum Fake {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for Fake {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    #[tokio::test]
    async fn reintenta_exactamente_times_veces() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3).with_delay(Duration::ZERO);

        let c = calls.clone();
        let result: Result<(), Fake> = policy
            .run(
                || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err(Fake::Transient)
                    }
                },
                |e| *e == Fake::Transient,
            )
            .await;

        assert_eq!(result, Err(Fake::Transient));
        // 1 intento + 3 reintentos
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn error_que_no_cumple_condicion_no_se_reintenta() {
        let calls = Arc::new(AtomicU32::new(0));
        let hook_calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3).with_delay(Duration::ZERO);

        let c = calls.clone();
        let h = hook_calls.clone();
        let result: Result<(), Fake> = policy
            .run_with_hook(
                || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err(Fake::Permanent)
                    }
                },
                |e| *e == Fake::Transient,
                move |_, _| {
                    h.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(result, Err(Fake::Permanent));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exito_tras_fallos_transitorios() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3).with_delay(Duration::ZERO);

        let c = calls.clone();
        let result = policy
            .run(
                || {
                    let c = c.clone();
                    async move {
                        if c.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(Fake::Transient)
                        } else {
                            Ok("ok")
                        }
                    }
                },
                |e| *e == Fake::Transient,
            )
            .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn hook_recibe_cantidad_de_intentos_y_times_esta_acotado() {
        let seen = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(50).with_delay(Duration::ZERO);
        assert_eq!(policy.effective_times(), DEFAULT_MAX_TIMES);

        let s = seen.clone();
        let _: Result<(), Fake> = policy
            .run_with_hook(
                || async { Err(Fake::Transient) },
                |_| true,
                move |_, attempts| s.store(attempts, Ordering::SeqCst),
            )
            .await;

        assert_eq!(seen.load(Ordering::SeqCst), DEFAULT_MAX_TIMES + 1);
    }

    #[test]
    fn backoff_exponencial_con_techo() {
        let policy = RetryPolicy::new(5)
            .with_delay(Duration::from_secs(1))
            .with_exponential_rate(2.0)
            .with_max_backoff(Duration::from_secs(5));

        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(5));

        let flat = RetryPolicy::new(3);
        assert_eq!(flat.backoff(3), Duration::from_secs(1));
        assert_eq!(
            RetryPolicy::new(3).with_delay(Duration::ZERO).backoff(2),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn espera_entre_reintentos() {
        let policy = RetryPolicy::new(2).with_delay(Duration::from_secs(1));
        let start = tokio::time::Instant::now();

        let _: Result<(), Fake> = policy
            .run(|| async { Err(Fake::Transient) }, |_| true)
            .await;

        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
