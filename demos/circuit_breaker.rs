//! Circuit breaker walkthrough.
//!
//! Drives one caller's breaker for a single target through every state.
//!
//! Run with:
//! ```bash
//! cargo run --example circuit_breaker
//! ```

use servicemesh_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, State};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

const TARGET: &str = "orders";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
        .init();

    let config = CircuitBreakerConfig {
        failure_threshold: 3,
        reset_timeout_ms: 1_000,
        half_open_calls: 2,
    };
    info!(
        failure_threshold = config.failure_threshold,
        reset_timeout_ms = config.reset_timeout_ms,
        half_open_calls = config.half_open_calls,
        "circuit breaker demo"
    );
    let breaker = CircuitBreaker::new("gateway", config.clone());

    info!("scenario 1: consecutive failures open the circuit");
    for i in 1..=3 {
        if breaker.is_allowed(TARGET) {
            warn!("  call #{} failed", i);
            breaker.record_failure(TARGET);
        }
    }
    assert_eq!(breaker.state(TARGET), State::Open);

    info!("scenario 2: an open circuit fails fast");
    assert!(!breaker.is_allowed(TARGET));
    warn!("  call rejected without reaching {}", TARGET);

    info!("scenario 3: after the reset timeout trial calls are admitted");
    sleep(config.reset_timeout() + Duration::from_millis(50)).await;
    assert!(breaker.is_allowed(TARGET));
    assert!(breaker.is_allowed(TARGET));
    // Both half-open slots are taken.
    assert!(!breaker.is_allowed(TARGET));
    assert_eq!(breaker.state(TARGET), State::HalfOpen);

    info!("scenario 4: successful trial calls close the circuit");
    breaker.record_success(TARGET);
    breaker.record_success(TARGET);
    assert_eq!(breaker.state(TARGET), State::Closed);

    info!("scenario 5: a failed trial call reopens it");
    for _ in 0..3 {
        breaker.is_allowed(TARGET);
        breaker.record_failure(TARGET);
    }
    sleep(config.reset_timeout() + Duration::from_millis(50)).await;
    assert!(breaker.is_allowed(TARGET));
    breaker.record_failure(TARGET);
    assert_eq!(breaker.state(TARGET), State::Open);

    let stats = breaker.get_stats(TARGET);
    info!(
        state = ?stats.state,
        failures = stats.failure_count,
        "demo complete"
    );
}
