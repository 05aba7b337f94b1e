//! Circuit breaker behaviour through the public API, standalone and in front
//! of a ledger adapter.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use offramp_saga::circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
use offramp_saga::withdrawal::adapters::mock::MockLedger;
use offramp_saga::withdrawal::adapters::{AdapterError, ProtectedLedger};

fn config(failure_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        max_requests: 1,
        interval: Duration::from_secs(60),
        timeout: Duration::from_secs(30),
        failure_threshold,
        success_threshold: 1,
    }
}

#[tokio::test(start_paused = true)]
async fn open_breaker_never_invokes_the_operation() {
    let cb = CircuitBreaker::new("provider", config(2));
    let calls = AtomicUsize::new(0);

    for _ in 0..5 {
        let _ = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("down")
            })
            .await;
    }

    assert_eq!(cb.state(), CircuitState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn recovers_through_half_open() {
    let cb = CircuitBreaker::new("provider", config(1));

    let res = cb.execute(|| async { Err::<(), _>("down") }).await;
    assert!(matches!(res, Err(BreakerError::Inner("down"))));
    assert_eq!(cb.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    let res = cb.execute(|| async { Ok::<_, &str>(7) }).await;
    assert_eq!(res.unwrap(), 7);
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn protected_ledger_fails_fast_once_tripped() {
    let ledger = Arc::new(MockLedger::new("SYS"));
    ledger.set_fail_get_account(true);
    let protected = ProtectedLedger::new(
        ledger.clone(),
        Arc::new(CircuitBreaker::new("ledger", config(3))),
    );

    for _ in 0..3 {
        let err = protected.get_account("acct").await.unwrap_err();
        assert!(matches!(err, BreakerError::Inner(AdapterError::Network(_))));
    }
    assert_eq!(protected.breaker().state(), CircuitState::Open);

    // Dependency has recovered but the breaker still rejects
    ledger.set_fail_get_account(false);
    ledger.set_buying_power("acct", rust_decimal::Decimal::new(5, 0));
    let err = protected.get_account("acct").await.unwrap_err();
    assert!(err.is_rejected());

    tokio::time::advance(Duration::from_secs(30)).await;
    let account = protected.get_account("acct").await.unwrap();
    assert_eq!(account.buying_power, rust_decimal::Decimal::new(5, 0));
    assert_eq!(protected.breaker().state(), CircuitState::Closed);
}
