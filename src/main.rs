use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rust_decimal::Decimal;
use tokio::sync::watch;

use offramp_saga::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, LoggingObserver};
use offramp_saga::config::{AppConfig, EndpointConfig};
use offramp_saga::withdrawal::adapters::{
    BrokerLedgerClient, LedgerAdapter, OfframpClient, ProtectedLedger, ProtectedTransfer,
    TransferAdapter,
};
use offramp_saga::withdrawal::guards::{
    TieredLimitsGuard, TracingAuditLogger, TracingNotifier, UnrestrictedAllocation,
};
use offramp_saga::withdrawal::{
    InMemoryWithdrawalRepository, PgWithdrawalRepository, ReconciliationSweep, SagaContext,
    SagaOrchestrator, SagaWorkerPool, UserId, WithdrawalIntake, WithdrawalRepository,
    WithdrawalRequest, saga_channel,
};

const DEMO_ACCOUNT: &str = "DEMO-ACCOUNT";

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn use_demo_mode() -> bool {
    std::env::args().any(|a| a == "--submit-demo")
}

fn breaker(name: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(name, config.clone()).with_observer(Arc::new(LoggingObserver)))
}

#[cfg(feature = "mock-adapters")]
fn ledger_adapter(
    endpoint: Option<&EndpointConfig>,
    system_account: &str,
) -> anyhow::Result<Arc<dyn LedgerAdapter>> {
    use offramp_saga::withdrawal::adapters::mock::MockLedger;

    match endpoint {
        Some(cfg) => Ok(Arc::new(BrokerLedgerClient::new(cfg.clone())?)),
        None => {
            tracing::warn!("No ledger endpoint configured, using mock ledger");
            let mock = MockLedger::new(system_account);
            mock.set_buying_power(DEMO_ACCOUNT, Decimal::new(100_000, 0));
            Ok(Arc::new(mock))
        }
    }
}

#[cfg(not(feature = "mock-adapters"))]
fn ledger_adapter(
    endpoint: Option<&EndpointConfig>,
    _system_account: &str,
) -> anyhow::Result<Arc<dyn LedgerAdapter>> {
    let cfg = endpoint.context("ledger endpoint is required without mock-adapters")?;
    Ok(Arc::new(BrokerLedgerClient::new(cfg.clone())?))
}

#[cfg(feature = "mock-adapters")]
fn transfer_adapter(endpoint: Option<&EndpointConfig>) -> anyhow::Result<Arc<dyn TransferAdapter>> {
    use offramp_saga::withdrawal::adapters::mock::MockOfframp;

    match endpoint {
        Some(cfg) => Ok(Arc::new(OfframpClient::new(cfg.clone())?)),
        None => {
            tracing::warn!("No off-ramp endpoint configured, using mock provider");
            Ok(Arc::new(MockOfframp::new()))
        }
    }
}

#[cfg(not(feature = "mock-adapters"))]
fn transfer_adapter(endpoint: Option<&EndpointConfig>) -> anyhow::Result<Arc<dyn TransferAdapter>> {
    let cfg = endpoint.context("off-ramp endpoint is required without mock-adapters")?;
    Ok(Arc::new(OfframpClient::new(cfg.clone())?))
}

async fn repository(config: &AppConfig) -> anyhow::Result<Arc<dyn WithdrawalRepository>> {
    match &config.postgres_url {
        Some(url) => {
            let repo = PgWithdrawalRepository::connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            repo.migrate().await.context("Failed to apply schema")?;
            tracing::info!("Using PostgreSQL withdrawal store");
            Ok(Arc::new(repo))
        }
        None => {
            tracing::warn!("No postgres_url configured, withdrawals are kept in memory");
            Ok(Arc::new(InMemoryWithdrawalRepository::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = offramp_saga::logging::init_logging(&app_config);

    tracing::info!(
        git_hash = env!("GIT_HASH"),
        "Starting off-ramp saga service in {} mode",
        env
    );

    let repo = repository(&app_config).await?;

    let ledger = ProtectedLedger::new(
        ledger_adapter(
            app_config.ledger.as_ref(),
            &app_config.saga.system_account_id,
        )?,
        breaker("ledger", &app_config.breakers.ledger),
    );
    let transfer = ProtectedTransfer::new(
        transfer_adapter(app_config.offramp.as_ref())?,
        breaker("offramp", &app_config.breakers.offramp),
    );

    let notifier = Arc::new(TracingNotifier);
    let (queue, receiver) = saga_channel(app_config.saga.queue_capacity);
    let queue = Arc::new(queue);

    let ctx = SagaContext::new(
        repo.clone(),
        ledger.clone(),
        transfer,
        notifier.clone(),
        app_config.saga.clone(),
    );

    let intake = WithdrawalIntake::new(
        repo,
        ledger,
        Arc::new(TieredLimitsGuard::new(app_config.limit_tiers.clone())),
        Arc::new(UnrestrictedAllocation),
        Arc::new(TracingAuditLogger),
        notifier,
        queue.clone(),
    );

    let orchestrator = Arc::new(SagaOrchestrator::new(
        ctx.clone(),
        queue.clone(),
        app_config.monitor.clone(),
    ));

    let sweep =
        ReconciliationSweep::new(ctx, app_config.reconciliation.clone()).with_queue(queue);
    // Steps lost with the previous process
    let recovered = sweep
        .redeliver_stalled(Duration::ZERO)
        .await
        .context("Failed to recover in-flight withdrawals")?;
    tracing::info!(recovered, "Startup recovery finished");

    let pool = SagaWorkerPool::new(orchestrator, app_config.workers.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool_handle = tokio::spawn(async move { pool.run(receiver, shutdown_rx).await });

    let sweep_handle = tokio::spawn(async move {
        sweep.run().await;
    });

    if use_demo_mode() {
        let req = WithdrawalRequest {
            user_id: UserId::new_v4(),
            amount: Decimal::new(250, 0),
            destination_chain: "ethereum".to_string(),
            destination_address: "0x52908400098527886E0F7030069857D2E4169EE7".to_string(),
            source_account_id: DEMO_ACCOUNT.to_string(),
        };
        match intake.initiate_withdrawal(req).await {
            Ok(accepted) => tracing::info!(
                withdrawal_id = %accepted.withdrawal_id,
                status = %accepted.status,
                "Demo withdrawal accepted"
            ),
            Err(e) => tracing::error!(code = e.code(), error = %e, "Demo withdrawal rejected"),
        }
    }

    tracing::info!("Off-ramp saga service running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down");
    sweep_handle.abort();
    let _ = shutdown_tx.send(true);
    pool_handle.await.context("Worker pool task panicked")?;

    Ok(())
}
