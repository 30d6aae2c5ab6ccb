//! Custodia simulator.
//!
//! Wires the engine together in memory and runs a scripted session: a P2P
//! trade with a referral fee, a withdrawal, a platform payout refused for
//! lack of liquidity, and a disputed trade. Final balances and supply
//! reports are printed as JSON.
//!
//! `RUST_LOG` controls verbosity (default `info`); set `CUSTODIA_LOG_JSON=1`
//! for JSON log lines. Logs go to stderr, results to stdout.

use std::sync::Arc;

use anyhow::{Context, bail};
use custodia_ledger::{
    AdminLiquidityPool, InMemoryAccountStore, InMemoryJournal, LedgerJournal, LedgerService,
    LiquidityGuard,
};
use custodia_settlement::{
    CommissionLog, ConfigProvider, EscrowManager, FeeDistributionEngine, HotReloadConfig,
    InMemoryCommissionLog, ReleaseRequest, StaticAdminDirectory, WithdrawalDesk,
};
use custodia_types::{
    ActorId, DisputeResolution, FeeConfig, LedgerError, OwnerId, ReferenceId, ReferralTier,
    ReferrerContext, UserId, constants,
};
use rust_decimal::Decimal;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let json = std::env::var("CUSTODIA_LOG_JSON").is_ok_and(|v| v == "1");
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

struct Engine {
    ledger: Arc<LedgerService>,
    journal: Arc<InMemoryJournal>,
    pool: Arc<AdminLiquidityPool>,
    guard: Arc<LiquidityGuard>,
    escrow: Arc<EscrowManager>,
    desk: WithdrawalDesk,
    commissions: Arc<InMemoryCommissionLog>,
    config: Arc<HotReloadConfig>,
    admin: ActorId,
}

impl Engine {
    fn new() -> anyhow::Result<Self> {
        let journal = Arc::new(InMemoryJournal::new());
        let ledger = Arc::new(LedgerService::new(
            Arc::new(InMemoryAccountStore::new()),
            journal.clone(),
        ));
        let pool = Arc::new(AdminLiquidityPool::new(ledger.clone()));
        let guard = Arc::new(LiquidityGuard::new(pool.clone()));
        let config = Arc::new(
            HotReloadConfig::new(FeeConfig::default()).context("default fee config")?,
        );
        let commissions = Arc::new(InMemoryCommissionLog::new());
        let fees = Arc::new(FeeDistributionEngine::new(
            ledger.clone(),
            config.clone(),
            commissions.clone(),
        ));
        let admin = ActorId::new();
        let escrow = Arc::new(EscrowManager::new(
            ledger.clone(),
            fees,
            Arc::new(StaticAdminDirectory::new([admin])),
        ));
        let desk = WithdrawalDesk::new(escrow.clone(), guard.clone());
        Ok(Self {
            ledger,
            journal,
            pool,
            guard,
            escrow,
            desk,
            commissions,
            config,
            admin,
        })
    }
}

fn main() -> anyhow::Result<()> {
    init_logging();
    tracing::info!(
        engine = constants::ENGINE_NAME,
        version = constants::VERSION,
        "Starting simulation"
    );

    let engine = Engine::new()?;
    let alice = UserId::new();
    let bob = UserId::new();
    let carol = UserId::new();

    engine
        .pool
        .inject("BTC", Decimal::new(5, 0), &"reserve-btc".into())?;
    engine
        .pool
        .inject("USDT", Decimal::new(100_000, 0), &"reserve-usdt".into())?;
    engine
        .ledger
        .deposit(alice, "BTC", Decimal::new(100, 0), &"chain-deposit-1".into())?;
    engine
        .ledger
        .deposit(bob, "USDT", Decimal::new(5_000, 0), &"chain-deposit-2".into())?;

    // P2P: Alice sells 30 BTC to Bob, Carol referred Alice.
    let trade = ReferenceId::from("p2p-1");
    engine
        .escrow
        .lock(alice.into(), "BTC", Decimal::new(30, 0), &trade, "p2p_trade")?;
    let p2p_fee = engine.config.fee_config().p2p_fee_percent;
    let release = engine.escrow.release(
        &ReleaseRequest::new(trade, bob.into(), p2p_fee)
            .referrer(ReferrerContext::new(carol, ReferralTier::Standard)),
    )?;
    println!("{}", serde_json::to_string_pretty(&release)?);

    // Bob withdraws part of his BTC.
    let withdrawal = ReferenceId::from("wd-1");
    engine
        .desk
        .request(bob, "BTC", Decimal::new(2, 0), &withdrawal)?;
    let receipt = engine.desk.approve(&withdrawal, engine.admin, None)?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);

    // Interest payout larger than the BTC pool is refused.
    match engine
        .guard
        .payout(carol, "BTC", Decimal::new(7, 0), "interest", &"interest-1".into())
    {
        Err(LedgerError::InsufficientPoolLiquidity { shortage, .. }) => {
            tracing::info!(shortage = %shortage, "Payout refused as expected");
        }
        Err(other) => return Err(other.into()),
        Ok(_) => bail!("payout beyond pool liquidity was accepted"),
    }

    // Disputed trade decided for the buyer.
    let disputed = ReferenceId::from("p2p-2");
    engine
        .escrow
        .lock(alice.into(), "BTC", Decimal::new(10, 0), &disputed, "p2p_trade")?;
    engine
        .escrow
        .open_dispute(&disputed, None, "buyer reports payment sent")?;
    engine.escrow.resolve_dispute(
        &disputed,
        DisputeResolution::ReleaseTo { winner: bob.into() },
        engine.admin,
    )?;

    let owners = [
        ("alice", OwnerId::from(alice)),
        ("bob", OwnerId::from(bob)),
        ("carol", OwnerId::from(carol)),
        ("admin_revenue", OwnerId::AdminRevenue),
        ("liquidity_pool", OwnerId::LiquidityPool),
    ];
    let mut balances = serde_json::Map::new();
    for (name, owner) in owners {
        let mut per_currency = serde_json::Map::new();
        for currency in ["BTC", "USDT"] {
            per_currency.insert(
                currency.to_string(),
                serde_json::to_value(engine.ledger.balance(owner, currency))?,
            );
        }
        balances.insert(name.to_string(), per_currency.into());
    }
    println!("{}", serde_json::to_string_pretty(&balances)?);

    for currency in ["BTC", "USDT"] {
        let report = engine.ledger.verify_supply(currency)?;
        tracing::info!(
            currency,
            holdings = %report.holdings,
            liabilities = %report.liabilities,
            pool = %report.pool_total,
            "Supply verified"
        );
    }

    tracing::info!(
        journal_entries = engine.journal.len(),
        commission_rows = engine.commissions.len(),
        carol_commissions = engine.commissions.stats_for(carol).commissions,
        active_locks = engine.escrow.active_count(),
        "Simulation complete"
    );
    Ok(())
}
