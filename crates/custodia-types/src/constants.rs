//! System-wide constants for the Custodia ledger.

/// Decimal places kept for every amount. Fee math truncates to this.
pub const AMOUNT_PRECISION: u32 = 8;

/// Number of completed idempotency keys remembered per ledger.
pub const IDEMPOTENCY_CACHE_SIZE: usize = 500_000;

/// Capacity of the broadcast channels feeding journal/commission subscribers.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Default fee on P2P escrow releases, in percent.
pub const DEFAULT_P2P_FEE_PERCENT: u32 = 1;

/// Default withdrawal fee, in percent.
pub const DEFAULT_WITHDRAWAL_FEE_PERCENT: u32 = 1;

/// Default fee on disputed releases, in percent.
pub const DEFAULT_DISPUTE_FEE_PERCENT: u32 = 0;

/// Default standard-tier referral commission, in percent of the fee.
pub const DEFAULT_STANDARD_COMMISSION_PERCENT: u32 = 20;

/// Default golden-tier referral commission, in percent of the fee.
pub const DEFAULT_GOLDEN_COMMISSION_PERCENT: u32 = 50;

// Operation types written to the journal.

pub const OP_DEPOSIT: &str = "deposit";
pub const OP_ROLLBACK: &str = "rollback";
pub const OP_ESCROW_LOCK: &str = "escrow_lock";
pub const OP_ESCROW_UNLOCK: &str = "escrow_unlock";
pub const OP_ESCROW_RELEASE: &str = "escrow_release";
pub const OP_FEE_REVENUE: &str = "fee_revenue";
pub const OP_REFERRAL_COMMISSION: &str = "referral_commission";
pub const OP_FEE_CHARGE: &str = "fee_charge";
pub const OP_POOL_INJECTION: &str = "pool_injection";
pub const OP_WITHDRAWAL: &str = "withdrawal";

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name.
pub const ENGINE_NAME: &str = "Custodia";
