pub mod checkout_sessions;
pub mod orders;
pub mod orphaned_confirmations;
pub mod payment_reconciliation;
pub mod payments;
pub mod pricing;
pub mod session_expiry;
