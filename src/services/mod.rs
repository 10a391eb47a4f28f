pub mod autopay_runner;
pub mod calendar;
pub mod gateway;
pub mod idempotency;
pub mod ledger;
pub mod manual_charge;
pub mod notifications;
pub mod payment_profiles;
pub mod scheduler;
pub mod stripe_gateway;
pub mod webhook_reconciler;
