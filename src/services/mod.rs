pub mod intent;
pub mod notifier;
pub mod payment_service;
