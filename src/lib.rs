pub mod config;
pub mod context;
pub mod db;
pub mod drivers;
pub mod error;
pub mod idcodec;
pub mod jsonutil;
pub mod models;
pub mod nonce;
pub mod repos;
pub mod routes;
pub mod services;
pub mod signature;

pub use config::Config;
pub use context::{DbAccess, ServiceContext};
pub use error::PaymentError;
pub use idcodec::IdCodec;
pub use services::intent::{
    CommitIntent, CommitIntentWorker, Intent, IntentPipeline, PostIntentWorker, PreIntentWorker,
};
pub use services::notifier::{Notification, Notifier};
pub use services::payment_service::PaymentService;
