//! Alert building and delivery.

pub mod dispatch;
pub mod embed;

pub use self::dispatch::{
    AlertTransport, DeliveryError, DeliveryReceipt, DispatchStatus, Dispatcher, LoggingTransport,
    WebhookTransport,
};
pub use self::embed::{attachments_consistent, AlertBuilder};
