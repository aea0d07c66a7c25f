//! Payment verification, order materialization and webhook handling

pub mod order_materializer;
pub mod receipt;
pub mod verification;
pub mod webhook_ingress;

pub use verification::{PaymentVerifier, ProcessingReason, ProcessingResult, VerifiedPayment};
pub use webhook_ingress::{WebhookAuth, WebhookIngress, WebhookRequest};
