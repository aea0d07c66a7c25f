use crate::payments::error::PaymentResult;
use crate::payments::types::{
    CreatedInvoice, InvoiceRequest, PaymentCheck, ProviderName, ReceiptIssued, ReceiptRequest,
};
use async_trait::async_trait;

/// The QR-invoice gateway as the rest of the service sees it.
///
/// Every call carries its own timeout and is never retried in-request.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_invoice(&self, request: InvoiceRequest) -> PaymentResult<CreatedInvoice>;

    /// Sole source of truth for whether an invoice has been paid.
    async fn check_payment(&self, invoice_id: &str) -> PaymentResult<PaymentCheck>;

    /// Tax receipt for a completed payment. Best-effort.
    async fn create_receipt(&self, request: ReceiptRequest) -> PaymentResult<ReceiptIssued>;

    fn name(&self) -> ProviderName;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{InvoiceDisplay, PaymentRow, PaymentRowStatus};
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use uuid::Uuid;

    struct MockGateway;

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn create_invoice(&self, request: InvoiceRequest) -> PaymentResult<CreatedInvoice> {
            Ok(CreatedInvoice {
                invoice_id: format!("INV-{}", request.session_id),
                display: InvoiceDisplay {
                    qr_text: "qr".to_string(),
                    qr_image: None,
                    short_url: None,
                    deep_links: vec![],
                },
            })
        }

        async fn check_payment(&self, _invoice_id: &str) -> PaymentResult<PaymentCheck> {
            Ok(PaymentCheck {
                paid_amount: Decimal::from(100),
                rows: vec![PaymentRow {
                    payment_id: Some("pay-1".to_string()),
                    status: PaymentRowStatus::Paid,
                    amount: Decimal::from(100),
                }],
            })
        }

        async fn create_receipt(&self, request: ReceiptRequest) -> PaymentResult<ReceiptIssued> {
            Ok(ReceiptIssued {
                receipt_id: format!("R-{}", request.payment_id),
                data: serde_json::json!({}),
            })
        }

        fn name(&self) -> ProviderName {
            ProviderName::QrGateway
        }
    }

    #[tokio::test]
    async fn gateway_is_usable_as_trait_object() {
        let gateway: Arc<dyn PaymentGateway> = Arc::new(MockGateway);
        let session_id = Uuid::new_v4();

        let invoice = gateway
            .create_invoice(InvoiceRequest {
                session_id,
                amount: 100,
                description: "order".to_string(),
                callback_url: "https://shop.test/webhook".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(invoice.invoice_id, format!("INV-{}", session_id));

        let check = gateway.check_payment(&invoice.invoice_id).await.unwrap();
        assert!(check.has_paid_row());
        assert_eq!(gateway.name(), ProviderName::QrGateway);
    }
}
