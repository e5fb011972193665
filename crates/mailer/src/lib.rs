//! Invoice delivery through a transactional e-mail provider.
//!
//! The provider renders the invoice; this crate only ships the structured
//! payload. Callers treat delivery as best-effort: a failed send is logged
//! upstream and never fails the order that triggered it.

use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Client for the transactional e-mail HTTP API.
#[derive(Clone)]
pub struct MailerClient {
    http: Client,
    base_url: Url,
    api_key: String,
    from: String,
}

impl MailerClient {
    /// Creates a new mailer client with the provided configuration.
    pub fn new(
        base_url: Url,
        api_key: impl Into<String>,
        from: impl Into<String>,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            api_key: api_key.into(),
            from: from.into(),
        }
    }

    /// Sends the invoice for a freshly placed order.
    pub async fn send_invoice(
        &self,
        invoice: &InvoiceEmail<'_>,
    ) -> Result<SendReceipt, MailerError> {
        let url = self.base_url.join("messages")?;
        let payload = InvoicePayload {
            from: &self.from,
            to: invoice.to,
            subject: format!("Your cardstall order {}", invoice.order_number),
            order_number: invoice.order_number,
            customer_name: invoice.customer_name,
            items: invoice.items,
            subtotal_cents: invoice.subtotal_cents,
            shipping_cents: invoice.shipping_cents,
            total_cents: invoice.total_cents,
            currency: invoice.currency,
        };

        let response = self
            .authorized_request(Method::POST, url)
            .json(&payload)
            .send()
            .await?;

        parse_json::<SendResponse>(response)
            .await
            .map(|body| SendReceipt {
                message_id: body.id,
            })
    }

    fn authorized_request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }
}

/// Invoice contents for one placed order.
pub struct InvoiceEmail<'a> {
    pub to: &'a str,
    pub order_number: &'a str,
    pub customer_name: &'a str,
    pub items: &'a [InvoiceLine],
    pub subtotal_cents: i64,
    pub shipping_cents: i64,
    pub total_cents: i64,
    pub currency: &'a str,
}

/// One invoice line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub name: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

#[derive(Serialize)]
struct InvoicePayload<'a> {
    from: &'a str,
    to: &'a str,
    subject: String,
    order_number: &'a str,
    customer_name: &'a str,
    items: &'a [InvoiceLine],
    subtotal_cents: i64,
    shipping_cents: i64,
    total_cents: i64,
    currency: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct SendResponse {
    id: String,
}

/// Provider acknowledgement for a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
}

/// Errors produced by the mailer client.
#[derive(Debug, Error)]
pub enum MailerError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, MailerError>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(MailerError::Status { status, body });
    }

    Ok(response.json().await?)
}
