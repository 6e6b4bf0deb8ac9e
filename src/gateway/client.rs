//! HTTP gateway against the ledger network's public REST API.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::model::*;
use super::{
    AccountRecord, Gateway, OfferRecord, PathRecord, PaymentRecord, SubmitReceipt, TradeRecord,
};
use crate::core::{Asset, Error, Result};
use crate::keys::PublicKey;
use crate::tx::Transaction;

/// Page size used when walking paged collections.
const PAGE_LIMIT: u32 = 200;

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Base URL of the network API, without a trailing slash.
    pub base_url: String,
}

/// [`Gateway`] implementation over the network's REST endpoints.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(options: GatewayOptions) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: options.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("{what} not found")));
        }
        let response = response.error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    fn asset_param(asset: &Asset) -> String {
        format!("{}:{}", asset.code, asset.issuer)
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn load_account(&self, id: &PublicKey) -> Result<AccountRecord> {
        let resource: AccountResource = self
            .get_json(&format!("/accounts/{id}"), &format!("account {id}"))
            .await?;
        resource.try_into()
    }

    async fn submit(&self, tx: &Transaction) -> Result<SubmitReceipt> {
        let envelope = BASE64.encode(serde_json::to_vec(tx)?);
        let url = format!("{}/transactions", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(&[("tx", envelope)])
            .send()
            .await?;
        if !response.status().is_success() {
            let body = response.text().await?;
            let message = serde_json::from_str::<SubmitErrorResource>(&body)
                .map(|e| e.message())
                .unwrap_or(body);
            return Err(Error::Submission(message));
        }
        #[derive(serde::Deserialize)]
        struct SubmitResponse {
            hash: String,
        }
        let submitted: SubmitResponse = response.json().await?;
        debug!(hash = %submitted.hash, "transaction accepted");
        Ok(SubmitReceipt {
            hash: submitted.hash,
        })
    }

    async fn offers(
        &self,
        seller: &PublicKey,
        selling: Option<&Asset>,
        buying: Option<&Asset>,
    ) -> Result<Vec<OfferRecord>> {
        let mut path = format!("/offers?seller={seller}&limit={PAGE_LIMIT}");
        if let Some(selling) = selling {
            path.push_str(&format!(
                "&selling={}",
                urlencoding::encode(&Self::asset_param(selling))
            ));
        }
        if let Some(buying) = buying {
            path.push_str(&format!(
                "&buying={}",
                urlencoding::encode(&Self::asset_param(buying))
            ));
        }
        let page: Page<OfferResource> = self.get_json(&path, "offers").await?;
        page.embedded
            .records
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    async fn strict_receive_paths(
        &self,
        source: &Asset,
        dest: &Asset,
        dest_amount: Decimal,
    ) -> Result<Vec<PathRecord>> {
        let path = format!(
            "/paths/strict-receive?source_assets={}&destination_asset_type={}&destination_asset_code={}&destination_asset_issuer={}&destination_amount={}",
            urlencoding::encode(&Self::asset_param(source)),
            if dest.code.len() <= 4 {
                "credit_alphanum4"
            } else {
                "credit_alphanum12"
            },
            dest.code,
            dest.issuer,
            dest_amount,
        );
        let page: Page<PathResource> = self.get_json(&path, "paths").await?;
        page.embedded
            .records
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    async fn payments(&self, account: &PublicKey) -> Result<Vec<PaymentRecord>> {
        let mut payments = Vec::new();
        let mut cursor = String::new();
        loop {
            let path = format!(
                "/accounts/{account}/payments?limit={PAGE_LIMIT}&cursor={}",
                urlencoding::encode(&cursor)
            );
            let page: Page<OperationResource> =
                self.get_json(&path, &format!("account {account}")).await?;
            let Some(last) = page.embedded.records.last() else {
                break;
            };
            cursor = last.paging_token.clone();
            for record in page.embedded.records {
                if record.is_payment() {
                    payments.push(record.try_into()?);
                }
            }
        }
        Ok(payments)
    }

    async fn transaction_payments(&self, hash: &str) -> Result<Vec<PaymentRecord>> {
        let path = format!("/transactions/{hash}/payments?limit={PAGE_LIMIT}");
        let page: Page<OperationResource> = self
            .get_json(&path, &format!("transaction {hash}"))
            .await?;
        page.embedded
            .records
            .into_iter()
            .filter(|r| r.is_payment())
            .map(TryInto::try_into)
            .collect()
    }

    async fn operation_payment(&self, id: &str) -> Result<PaymentRecord> {
        let resource: OperationResource = self
            .get_json(&format!("/operations/{id}"), &format!("operation {id}"))
            .await?;
        if !resource.is_payment() {
            return Err(Error::NotFound(format!("operation {id} is not a payment")));
        }
        resource.try_into()
    }

    async fn accounts_for_asset(&self, asset: &Asset, limit: u32) -> Result<Vec<AccountRecord>> {
        let path = format!(
            "/accounts?asset={}&limit={limit}",
            urlencoding::encode(&Self::asset_param(asset))
        );
        let page: Page<AccountResource> = self.get_json(&path, "accounts").await?;
        page.embedded
            .records
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    fn trades(&self, account: &PublicKey, cursor: &str) -> BoxStream<'static, Result<TradeRecord>> {
        let url = format!(
            "{}/accounts/{account}/trades?cursor={}",
            self.base_url,
            urlencoding::encode(cursor)
        );
        let client = self.client.clone();
        let (tx, rx) = mpsc::channel::<Result<TradeRecord>>(32);
        tokio::spawn(async move {
            let response = match client
                .get(&url)
                .header(ACCEPT, "text/event-stream")
                .send()
                .await
                .and_then(|r| r.error_for_status())
            {
                Ok(response) => response,
                Err(err) => {
                    let _ = tx.send(Err(err.into())).await;
                    return;
                }
            };
            let mut body = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = tx.send(Err(err.into())).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(end) = buffer.find("\n\n") {
                    let frame: String = buffer.drain(..end + 2).collect();
                    let Some(data) = sse_data(&frame) else {
                        continue;
                    };
                    // The server sends greeting/keepalive frames.
                    if data == "\"hello\"" || data == "\"byebye\"" {
                        continue;
                    }
                    let record = serde_json::from_str::<TradeResource>(&data)
                        .map_err(Error::from)
                        .and_then(TradeRecord::try_from);
                    match record {
                        Ok(trade) => {
                            if tx.send(Ok(trade)).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!("dropping unparseable trade event: {err}");
                        }
                    }
                }
            }
            let _ = tx
                .send(Err(Error::Stream("trade stream closed by server".to_string())))
                .await;
        });
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }
}

/// Extract the `data:` payload of one server-sent-events frame.
fn sse_data(frame: &str) -> Option<String> {
    let mut data = String::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        }
    }
    if data.is_empty() { None } else { Some(data) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_data_extraction() {
        assert_eq!(sse_data("retry: 1000\n"), None);
        assert_eq!(sse_data("data: \"hello\"\n"), Some("\"hello\"".to_string()));
        assert_eq!(
            sse_data("id: 5\ndata: {\"a\":\ndata: 1}\n"),
            Some("{\"a\":\n1}".to_string())
        );
    }

    #[test]
    fn test_base_url_normalized() {
        let gateway = HttpGateway::new(GatewayOptions {
            base_url: "https://net.example/".to_string(),
        })
        .unwrap();
        assert_eq!(gateway.base_url, "https://net.example");
    }
}
