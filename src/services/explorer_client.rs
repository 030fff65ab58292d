use crate::config::network::REQUEST_TIMEOUT;
use crate::error::{StakingError, StakingResult};
use crate::staking::transactions::FundingUtxo;
use async_trait::async_trait;
use bitcoin::{consensus::encode::deserialize, OutPoint, ScriptBuf, Transaction, Txid};
use reqwest::{Client, Response};
use serde::Deserialize;
use std::str::FromStr;

/// Address information from the esplora API
#[derive(Debug, Deserialize)]
pub struct AddressInfo {
    #[serde(rename = "chain_stats")]
    pub chain_stats: ChainStats,
}

/// Chain statistics for an address
#[derive(Debug, Deserialize)]
pub struct ChainStats {
    #[serde(rename = "funded_txo_sum")]
    pub funded_txo_sum: u64,
    #[serde(rename = "spent_txo_sum")]
    pub spent_txo_sum: u64,
}

impl AddressInfo {
    /// Get the confirmed balance (funded - spent)
    pub fn get_balance(&self) -> u64 {
        self.chain_stats
            .funded_txo_sum
            .saturating_sub(self.chain_stats.spent_txo_sum)
    }
}

/// Confirmation status of an explorer UTXO
#[derive(Debug, Clone, Deserialize)]
pub struct UtxoStatus {
    pub confirmed: bool,
    #[serde(default)]
    pub block_height: Option<u32>,
}

/// UTXO as returned by `/address/{address}/utxo`
#[derive(Debug, Clone, Deserialize)]
pub struct ExplorerUtxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub status: UtxoStatus,
}

/// Recommended fee rates in sat/vB from `/v1/fees/recommended`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeEstimates {
    pub fastest_fee: u64,
    pub half_hour_fee: u64,
    pub hour_fee: u64,
    pub economy_fee: u64,
    pub minimum_fee: u64,
}

/// Response of `/v1/validate-address/{address}`
#[derive(Debug, Clone, Deserialize)]
pub struct AddressValidation {
    pub isvalid: bool,
    #[serde(rename = "scriptPubKey", default)]
    pub script_pub_key: Option<String>,
}

/// Chain data and broadcast collaborator used by the CLI
#[async_trait]
pub trait ChainBackend: Send + Sync {
    async fn get_utxos(&self, address: &str) -> StakingResult<Vec<ExplorerUtxo>>;

    async fn get_network_fees(&self) -> StakingResult<FeeEstimates>;

    async fn get_block_height(&self) -> StakingResult<u32>;

    /// Broadcast a raw transaction; the remote rejection body is passed through
    async fn broadcast(&self, tx_hex: &str) -> StakingResult<Txid>;

    async fn get_transaction_hex(&self, txid: &Txid) -> StakingResult<String>;

    async fn validate_address(&self, address: &str) -> StakingResult<AddressValidation>;

    async fn get_address_balance(&self, address: &str) -> StakingResult<u64>;

    /// Decoded transaction by id
    async fn get_transaction(&self, txid: &Txid) -> StakingResult<Transaction> {
        let tx_hex = self.get_transaction_hex(txid).await?;
        let bytes = hex::decode(tx_hex.trim())
            .map_err(|e| StakingError::transaction(format!("Explorer returned non-hex transaction: {}", e)))?;
        deserialize(&bytes)
            .map_err(|e| StakingError::transaction(format!("Undecodable transaction {}: {}", txid, e)))
    }

    /// Confirmed UTXOs of `address` covering `min_amount`, largest first
    ///
    /// Returns an empty list when the address cannot cover the amount.
    async fn get_funding_utxos(
        &self,
        address: &str,
        min_amount: u64,
    ) -> StakingResult<Vec<FundingUtxo>> {
        let validation = self.validate_address(address).await?;
        let script_pubkey = match (validation.isvalid, validation.script_pub_key) {
            (true, Some(spk)) => ScriptBuf::from_hex(&spk).map_err(|_| StakingError::InvalidAddress {
                address: address.to_string(),
            })?,
            _ => {
                return Err(StakingError::InvalidAddress {
                    address: address.to_string(),
                })
            }
        };

        let utxos = self.get_utxos(address).await?;
        select_funding_utxos(&utxos, min_amount)
            .into_iter()
            .map(|utxo| {
                let txid = Txid::from_str(&utxo.txid).map_err(|e| {
                    StakingError::transaction(format!("Explorer returned invalid txid {}: {}", utxo.txid, e))
                })?;
                Ok(FundingUtxo {
                    outpoint: OutPoint {
                        txid,
                        vout: utxo.vout,
                    },
                    value: utxo.value,
                    script_pubkey: script_pubkey.clone(),
                })
            })
            .collect()
    }
}

/// Smallest prefix of confirmed UTXOs, sorted by value descending, whose sum
/// reaches `min_amount`; empty if no prefix does
pub fn select_funding_utxos(utxos: &[ExplorerUtxo], min_amount: u64) -> Vec<ExplorerUtxo> {
    let mut confirmed: Vec<ExplorerUtxo> = utxos
        .iter()
        .filter(|utxo| utxo.status.confirmed)
        .cloned()
        .collect();
    confirmed.sort_by(|a, b| b.value.cmp(&a.value));

    let mut total = 0u64;
    let mut selected = Vec::new();
    for utxo in confirmed {
        if total >= min_amount && !selected.is_empty() {
            break;
        }
        total += utxo.value;
        selected.push(utxo);
    }

    if total >= min_amount {
        selected
    } else {
        Vec::new()
    }
}

/// Client for an esplora-compatible block explorer API (mempool.space)
#[derive(Debug, Clone)]
pub struct EsploraClient {
    client: Client,
    api_base: String,
}

impl EsploraClient {
    /// Create a new explorer client
    pub fn new(api_base: &str) -> StakingResult<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn get(&self, path: &str) -> StakingResult<Response> {
        let response = self.client.get(self.url(path)).send().await?;
        check_status(response).await
    }

    /// Get address information from the explorer API
    pub async fn get_address_info(&self, address: &str) -> StakingResult<AddressInfo> {
        let response = self.get(&format!("/address/{}", address)).await?;
        Ok(response.json().await?)
    }
}

async fn check_status(response: Response) -> StakingResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StakingError::Explorer {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ChainBackend for EsploraClient {
    async fn get_utxos(&self, address: &str) -> StakingResult<Vec<ExplorerUtxo>> {
        let response = self.get(&format!("/address/{}/utxo", address)).await?;
        Ok(response.json().await?)
    }

    async fn get_network_fees(&self) -> StakingResult<FeeEstimates> {
        let response = self.get("/v1/fees/recommended").await?;
        Ok(response.json().await?)
    }

    async fn get_block_height(&self) -> StakingResult<u32> {
        let body = self.get("/blocks/tip/height").await?.text().await?;
        body.trim()
            .parse()
            .map_err(|_| StakingError::Explorer {
                status: 200,
                body,
            })
    }

    async fn broadcast(&self, tx_hex: &str) -> StakingResult<Txid> {
        let response = self
            .client
            .post(self.url("/tx"))
            .body(tx_hex.to_string())
            .send()
            .await?;
        let body = check_status(response).await?.text().await?;

        let txid = Txid::from_str(body.trim()).map_err(|_| StakingError::Explorer {
            status: 200,
            body: body.clone(),
        })?;
        log::info!("Broadcast transaction {}", txid);
        Ok(txid)
    }

    async fn get_transaction_hex(&self, txid: &Txid) -> StakingResult<String> {
        Ok(self.get(&format!("/tx/{}/hex", txid)).await?.text().await?)
    }

    async fn validate_address(&self, address: &str) -> StakingResult<AddressValidation> {
        let response = self.get(&format!("/v1/validate-address/{}", address)).await?;
        Ok(response.json().await?)
    }

    async fn get_address_balance(&self, address: &str) -> StakingResult<u64> {
        let info = self.get_address_info(address).await?;
        Ok(info.get_balance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::network::DEFAULT_ESPLORA_URL;

    fn utxo(txid_byte: u8, value: u64, confirmed: bool) -> ExplorerUtxo {
        ExplorerUtxo {
            txid: format!("{:02x}", txid_byte).repeat(32),
            vout: 0,
            value,
            status: UtxoStatus {
                confirmed,
                block_height: confirmed.then_some(100),
            },
        }
    }

    #[test]
    fn test_select_minimal_prefix() {
        let utxos = vec![utxo(1, 200, true), utxo(2, 500, true), utxo(3, 300, true)];

        let selected = select_funding_utxos(&utxos, 700);
        let values: Vec<u64> = selected.iter().map(|u| u.value).collect();
        assert_eq!(values, vec![500, 300]);

        assert!(select_funding_utxos(&utxos, 1200).is_empty());

        let all: Vec<u64> = select_funding_utxos(&utxos, 1000).iter().map(|u| u.value).collect();
        assert_eq!(all, vec![500, 300, 200]);
    }

    #[test]
    fn test_select_skips_unconfirmed() {
        let utxos = vec![utxo(1, 5_000, false), utxo(2, 500, true)];
        assert_eq!(select_funding_utxos(&utxos, 400).len(), 1);
        assert!(select_funding_utxos(&utxos, 1_000).is_empty());
    }

    #[test]
    fn test_parse_explorer_payloads() {
        let utxos: Vec<ExplorerUtxo> = serde_json::from_str(
            r#"[{"txid":"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa","vout":1,
                "status":{"confirmed":true,"block_height":2000,"block_hash":"00","block_time":1},
                "value":12345}]"#,
        )
        .unwrap();
        assert_eq!(utxos[0].value, 12345);
        assert!(utxos[0].status.confirmed);

        let fees: FeeEstimates = serde_json::from_str(
            r#"{"fastestFee":12,"halfHourFee":8,"hourFee":5,"economyFee":2,"minimumFee":1}"#,
        )
        .unwrap();
        assert_eq!(fees.half_hour_fee, 8);

        let validation: AddressValidation = serde_json::from_str(
            r#"{"isvalid":true,"address":"tb1p...","scriptPubKey":"5120aa","isscript":false,"iswitness":true}"#,
        )
        .unwrap();
        assert_eq!(validation.script_pub_key.as_deref(), Some("5120aa"));

        let invalid: AddressValidation =
            serde_json::from_str(r#"{"isvalid":false,"error":"Invalid Bech32 address"}"#).unwrap();
        assert!(!invalid.isvalid);
    }

    #[test]
    fn test_client_trims_base_url() {
        let client = EsploraClient::new("https://mempool.space/signet/api/").unwrap();
        assert_eq!(client.url("/tx"), "https://mempool.space/signet/api/tx");
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_block_height_live() {
        let client = EsploraClient::new(DEFAULT_ESPLORA_URL).unwrap();
        let height = client.get_block_height().await.unwrap();
        assert!(height > 0);
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_fees_live() {
        let client = EsploraClient::new(DEFAULT_ESPLORA_URL).unwrap();
        let fees = client.get_network_fees().await.unwrap();
        assert!(fees.fastest_fee >= fees.minimum_fee);
    }
}
