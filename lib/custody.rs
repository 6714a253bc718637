//! Multisig custody capability.
//!
//! Funds never pass through this service. A competition's vault is a
//! multi-owner account in an external custody service; the node only
//! predicts vault addresses, reads balances and relays the
//! propose/confirm/execute flow. Signing keys stay with the owners.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use futures::future::BoxFuture;
use jsonrpsee::{
    core::RpcResult,
    http_client::{HttpClient, HttpClientBuilder},
    proc_macros::rpc,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::types::Address;

#[derive(Debug, Error)]
pub enum Error {
    #[error("custody service request failed")]
    Rpc(#[from] jsonrpsee::core::ClientError),
    #[error("threshold {threshold} is invalid for {owners} owners")]
    InvalidThreshold { threshold: u32, owners: usize },
    #[error("unknown vault {0}")]
    UnknownVault(Address),
    #[error("unknown custody transaction {0}")]
    UnknownTransaction(String),
    #[error("{signer} is not an owner of vault {vault}")]
    NotOwner { vault: Address, signer: Address },
    #[error(
        "transaction {hash} has {confirmations} of {required} confirmations"
    )]
    NotEnoughConfirmations {
        hash: String,
        confirmations: u32,
        required: u32,
    },
    #[error("transaction {0} was already executed")]
    AlreadyExecuted(String),
    #[error("vault holds {available}, cannot send {requested}")]
    InsufficientBalance { available: f64, requested: f64 },
}

impl Error {
    pub fn code(&self) -> &'static str {
        "CUSTODY_ERROR"
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct Balance {
    pub native: f64,
    pub tokens: BTreeMap<String, f64>,
}

/// A transfer out of a vault awaiting owner signatures
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct Proposal {
    pub vault: Address,
    pub proposer: Address,
    pub to: Address,
    pub value: f64,
    pub data: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, ToSchema)]
pub struct CustodyTransaction {
    pub hash: String,
    pub vault: Address,
    pub to: Address,
    pub value: f64,
    /// Owners that have signed
    pub confirmations: Vec<Address>,
    pub required: u32,
    pub executed: bool,
}

impl CustodyTransaction {
    pub fn confirmation_count(&self) -> u32 {
        self.confirmations.len() as u32
    }

    pub fn is_executable(&self) -> bool {
        !self.executed && self.confirmation_count() >= self.required
    }
}

pub trait Custody: Send + Sync {
    /// Deterministic address of the vault owned by `owners`
    fn predict_address(
        &self,
        owners: Vec<Address>,
        threshold: u32,
        salt: String,
    ) -> BoxFuture<'_, Result<Address, Error>>;

    fn get_balance(
        &self,
        address: Address,
    ) -> BoxFuture<'_, Result<Balance, Error>>;

    fn propose_transaction(
        &self,
        proposal: Proposal,
    ) -> BoxFuture<'_, Result<CustodyTransaction, Error>>;

    fn confirm_transaction(
        &self,
        hash: String,
        signer: Address,
    ) -> BoxFuture<'_, Result<CustodyTransaction, Error>>;

    fn execute_transaction(
        &self,
        hash: String,
    ) -> BoxFuture<'_, Result<CustodyTransaction, Error>>;

    fn get_transaction(
        &self,
        hash: String,
    ) -> BoxFuture<'_, Result<CustodyTransaction, Error>>;
}

/// JSON-RPC interface of the external custody service
#[rpc(client, namespace = "custody")]
pub trait CustodyService {
    #[method(name = "predictAddress")]
    async fn predict_address(
        &self,
        owners: Vec<Address>,
        threshold: u32,
        salt: String,
    ) -> RpcResult<Address>;

    #[method(name = "getBalance")]
    async fn get_balance(&self, address: Address) -> RpcResult<Balance>;

    #[method(name = "proposeTransaction")]
    async fn propose_transaction(
        &self,
        proposal: Proposal,
    ) -> RpcResult<CustodyTransaction>;

    #[method(name = "confirmTransaction")]
    async fn confirm_transaction(
        &self,
        hash: String,
        signer: Address,
    ) -> RpcResult<CustodyTransaction>;

    #[method(name = "executeTransaction")]
    async fn execute_transaction(
        &self,
        hash: String,
    ) -> RpcResult<CustodyTransaction>;

    #[method(name = "getTransaction")]
    async fn get_transaction(
        &self,
        hash: String,
    ) -> RpcResult<CustodyTransaction>;
}

/// Custody backed by the external service over JSON-RPC
#[derive(Clone, Debug)]
pub struct RpcCustody {
    client: HttpClient,
}

impl RpcCustody {
    pub fn new(url: &url::Url, timeout: Duration) -> Result<Self, Error> {
        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(url.as_str())?;
        Ok(Self { client })
    }
}

impl Custody for RpcCustody {
    fn predict_address(
        &self,
        owners: Vec<Address>,
        threshold: u32,
        salt: String,
    ) -> BoxFuture<'_, Result<Address, Error>> {
        Box::pin(async move {
            Ok(CustodyServiceClient::predict_address(
                &self.client,
                owners,
                threshold,
                salt,
            )
            .await?)
        })
    }

    fn get_balance(
        &self,
        address: Address,
    ) -> BoxFuture<'_, Result<Balance, Error>> {
        Box::pin(async move {
            Ok(CustodyServiceClient::get_balance(&self.client, address).await?)
        })
    }

    fn propose_transaction(
        &self,
        proposal: Proposal,
    ) -> BoxFuture<'_, Result<CustodyTransaction, Error>> {
        Box::pin(async move {
            Ok(
                CustodyServiceClient::propose_transaction(&self.client, proposal)
                    .await?,
            )
        })
    }

    fn confirm_transaction(
        &self,
        hash: String,
        signer: Address,
    ) -> BoxFuture<'_, Result<CustodyTransaction, Error>> {
        Box::pin(async move {
            Ok(CustodyServiceClient::confirm_transaction(
                &self.client,
                hash,
                signer,
            )
            .await?)
        })
    }

    fn execute_transaction(
        &self,
        hash: String,
    ) -> BoxFuture<'_, Result<CustodyTransaction, Error>> {
        Box::pin(async move {
            Ok(CustodyServiceClient::execute_transaction(&self.client, hash)
                .await?)
        })
    }

    fn get_transaction(
        &self,
        hash: String,
    ) -> BoxFuture<'_, Result<CustodyTransaction, Error>> {
        Box::pin(async move {
            Ok(CustodyServiceClient::get_transaction(&self.client, hash)
                .await?)
        })
    }
}

#[derive(Clone, Debug)]
struct Vault {
    owners: Vec<Address>,
    threshold: u32,
}

#[derive(Debug, Default)]
struct Ledger {
    vaults: HashMap<Address, Vault>,
    balances: HashMap<Address, Balance>,
    transactions: HashMap<String, CustodyTransaction>,
    nonce: u64,
}

/// In-process custody used in tests and when no service is configured
#[derive(Debug, Default)]
pub struct MemoryCustody {
    ledger: Mutex<Ledger>,
}

impl MemoryCustody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit native funds to `address`
    pub fn deposit(&self, address: &Address, amount: f64) {
        let mut ledger = self.ledger.lock();
        ledger
            .balances
            .entry(address.clone())
            .or_default()
            .native += amount;
    }

    fn derive_address(owners: &[Address], threshold: u32, salt: &str) -> Address {
        let mut owners = owners.to_vec();
        owners.sort();
        let mut hasher = blake3::Hasher::new();
        for owner in &owners {
            hasher.update(owner.as_str().as_bytes());
        }
        hasher.update(&threshold.to_be_bytes());
        hasher.update(salt.as_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&hash.as_bytes()[12..]);
        Address::from_bytes(bytes)
    }

    fn register(
        &self,
        owners: Vec<Address>,
        threshold: u32,
        salt: &str,
    ) -> Result<Address, Error> {
        if threshold == 0 || threshold as usize > owners.len() {
            return Err(Error::InvalidThreshold {
                threshold,
                owners: owners.len(),
            });
        }
        let address = Self::derive_address(&owners, threshold, salt);
        let mut ledger = self.ledger.lock();
        ledger
            .vaults
            .entry(address.clone())
            .or_insert(Vault { owners, threshold });
        Ok(address)
    }

    fn propose(&self, proposal: Proposal) -> Result<CustodyTransaction, Error> {
        let mut ledger = self.ledger.lock();
        let vault = ledger
            .vaults
            .get(&proposal.vault)
            .cloned()
            .ok_or_else(|| Error::UnknownVault(proposal.vault.clone()))?;
        if !vault.owners.contains(&proposal.proposer) {
            return Err(Error::NotOwner {
                vault: proposal.vault,
                signer: proposal.proposer,
            });
        }
        ledger.nonce += 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(proposal.vault.as_str().as_bytes());
        hasher.update(proposal.to.as_str().as_bytes());
        hasher.update(&proposal.value.to_be_bytes());
        hasher.update(&ledger.nonce.to_be_bytes());
        let hash = format!("0x{}", hasher.finalize().to_hex());
        let transaction = CustodyTransaction {
            hash: hash.clone(),
            vault: proposal.vault,
            to: proposal.to,
            value: proposal.value,
            confirmations: vec![proposal.proposer],
            required: vault.threshold,
            executed: false,
        };
        ledger.transactions.insert(hash, transaction.clone());
        Ok(transaction)
    }

    fn confirm(
        &self,
        hash: &str,
        signer: Address,
    ) -> Result<CustodyTransaction, Error> {
        let mut ledger = self.ledger.lock();
        let Ledger {
            vaults,
            transactions,
            ..
        } = &mut *ledger;
        let transaction = transactions
            .get_mut(hash)
            .ok_or_else(|| Error::UnknownTransaction(hash.to_owned()))?;
        let vault = vaults
            .get(&transaction.vault)
            .ok_or_else(|| Error::UnknownVault(transaction.vault.clone()))?;
        if !vault.owners.contains(&signer) {
            return Err(Error::NotOwner {
                vault: transaction.vault.clone(),
                signer,
            });
        }
        if transaction.executed {
            return Err(Error::AlreadyExecuted(hash.to_owned()));
        }
        if !transaction.confirmations.contains(&signer) {
            transaction.confirmations.push(signer);
        }
        Ok(transaction.clone())
    }

    fn execute(&self, hash: &str) -> Result<CustodyTransaction, Error> {
        let mut ledger = self.ledger.lock();
        let Ledger {
            balances,
            transactions,
            ..
        } = &mut *ledger;
        let transaction = transactions
            .get_mut(hash)
            .ok_or_else(|| Error::UnknownTransaction(hash.to_owned()))?;
        if transaction.executed {
            return Err(Error::AlreadyExecuted(hash.to_owned()));
        }
        if transaction.confirmation_count() < transaction.required {
            return Err(Error::NotEnoughConfirmations {
                hash: hash.to_owned(),
                confirmations: transaction.confirmation_count(),
                required: transaction.required,
            });
        }
        let available = balances
            .get(&transaction.vault)
            .map_or(0.0, |balance| balance.native);
        if available < transaction.value {
            return Err(Error::InsufficientBalance {
                available,
                requested: transaction.value,
            });
        }
        balances.entry(transaction.vault.clone()).or_default().native -=
            transaction.value;
        balances.entry(transaction.to.clone()).or_default().native +=
            transaction.value;
        transaction.executed = true;
        Ok(transaction.clone())
    }
}

impl Custody for MemoryCustody {
    fn predict_address(
        &self,
        owners: Vec<Address>,
        threshold: u32,
        salt: String,
    ) -> BoxFuture<'_, Result<Address, Error>> {
        Box::pin(async move { self.register(owners, threshold, &salt) })
    }

    fn get_balance(
        &self,
        address: Address,
    ) -> BoxFuture<'_, Result<Balance, Error>> {
        Box::pin(async move {
            Ok(self
                .ledger
                .lock()
                .balances
                .get(&address)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn propose_transaction(
        &self,
        proposal: Proposal,
    ) -> BoxFuture<'_, Result<CustodyTransaction, Error>> {
        Box::pin(async move { self.propose(proposal) })
    }

    fn confirm_transaction(
        &self,
        hash: String,
        signer: Address,
    ) -> BoxFuture<'_, Result<CustodyTransaction, Error>> {
        Box::pin(async move { self.confirm(&hash, signer) })
    }

    fn execute_transaction(
        &self,
        hash: String,
    ) -> BoxFuture<'_, Result<CustodyTransaction, Error>> {
        Box::pin(async move { self.execute(&hash) })
    }

    fn get_transaction(
        &self,
        hash: String,
    ) -> BoxFuture<'_, Result<CustodyTransaction, Error>> {
        Box::pin(async move {
            self.ledger
                .lock()
                .transactions
                .get(&hash)
                .cloned()
                .ok_or(Error::UnknownTransaction(hash))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{:040x}", n)).unwrap()
    }

    #[tokio::test]
    async fn vault_address_is_deterministic() {
        let custody = MemoryCustody::new();
        let a = custody
            .predict_address(vec![addr(1), addr(2)], 2, "salt".into())
            .await
            .unwrap();
        let b = custody
            .predict_address(vec![addr(2), addr(1)], 2, "salt".into())
            .await
            .unwrap();
        let c = custody
            .predict_address(vec![addr(1), addr(2)], 2, "other".into())
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(matches!(
            custody.predict_address(vec![addr(1)], 2, "x".into()).await,
            Err(Error::InvalidThreshold { .. })
        ));
    }

    #[tokio::test]
    async fn execution_needs_threshold_confirmations() {
        let custody = MemoryCustody::new();
        let vault = custody
            .predict_address(vec![addr(1), addr(2), addr(3)], 2, "v".into())
            .await
            .unwrap();
        custody.deposit(&vault, 100.0);
        let proposal = Proposal {
            vault: vault.clone(),
            proposer: addr(1),
            to: addr(9),
            value: 40.0,
            data: None,
        };
        let tx = custody.propose_transaction(proposal).await.unwrap();
        assert_eq!(tx.confirmation_count(), 1);
        assert!(matches!(
            custody.execute_transaction(tx.hash.clone()).await,
            Err(Error::NotEnoughConfirmations { .. })
        ));
        assert!(matches!(
            custody.confirm_transaction(tx.hash.clone(), addr(7)).await,
            Err(Error::NotOwner { .. })
        ));
        let tx = custody
            .confirm_transaction(tx.hash.clone(), addr(2))
            .await
            .unwrap();
        assert!(tx.is_executable());
        let tx = custody.execute_transaction(tx.hash).await.unwrap();
        assert!(tx.executed);
        assert_eq!(custody.get_balance(vault).await.unwrap().native, 60.0);
        assert_eq!(custody.get_balance(addr(9)).await.unwrap().native, 40.0);
        let fetched = custody.get_transaction(tx.hash.clone()).await.unwrap();
        assert_eq!(fetched, tx);
    }
}
