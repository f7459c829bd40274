//! Hot-key wallet for the rebalancer.
//!
//! [`PrivateKeyWallet`] signs with the key embedded in its provider's
//! wallet filler, so it is only meant for a dedicated operator account.
//! Every call is held until it has `required_confirmations` blocks on
//! top of it, and the confirmed receipt is logged with the gas it burned.

use alloy::primitives::{Address, Bytes, TxHash};
use alloy::providers::{PendingTransactionBuilder, Provider, WalletProvider};
use alloy::rpc::types::{TransactionReceipt, TransactionRequest};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{Evm, EvmError, Wallet};

/// Signs and broadcasts from the provider's default signer.
///
/// Build the provider with `ProviderBuilder::new().wallet(..)` so nonce,
/// gas and chain id are filled in before signing.
pub struct PrivateKeyWallet<P> {
    provider: P,
    required_confirmations: u64,
}

impl<P> PrivateKeyWallet<P> {
    /// A confirmation depth of 0 is raised to 1: a receipt is always
    /// awaited.
    pub fn new(provider: P, required_confirmations: u64) -> Self {
        Self {
            provider,
            required_confirmations: required_confirmations.max(1),
        }
    }
}

impl<P> PrivateKeyWallet<P>
where
    P: Provider + WalletProvider + Clone + Send + Sync + 'static,
{
    async fn broadcast(
        &self,
        contract: Address,
        calldata: Bytes,
        note: &str,
    ) -> Result<PendingTransactionBuilder<alloy::network::Ethereum>, EvmError> {
        let request = TransactionRequest::default()
            .from(self.address())
            .to(contract)
            .input(calldata.into());

        debug!(%contract, note, "Broadcasting signed call");
        Ok(self.provider.send_transaction(request).await?)
    }

    fn settle(receipt: TransactionReceipt, note: &str) -> Result<TransactionReceipt, EvmError> {
        let tx_hash: TxHash = receipt.transaction_hash;
        let cost_wei = u128::from(receipt.gas_used).saturating_mul(receipt.effective_gas_price);

        if !receipt.status() {
            warn!(%tx_hash, gas_used = receipt.gas_used, note, "Call reverted on chain");
            return Err(EvmError::Reverted { tx_hash });
        }

        info!(
            %tx_hash,
            block = ?receipt.block_number,
            gas_used = receipt.gas_used,
            cost_wei = %cost_wei,
            note,
            "Call confirmed"
        );
        Ok(receipt)
    }
}

#[async_trait]
impl<P> Evm for PrivateKeyWallet<P>
where
    P: Provider + WalletProvider + Clone + Send + Sync + 'static,
{
    type Provider = P;

    fn provider(&self) -> &P {
        &self.provider
    }
}

#[async_trait]
impl<P> Wallet for PrivateKeyWallet<P>
where
    P: Provider + WalletProvider + Clone + Send + Sync + 'static,
{
    fn address(&self) -> Address {
        self.provider.default_signer_address()
    }

    async fn send(
        &self,
        contract: Address,
        calldata: Bytes,
        note: &str,
    ) -> Result<TransactionReceipt, EvmError> {
        let pending = self.broadcast(contract, calldata, note).await?;
        info!(
            tx_hash = %pending.tx_hash(),
            confirmations = self.required_confirmations,
            note,
            "Waiting for confirmations"
        );

        let receipt = pending
            .with_required_confirmations(self.required_confirmations)
            .get_receipt()
            .await?;

        Self::settle(receipt, note)
    }
}
