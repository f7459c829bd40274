//! EVM chain interaction abstraction.
//!
//! This crate provides two traits for interacting with EVM chains:
//!
//! - [`Evm`] -- read-only chain access. Provides the underlying provider
//!   and a raw `call` that surfaces Solidity revert data when an
//!   `eth_call` reverts.
//!
//! - [`Wallet`] -- extends `Evm` with a signing identity and
//!   transaction submission. [`PrivateKeyWallet`](local::PrivateKeyWallet)
//!   signs locally with a key loaded from the secrets file.
//!
//! [`view`] and [`submit`] are typed wrappers over the raw calls that
//! take `sol!`-generated call structs, so consumers never hand-encode
//! calldata.

use std::sync::Arc;

use alloy::primitives::{Address, Bytes};
use alloy::providers::Provider;
use alloy::rpc::types::TransactionReceipt;
use alloy::sol_types::SolCall;
use async_trait::async_trait;

pub mod local;

/// Errors that can occur during EVM operations.
#[derive(Debug, thiserror::Error)]
pub enum EvmError {
    #[error("transaction error: {0}")]
    Transaction(#[from] alloy::providers::PendingTransactionError),
    #[error("transport error: {0}")]
    Transport(#[from] alloy::transports::RpcError<alloy::transports::TransportErrorKind>),
    #[error("contract error: {0}")]
    Contract(#[from] alloy::contract::Error),
    #[error("ABI decoding error: {0}")]
    SolType(#[from] alloy::sol_types::Error),
    #[error("call to {contract} reverted with data {data}")]
    CallReverted { contract: Address, data: Bytes },
    #[error("transaction reverted: {tx_hash}")]
    Reverted { tx_hash: alloy::primitives::TxHash },
}

/// Read-only EVM chain access.
///
/// Implementations only need to supply the provider; `call` has a
/// default implementation that extracts revert data from failed calls.
#[async_trait]
pub trait Evm: Send + Sync + 'static {
    /// The provider type used for chain access.
    type Provider: Provider + Clone + Send + Sync;

    /// Returns the underlying provider for direct chain queries.
    fn provider(&self) -> &Self::Provider;

    /// Execute a view call against `contract` with raw calldata.
    ///
    /// On revert the raw revert payload is returned in
    /// [`EvmError::CallReverted`] so the caller can log it.
    async fn call(&self, contract: Address, calldata: Bytes) -> Result<Bytes, EvmError> {
        let tx = alloy::rpc::types::TransactionRequest::default()
            .to(contract)
            .input(calldata.into());

        match self.provider().call(tx).await {
            Ok(result) => Ok(result),
            Err(rpc_err) => {
                let contract_err = alloy::contract::Error::TransportError(rpc_err);

                if let Some(data) = contract_err.as_revert_data() {
                    return Err(EvmError::CallReverted { contract, data });
                }

                Err(EvmError::Contract(contract_err))
            }
        }
    }
}

/// Signing wallet on an EVM chain.
///
/// Extends [`Evm`] with a wallet identity (address) and transaction
/// submission. `send` submits a signed transaction and waits for a
/// successful receipt.
#[async_trait]
pub trait Wallet: Evm {
    /// Returns the address this wallet signs transactions from.
    fn address(&self) -> Address;

    /// Submit a signed contract call transaction.
    ///
    /// - `contract` -- target contract address
    /// - `calldata` -- ABI-encoded function call
    /// - `note` -- human-readable operation description, used for logging
    async fn send(
        &self,
        contract: Address,
        calldata: Bytes,
        note: &str,
    ) -> Result<TransactionReceipt, EvmError>;
}

#[async_trait]
impl<T: Evm> Evm for Arc<T> {
    type Provider = T::Provider;

    fn provider(&self) -> &Self::Provider {
        (**self).provider()
    }

    async fn call(&self, contract: Address, calldata: Bytes) -> Result<Bytes, EvmError> {
        (**self).call(contract, calldata).await
    }
}

#[async_trait]
impl<T: Wallet> Wallet for Arc<T> {
    fn address(&self) -> Address {
        (**self).address()
    }

    async fn send(
        &self,
        contract: Address,
        calldata: Bytes,
        note: &str,
    ) -> Result<TransactionReceipt, EvmError> {
        (**self).send(contract, calldata, note).await
    }
}

/// Typed view call: encodes `call`, runs it through [`Evm::call`] and
/// decodes the return data.
pub async fn view<E, C>(evm: &E, contract: Address, call: C) -> Result<C::Return, EvmError>
where
    E: Evm + ?Sized,
    C: SolCall + Send,
{
    let output = evm.call(contract, Bytes::from(call.abi_encode())).await?;
    Ok(C::abi_decode_returns(&output)?)
}

/// Typed transaction submission through [`Wallet::send`].
pub async fn submit<W, C>(
    wallet: &W,
    contract: Address,
    call: C,
    note: &str,
) -> Result<TransactionReceipt, EvmError>
where
    W: Wallet + ?Sized,
    C: SolCall + Send,
{
    wallet
        .send(contract, Bytes::from(call.abi_encode()), note)
        .await
}

#[cfg(test)]
mod tests {
    use alloy::network::EthereumWallet;
    use alloy::primitives::{U256, address};
    use alloy::providers::{ProviderBuilder, WalletProvider};
    use alloy::providers::mock::Asserter;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::sol;

    use super::*;
    use crate::local::PrivateKeyWallet;

    sol! {
        interface IToken {
            function balanceOf(address account) external view returns (uint256);
            function decimals() external view returns (uint8);
        }
    }

    fn mocked_wallet(
        asserter: Asserter,
    ) -> PrivateKeyWallet<impl Provider + WalletProvider + Clone + 'static> {
        let signer = PrivateKeySigner::random();
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_mocked_client(asserter);

        PrivateKeyWallet::new(provider, 1)
    }

    #[tokio::test]
    async fn view_decodes_single_return_value() {
        let asserter = Asserter::new();
        asserter.push_success(&Bytes::from(
            IToken::balanceOfCall::abi_encode_returns(&U256::from(42_u64)),
        ));
        let wallet = mocked_wallet(asserter);

        let balance = view(
            &wallet,
            address!("0x1111111111111111111111111111111111111111"),
            IToken::balanceOfCall {
                account: address!("0x2222222222222222222222222222222222222222"),
            },
        )
        .await
        .unwrap();

        assert_eq!(balance, U256::from(42_u64));
    }

    #[tokio::test]
    async fn view_surfaces_transport_failures() {
        let asserter = Asserter::new();
        asserter.push_failure_msg("node unavailable");
        let wallet = mocked_wallet(asserter);

        let error = view(
            &wallet,
            address!("0x1111111111111111111111111111111111111111"),
            IToken::decimalsCall {},
        )
        .await
        .unwrap_err();

        assert!(
            matches!(error, EvmError::Contract(_) | EvmError::Transport(_)),
            "unexpected error: {error:?}"
        );
    }

    #[tokio::test]
    async fn view_rejects_malformed_return_data() {
        let asserter = Asserter::new();
        asserter.push_success(&Bytes::from(vec![0x01, 0x02]));
        let wallet = mocked_wallet(asserter);

        let error = view(
            &wallet,
            address!("0x1111111111111111111111111111111111111111"),
            IToken::decimalsCall {},
        )
        .await
        .unwrap_err();

        assert!(matches!(error, EvmError::SolType(_)), "unexpected error: {error:?}");
    }
}
