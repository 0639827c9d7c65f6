//! Transaction submission on the fork.
//!
//! Transactions are sent unsigned with an explicit `from`; Anvil accepts
//! that for impersonated and development accounts. A receipt with a failed
//! status is an error, as is a call rejected before inclusion.

use alloy::contract::{CallBuilder, CallDecoder};
use alloy::network::TransactionBuilder as _;
use alloy::primitives::{Address, Bytes, TxHash};
use alloy::providers::{PendingTransactionError, Provider};
use alloy::rpc::types::{Log, TransactionReceipt, TransactionRequest};
use alloy::transports::{RpcError, TransportErrorKind};
use tracing::{debug, info, warn};

use crate::bindings::IStrategy;

#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("{action} was rejected: {source}")]
    Rejected {
        action: String,
        #[source]
        source: alloy::contract::Error,
    },
    #[error("{action} was rejected by the node: {source}")]
    Rpc {
        action: String,
        #[source]
        source: RpcError<TransportErrorKind>,
    },
    #[error("{action} reverted in {tx_hash}")]
    Reverted { action: String, tx_hash: TxHash },
    #[error("failed to fetch receipt of {action}: {source}")]
    Receipt {
        action: String,
        #[source]
        source: PendingTransactionError,
    },
    #[error("{action} succeeded in {tx_hash} but was expected to revert")]
    DidNotRevert { action: String, tx_hash: TxHash },
    #[error("{action} emitted no Harvested event")]
    NoHarvestedEvent { action: String },
}

/// Sends `call` from `from` and waits for a successful receipt.
pub async fn send<P, D>(
    action: &str,
    call: CallBuilder<P, D>,
    from: Address,
) -> Result<TransactionReceipt, TxError>
where
    P: Provider,
    D: CallDecoder,
{
    debug!(action, %from, "Sending transaction");

    let pending = call
        .from(from)
        .send()
        .await
        .map_err(|source| {
            warn!(action, %source, "Transaction rejected");
            TxError::Rejected {
                action: action.to_owned(),
                source,
            }
        })?;

    let receipt = pending
        .get_receipt()
        .await
        .map_err(|source| TxError::Receipt {
            action: action.to_owned(),
            source,
        })?;

    ensure_success(action, &receipt)?;
    debug!(action, tx_hash = %receipt.transaction_hash, gas_used = receipt.gas_used, "Transaction mined");
    Ok(receipt)
}

/// Sends a raw transaction request (deployments, hand-encoded calls).
pub async fn send_request<P: Provider>(
    action: &str,
    provider: &P,
    request: TransactionRequest,
) -> Result<TransactionReceipt, TxError> {
    let pending = provider
        .send_transaction(request)
        .await
        .map_err(|source| TxError::Rpc {
            action: action.to_owned(),
            source,
        })?;

    let receipt = pending
        .get_receipt()
        .await
        .map_err(|source| TxError::Receipt {
            action: action.to_owned(),
            source,
        })?;

    ensure_success(action, &receipt)?;
    Ok(receipt)
}

/// Simulates a raw call and returns its output without sending it.
pub async fn simulate<P: Provider>(
    action: &str,
    provider: &P,
    from: Address,
    to: Address,
    input: Bytes,
) -> Result<Bytes, TxError> {
    let request = TransactionRequest::default()
        .with_from(from)
        .with_to(to)
        .with_input(input);

    provider
        .call(request)
        .await
        .map_err(|source| TxError::Rpc {
            action: action.to_owned(),
            source,
        })
}

/// Succeeds only if `call` is refused, either up front or by a reverted
/// receipt.
pub async fn expect_revert<P, D>(
    action: &str,
    call: CallBuilder<P, D>,
    from: Address,
) -> Result<(), TxError>
where
    P: Provider,
    D: CallDecoder,
{
    let pending = match call.from(from).send().await {
        Ok(pending) => pending,
        Err(error) => {
            debug!(action, %error, "Reverted as expected");
            return Ok(());
        }
    };

    let receipt = pending
        .get_receipt()
        .await
        .map_err(|source| TxError::Receipt {
            action: action.to_owned(),
            source,
        })?;

    if receipt.status() {
        Err(TxError::DidNotRevert {
            action: action.to_owned(),
            tx_hash: receipt.transaction_hash,
        })
    } else {
        debug!(action, tx_hash = %receipt.transaction_hash, "Reverted on-chain as expected");
        Ok(())
    }
}

/// [`expect_revert`] for a hand-encoded call.
pub async fn expect_revert_request<P: Provider>(
    action: &str,
    provider: &P,
    request: TransactionRequest,
) -> Result<(), TxError> {
    match send_request(action, provider, request).await {
        Ok(receipt) => Err(TxError::DidNotRevert {
            action: action.to_owned(),
            tx_hash: receipt.transaction_hash,
        }),
        Err(TxError::Rpc { source, .. }) => {
            debug!(action, %source, "Reverted as expected");
            Ok(())
        }
        Err(TxError::Reverted { tx_hash, .. }) => {
            debug!(action, %tx_hash, "Reverted on-chain as expected");
            Ok(())
        }
        Err(other) => Err(other),
    }
}

/// Attempts a call whose support is optional. Failures are logged and
/// swallowed.
pub async fn best_effort<P, D>(action: &str, call: CallBuilder<P, D>, from: Address) -> bool
where
    P: Provider,
    D: CallDecoder,
{
    match send(action, call, from).await {
        Ok(_) => true,
        Err(error) => {
            warn!(action, %error, "Optional call failed, continuing");
            false
        }
    }
}

fn ensure_success(action: &str, receipt: &TransactionReceipt) -> Result<(), TxError> {
    if receipt.status() {
        Ok(())
    } else {
        warn!(action, tx_hash = %receipt.transaction_hash, "Transaction reverted on-chain");
        Err(TxError::Reverted {
            action: action.to_owned(),
            tx_hash: receipt.transaction_hash,
        })
    }
}

/// The profit/loss breakdown reported by a strategy harvest.
pub fn harvested(
    action: &str,
    receipt: &TransactionReceipt,
) -> Result<IStrategy::Harvested, TxError> {
    let event = harvested_in(receipt.inner.logs()).ok_or_else(|| TxError::NoHarvestedEvent {
        action: action.to_owned(),
    })?;

    info!(
        action,
        profit = %event.profit,
        loss = %event.loss,
        debt_payment = %event.debtPayment,
        debt_outstanding = %event.debtOutstanding,
        "Harvested"
    );
    Ok(event)
}

fn harvested_in(logs: &[Log]) -> Option<IStrategy::Harvested> {
    logs.iter()
        .find_map(|log| log.log_decode::<IStrategy::Harvested>().ok())
        .map(|log| log.inner.data)
}
