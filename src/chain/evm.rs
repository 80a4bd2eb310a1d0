//! EVM chain client
//!
//! Talks to one chain's message service over HTTP JSON-RPC. Claim transactions
//! are built with explicit nonce, gas and EIP-1559 fees, signed locally and
//! broadcast as raw envelopes.

use alloy::consensus::Transaction as _;
use alloy::eips::{BlockId, BlockNumberOrTag};
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent, SolInterface};
use alloy::transports::http::{Client, Http};
use alloy::transports::RpcError;
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::fees::{bump_fees, compute_1559_fees, FEE_HISTORY_BLOCK_COUNT};
use super::{
    ChainClient, ChainError, ClaimMessageParams, ClaimReceipt, FeeCache, GasFees,
    MessageSentEvent, MessageSentFilter, RateLimitState, RevertReason, SubmittedClaim,
    TxOverrides,
};
use crate::config::ChainConfig;
use crate::error_parser::ErrorCode;
use crate::types::OnChainMessageStatus;

sol! {
    /// Message service deployed on both chains
    #[sol(rpc)]
    contract MessageService {
        event MessageSent(
            address indexed _from,
            address indexed _to,
            uint256 _fee,
            uint256 _value,
            uint256 _nonce,
            bytes _calldata,
            bytes32 indexed _messageHash
        );

        error RateLimitExceeded();
        error MessageDoesNotExistOrHasAlreadyBeenClaimed(bytes32 messageHash);
        error MessageSendingFailed(address destination);

        function claimMessage(
            address _from,
            address _to,
            uint256 _fee,
            uint256 _value,
            address _feeRecipient,
            bytes _calldata,
            uint256 _nonce
        ) external;

        /// Status of messages sent from the origin chain, held on the destination chain
        function inboxL1L2MessageStatus(bytes32 messageHash) external view returns (uint256);

        /// Status of messages sent from the destination chain, held on the origin chain
        function inboxL2L1MessageStatus(bytes32 messageHash) external view returns (uint256);

        function limitInWei() external view returns (uint256);

        function currentPeriodAmountInWei() external view returns (uint256);
    }
}

/// Which side of the relay a chain is on; selects the inbox that holds
/// statuses of messages arriving at it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainRole {
    Origin,
    Destination,
}

pub struct EvmChainClient {
    provider: RootProvider<Http<Client>>,
    message_service: Address,
    role: ChainRole,
    wallet: EthereumWallet,
    signer_address: Address,
    chain_id: u64,
    max_fee_per_gas: u128,
    gas_estimation_percentile: f64,
    fee_cache: Mutex<FeeCache>,
}

impl EvmChainClient {
    pub async fn new(config: &ChainConfig, role: ChainRole) -> Result<Self> {
        let url = config.rpc_url.parse().wrap_err("Failed to parse RPC URL")?;
        let provider = ProviderBuilder::new().on_http(url);

        let signer: PrivateKeySigner = config
            .private_key
            .parse()
            .wrap_err("Invalid private key")?;
        let signer_address = signer.address();

        let chain_id = provider
            .get_chain_id()
            .await
            .map_err(|e| ChainError::from_transport(&e))
            .wrap_err("Failed to get chain id")?;

        info!(
            role = ?role,
            chain_id,
            signer = %signer_address,
            message_service = %config.message_service_address,
            "EVM chain client initialized"
        );

        Ok(Self {
            provider,
            message_service: config.message_service_address,
            role,
            wallet: EthereumWallet::from(signer),
            signer_address,
            chain_id,
            max_fee_per_gas: config.claiming.max_fee_per_gas,
            gas_estimation_percentile: config.claiming.gas_estimation_percentile,
            fee_cache: Mutex::new(FeeCache::new()),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn contract(&self) -> MessageService::MessageServiceInstance<Http<Client>, RootProvider<Http<Client>>> {
        MessageService::new(self.message_service, self.provider.clone())
    }

    fn claim_request(&self, params: &ClaimMessageParams) -> TransactionRequest {
        let call = MessageService::claimMessageCall {
            _from: params.message_sender,
            _to: params.destination,
            _fee: params.fee,
            _value: params.value,
            _feeRecipient: params.fee_recipient,
            _calldata: params.calldata.clone(),
            _nonce: params.message_nonce,
        };

        TransactionRequest::default()
            .with_from(self.signer_address)
            .with_to(self.message_service)
            .with_input(call.abi_encode())
    }

    /// Sign a complete EIP-1559 request and broadcast it
    async fn sign_and_send(&self, request: TransactionRequest) -> Result<B256> {
        let envelope = request
            .with_chain_id(self.chain_id)
            .build(&self.wallet)
            .await
            .map_err(|e| eyre!("Failed to sign claim transaction: {}", e))?;

        let pending = self
            .provider
            .send_tx_envelope(envelope)
            .await
            .map_err(|e| ChainError::from_transport(&e))
            .wrap_err("Failed to broadcast claim transaction")?;

        Ok(*pending.tx_hash())
    }

    fn parse_message_sent(&self, log: &Log) -> Result<MessageSentEvent> {
        let decoded = log
            .log_decode::<MessageService::MessageSent>()
            .wrap_err("Failed to decode MessageSent log")?;
        let event = &decoded.inner.data;

        Ok(MessageSentEvent {
            message_hash: event._messageHash,
            message_sender: event._from,
            destination: event._to,
            fee: event._fee,
            value: event._value,
            message_nonce: event._nonce,
            calldata: event._calldata.clone(),
            contract_address: log.address(),
            block_number: log
                .block_number
                .ok_or_else(|| eyre!("Missing block number"))?,
            log_index: log.log_index.ok_or_else(|| eyre!("Missing log index"))?,
            transaction_hash: log
                .transaction_hash
                .ok_or_else(|| eyre!("Missing transaction hash"))?,
        })
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    async fn current_block_number(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::from_transport(&e))
            .wrap_err("Failed to get block number")
    }

    async fn message_sent_events(&self, filter: &MessageSentFilter) -> Result<Vec<MessageSentEvent>> {
        let log_filter = Filter::new()
            .address(self.message_service)
            .event_signature(MessageService::MessageSent::SIGNATURE_HASH)
            .from_block(filter.from_block)
            .to_block(filter.to_block);

        let logs = self
            .provider
            .get_logs(&log_filter)
            .await
            .map_err(|e| ChainError::from_transport(&e))
            .wrap_err("Failed to get logs")?;

        let mut events = logs
            .iter()
            .map(|log| self.parse_message_sent(log))
            .collect::<Result<Vec<_>>>()?;
        events.sort_by_key(|e| (e.block_number, e.log_index));

        debug!(
            from_block = filter.from_block,
            to_block = filter.to_block,
            count = events.len(),
            "Fetched MessageSent logs"
        );

        Ok(events)
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<ClaimReceipt>> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| ChainError::from_transport(&e))
            .wrap_err("Failed to get transaction receipt")?;

        Ok(receipt.map(|r| ClaimReceipt {
            transaction_hash: r.transaction_hash,
            block_number: r.block_number,
            success: r.status(),
            gas_used: u64::try_from(r.gas_used).unwrap_or(u64::MAX),
        }))
    }

    async fn message_status(
        &self,
        message_hash: B256,
        block_number: Option<u64>,
    ) -> Result<OnChainMessageStatus> {
        let block = block_number.map(BlockId::number).unwrap_or(BlockId::latest());
        let contract = self.contract();

        let status = match self.role {
            ChainRole::Origin => contract
                .inboxL2L1MessageStatus(message_hash)
                .block(block)
                .call()
                .await
                .map(|r| r._0),
            ChainRole::Destination => contract
                .inboxL1L2MessageStatus(message_hash)
                .block(block)
                .call()
                .await
                .map(|r| r._0),
        }
        .map_err(|e| ChainError::from_contract(&e))
        .wrap_err("Failed to get message status")?;

        Ok(OnChainMessageStatus::from(status))
    }

    async fn estimate_claim_gas(&self, params: &ClaimMessageParams) -> Result<u64> {
        let request = self.claim_request(params);

        self.provider
            .estimate_gas(&request)
            .await
            .map_err(|e| ChainError::from_estimation(&e))
            .wrap_err("Failed to estimate claim gas")
    }

    async fn submit_claim(
        &self,
        params: &ClaimMessageParams,
        overrides: &TxOverrides,
    ) -> Result<B256> {
        let request = self
            .claim_request(params)
            .with_nonce(overrides.nonce)
            .with_gas_limit(overrides.gas_limit)
            .with_max_fee_per_gas(overrides.max_fee_per_gas)
            .with_max_priority_fee_per_gas(overrides.max_priority_fee_per_gas);

        self.sign_and_send(request).await
    }

    async fn resubmit_with_higher_fee(&self, tx_hash: B256) -> Result<SubmittedClaim> {
        let tx = self
            .provider
            .get_transaction_by_hash(tx_hash)
            .await
            .map_err(|e| ChainError::from_transport(&e))
            .wrap_err("Failed to get transaction")?
            .ok_or_else(|| eyre!("Transaction {:?} not found", tx_hash))?;

        let original = GasFees {
            max_fee_per_gas: tx.max_fee_per_gas(),
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas().unwrap_or_default(),
        };
        let estimate = self.fee_estimate().await?;
        let fees = bump_fees(&original, &estimate, self.max_fee_per_gas);
        let to = tx
            .to()
            .ok_or_else(|| eyre!("Transaction {:?} has no recipient", tx_hash))?;

        let overrides = TxOverrides {
            nonce: tx.nonce(),
            gas_limit: tx.gas_limit(),
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
        };

        let request = TransactionRequest::default()
            .with_from(self.signer_address)
            .with_to(to)
            .with_input(tx.input().clone())
            .with_value(tx.value())
            .with_nonce(overrides.nonce)
            .with_gas_limit(overrides.gas_limit)
            .with_max_fee_per_gas(overrides.max_fee_per_gas)
            .with_max_priority_fee_per_gas(overrides.max_priority_fee_per_gas);

        let new_hash = self.sign_and_send(request).await?;

        info!(
            old_tx_hash = %tx_hash,
            new_tx_hash = %new_hash,
            nonce = overrides.nonce,
            max_fee_per_gas = overrides.max_fee_per_gas,
            "Resubmitted claim transaction with higher fee"
        );

        Ok(SubmittedClaim::new(new_hash, &overrides))
    }

    async fn signer_nonce(&self) -> Result<u64> {
        self.provider
            .get_transaction_count(self.signer_address)
            .await
            .map_err(|e| ChainError::from_transport(&e))
            .wrap_err("Failed to get signer nonce")
    }

    async fn fee_estimate(&self) -> Result<GasFees> {
        let block_number = self.current_block_number().await?;

        let mut cache = self.fee_cache.lock().await;
        if let Some(fees) = cache.get(block_number) {
            return Ok(fees);
        }

        let history = self
            .provider
            .get_fee_history(
                FEE_HISTORY_BLOCK_COUNT,
                BlockNumberOrTag::Latest,
                &[self.gas_estimation_percentile],
            )
            .await
            .map_err(|e| ChainError::new(ErrorCode::GasFeeError, e.to_string()))
            .wrap_err("Failed to get fee history")?;

        let rewards = history.reward.unwrap_or_default();
        let fees = compute_1559_fees(&history.base_fee_per_gas, &rewards, self.max_fee_per_gas)?;
        cache.store(block_number, fees);

        debug!(
            block_number,
            max_fee_per_gas = fees.max_fee_per_gas,
            max_priority_fee_per_gas = fees.max_priority_fee_per_gas,
            "Estimated EIP-1559 fees"
        );

        Ok(fees)
    }

    async fn rate_limit_state(&self) -> Result<RateLimitState> {
        let contract = self.contract();

        let limit = contract
            .limitInWei()
            .call()
            .await
            .map_err(|e| ChainError::from_contract(&e))
            .wrap_err("Failed to get rate limit")?
            ._0;
        let current_period_amount = contract
            .currentPeriodAmountInWei()
            .call()
            .await
            .map_err(|e| ChainError::from_contract(&e))
            .wrap_err("Failed to get current period amount")?
            ._0;

        Ok(RateLimitState {
            limit,
            current_period_amount,
        })
    }

    async fn revert_reason(&self, tx_hash: B256) -> Result<Option<RevertReason>> {
        let Some(tx) = self
            .provider
            .get_transaction_by_hash(tx_hash)
            .await
            .map_err(|e| ChainError::from_transport(&e))
            .wrap_err("Failed to get transaction")?
        else {
            return Ok(None);
        };

        let block = match tx.block_number {
            Some(number) => BlockId::number(number),
            None => BlockId::latest(),
        };

        let mut request = TransactionRequest::default()
            .with_from(tx.from)
            .with_input(tx.input().clone())
            .with_value(tx.value())
            .with_gas_limit(tx.gas_limit());
        if let Some(to) = tx.to() {
            request = request.with_to(to);
        }

        match self.provider.call(&request).block(block).await {
            Ok(_) => Ok(None),
            Err(RpcError::ErrorResp(payload)) => {
                let reason = match payload.as_revert_data() {
                    Some(data) => match MessageService::MessageServiceErrors::abi_decode(&data, true) {
                        Ok(MessageService::MessageServiceErrors::RateLimitExceeded(_)) => {
                            RevertReason::RateLimitExceeded
                        }
                        _ => RevertReason::Other(payload.message.to_string()),
                    },
                    None => RevertReason::Other(payload.message.to_string()),
                };
                Ok(Some(reason))
            }
            Err(e) => Err(ChainError::from_transport(&e)).wrap_err("Failed to replay transaction"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, b256, Bytes, U256};
    use alloy::sol_types::SolError;

    #[test]
    fn test_rate_limit_error_decodes_from_revert_data() {
        let data = MessageService::RateLimitExceeded {}.abi_encode();
        let decoded = MessageService::MessageServiceErrors::abi_decode(&data, true).unwrap();
        assert!(matches!(
            decoded,
            MessageService::MessageServiceErrors::RateLimitExceeded(_)
        ));
    }

    #[test]
    fn test_other_error_is_not_rate_limit() {
        let data = MessageService::MessageDoesNotExistOrHasAlreadyBeenClaimed {
            messageHash: B256::repeat_byte(1),
        }
        .abi_encode();
        let decoded = MessageService::MessageServiceErrors::abi_decode(&data, true).unwrap();
        assert!(!matches!(
            decoded,
            MessageService::MessageServiceErrors::RateLimitExceeded(_)
        ));
    }

    #[test]
    fn test_claim_call_encoding_starts_with_selector() {
        let call = MessageService::claimMessageCall {
            _from: address!("00000000000000000000000000000000000000aa"),
            _to: address!("00000000000000000000000000000000000000bb"),
            _fee: U256::from(10),
            _value: U256::ZERO,
            _feeRecipient: Address::ZERO,
            _calldata: Bytes::new(),
            _nonce: U256::from(7),
        };
        let encoded = call.abi_encode();
        assert_eq!(&encoded[..4], MessageService::claimMessageCall::SELECTOR.as_slice());
    }

    #[test]
    fn test_message_sent_signature() {
        assert_eq!(
            MessageService::MessageSent::SIGNATURE,
            "MessageSent(address,address,uint256,uint256,uint256,bytes,bytes32)"
        );
        assert_ne!(
            MessageService::MessageSent::SIGNATURE_HASH,
            b256!("0000000000000000000000000000000000000000000000000000000000000000")
        );
    }
}
