//! Postman service
//!
//! Wires the four pollers of each direction to the shared message store and
//! owns their handles.

use std::sync::Arc;

use eyre::{Result, WrapErr};
use sqlx::PgPool;
use tracing::{error, info};

use crate::chain::evm::{ChainRole, EvmChainClient};
use crate::chain::{ChainClient, MessageServiceRateLimit, NoRateLimit, RateLimitPolicy};
use crate::config::{ChainConfig, Config};
use crate::confirmation::ClaimStatusWatcher;
use crate::db::{self, MessageRepository, PgMessageRepository};
use crate::poller::{Poller, PollerHandle};
use crate::types::Direction;
use crate::watchers::{AnchoredEventListener, SentEventListener};
use crate::writers::ClaimTxSender;

pub struct PostmanService {
    config: Config,
    handles: Vec<PollerHandle>,
}

impl PostmanService {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            handles: Vec::new(),
        }
    }

    /// Connect to Postgres and bring the schema up to date
    pub async fn connect_store(&self) -> Result<PgPool> {
        let pool = db::create_pool(&self.config.database.url).await?;
        info!("Database connected");

        db::run_migrations(&pool).await?;
        info!("Database migrations complete");
        Ok(pool)
    }

    /// Connect both chains and start every poller
    pub async fn start_all(&mut self, pool: PgPool) -> Result<()> {
        let origin = EvmChainClient::new(&self.config.origin, ChainRole::Origin)
            .await
            .wrap_err("Failed to connect origin chain")?;
        let destination = EvmChainClient::new(&self.config.destination, ChainRole::Destination)
            .await
            .wrap_err("Failed to connect destination chain")?;

        info!(
            origin_chain_id = origin.chain_id(),
            destination_chain_id = destination.chain_id(),
            "Chains connected"
        );

        self.start_with(
            Arc::new(origin),
            Arc::new(destination),
            Arc::new(PgMessageRepository::new(pool)),
        );
        Ok(())
    }

    /// Start every poller over the given chain clients and store
    pub fn start_with(
        &mut self,
        origin: Arc<dyn ChainClient>,
        destination: Arc<dyn ChainClient>,
        repository: Arc<dyn MessageRepository>,
    ) {
        for direction in Direction::ALL {
            let (sending_client, receiving_client) = match direction {
                Direction::OriginToDest => (origin.clone(), destination.clone()),
                Direction::DestToOrigin => (destination.clone(), origin.clone()),
            };

            for poller in self.direction_pollers(direction, sending_client, receiving_client, &repository) {
                self.handles.push(PollerHandle::start(poller));
            }
        }

        info!(pollers = self.handles.len(), "All pollers started");
    }

    fn direction_pollers(
        &self,
        direction: Direction,
        sending_client: Arc<dyn ChainClient>,
        receiving_client: Arc<dyn ChainClient>,
        repository: &Arc<dyn MessageRepository>,
    ) -> Vec<Box<dyn Poller>> {
        let sending = self.config.sending_chain(direction);
        let receiving = self.config.receiving_chain(direction);
        let sending_contract = sending.message_service_address;

        let mut pollers: Vec<Box<dyn Poller>> = vec![
            Box::new(SentEventListener::new(
                direction,
                sending_client,
                repository.clone(),
                sending_contract,
                sending.listener.clone(),
            )),
            Box::new(AnchoredEventListener::new(
                direction,
                receiving_client.clone(),
                repository.clone(),
                sending_contract,
                sending.listener.max_fetch_messages_from_db,
                receiving.listener.polling_interval(),
            )),
        ];

        if !receiving.claiming.enabled {
            info!(direction = %direction, "Claiming disabled");
            return pollers;
        }

        let rate_limit = rate_limit_policy(receiving, receiving_client.clone());
        pollers.push(Box::new(ClaimTxSender::new(
            direction,
            receiving_client.clone(),
            repository.clone(),
            rate_limit.clone(),
            sending_contract,
            receiving.claiming.clone(),
            receiving.listener.polling_interval(),
        )));
        pollers.push(Box::new(ClaimStatusWatcher::new(
            direction,
            receiving_client,
            repository.clone(),
            rate_limit,
            receiving.claiming.message_submission_timeout(),
            receiving.listener.polling_interval(),
        )));

        pollers
    }

    pub fn poller_names(&self) -> Vec<&str> {
        self.handles.iter().map(PollerHandle::name).collect()
    }

    /// Signal every poller, then wait for their current ticks to finish
    pub async fn stop_all(&mut self) {
        for handle in &self.handles {
            handle.stop();
        }

        for handle in self.handles.drain(..) {
            let name = handle.name().to_string();
            if let Err(e) = handle.join().await {
                error!(poller = %name, error = %e, "Poller did not stop cleanly");
            }
        }

        info!("All pollers stopped");
    }
}

fn rate_limit_policy(receiving: &ChainConfig, client: Arc<dyn ChainClient>) -> Arc<dyn RateLimitPolicy> {
    if receiving.has_rate_limiter {
        Arc::new(MessageServiceRateLimit::new(client, receiving.claiming.rate_limit_margin))
    } else {
        Arc::new(NoRateLimit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ClaimReceipt, RateLimitState, RevertReason};
    use crate::db::Message;
    use crate::testing::{sent_event, InMemoryMessageRepository, MockChainClient};
    use crate::types::{MessageKey, MessageStatus, OnChainMessageStatus};
    use alloy::primitives::{Address, B256, U256};
    use std::collections::HashMap;
    use std::time::Duration;

    const KEY: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";
    const ORIGIN_SERVICE: &str = "0x00000000000000000000000000000000000000cc";

    fn config(extra: &[(&str, &str)]) -> Config {
        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert("DATABASE_URL".into(), "postgres://localhost/postman".into());
        for prefix in ["ORIGIN", "DESTINATION"] {
            vars.insert(format!("{prefix}_RPC_URL"), "http://localhost:8545".into());
            vars.insert(format!("{prefix}_PRIVATE_KEY"), KEY.into());
            vars.insert(format!("{prefix}_POLLING_INTERVAL_MS"), "10".into());
            vars.insert(format!("{prefix}_BLOCK_CONFIRMATION"), "0".into());
        }
        vars.insert("ORIGIN_MESSAGE_SERVICE_ADDRESS".into(), ORIGIN_SERVICE.into());
        vars.insert(
            "DESTINATION_MESSAGE_SERVICE_ADDRESS".into(),
            "0x00000000000000000000000000000000000000dd".into(),
        );
        for (key, value) in extra {
            vars.insert(key.to_string(), value.to_string());
        }
        Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    #[tokio::test]
    async fn test_starts_four_pollers_per_direction() {
        let mut service = PostmanService::new(config(&[]));
        service.start_with(
            Arc::new(MockChainClient::new()),
            Arc::new(MockChainClient::new()),
            Arc::new(InMemoryMessageRepository::new()),
        );

        let names = service.poller_names();
        assert_eq!(names.len(), 8);
        assert!(names.contains(&"ClaimTxSender[ORIGIN_TO_DEST]"));
        assert!(names.contains(&"ClaimStatusWatcher[DEST_TO_ORIGIN]"));

        service.stop_all().await;
        assert!(service.poller_names().is_empty());
    }

    #[tokio::test]
    async fn test_claiming_disabled_on_receiving_chain() {
        let mut service = PostmanService::new(config(&[("DESTINATION_CLAIMING_ENABLED", "false")]));
        service.start_with(
            Arc::new(MockChainClient::new()),
            Arc::new(MockChainClient::new()),
            Arc::new(InMemoryMessageRepository::new()),
        );

        let names = service.poller_names();
        assert_eq!(names.len(), 6);
        assert!(!names.iter().any(|n| n.starts_with("ClaimTxSender[ORIGIN_TO_DEST]")));
        assert!(names.contains(&"ClaimTxSender[DEST_TO_ORIGIN]"));

        service.stop_all().await;
    }

    #[tokio::test]
    async fn test_message_relayed_end_to_end() {
        let origin = Arc::new(MockChainClient::new());
        let destination = Arc::new(MockChainClient::new());
        let repository = Arc::new(InMemoryMessageRepository::new());

        let hash = B256::repeat_byte(0x42);
        origin.set_block_number(20);
        origin.push_event(sent_event(hash, 12, 0));
        destination.set_message_status(hash, OnChainMessageStatus::Claimable);

        let mut service = PostmanService::new(config(&[("ORIGIN_INITIAL_FROM_BLOCK", "0")]));
        service.start_with(origin.clone(), destination.clone(), repository.clone());

        let key = MessageKey {
            message_hash: hash,
            direction: Direction::OriginToDest,
        };
        let pending = wait_for_status(&repository, key, MessageStatus::Pending).await;
        assert_eq!(pending.map(|m| m.status), Some(MessageStatus::Pending));

        let tx_hash = repository.get(key).await.unwrap().claim_tx_hash.unwrap();
        destination.set_receipt(ClaimReceipt {
            transaction_hash: tx_hash,
            block_number: Some(30),
            success: true,
            gas_used: 60_000,
        });
        let claimed = wait_for_status(&repository, key, MessageStatus::ClaimedSuccess).await;
        service.stop_all().await;

        assert_eq!(claimed.map(|m| m.status), Some(MessageStatus::ClaimedSuccess));
        let submissions = destination.submissions();
        assert_eq!(submissions.len(), 1);
        assert!(origin.submissions().is_empty());

        let message = repository.get(key).await.unwrap();
        assert_eq!(message.contract_address, ORIGIN_SERVICE.parse::<Address>().unwrap());
        assert_eq!(submissions[0].0.message_nonce, message.message_nonce);
        assert_eq!(message.claim_tx_nonce, Some(0));
    }

    async fn wait_for_status(
        repository: &InMemoryMessageRepository,
        key: MessageKey,
        status: MessageStatus,
    ) -> Option<Message> {
        for _ in 0..200 {
            if let Some(message) = repository.get(key).await.filter(|m| m.status == status) {
                return Some(message);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        repository.get(key).await
    }

    async fn tick_and_record(
        poller: &mut Box<dyn Poller>,
        repository: &InMemoryMessageRepository,
        key: MessageKey,
        path: &mut Vec<MessageStatus>,
    ) {
        poller.tick().await.unwrap();
        let Some(current) = repository.get(key).await.map(|m| m.status) else {
            return;
        };
        match path.last() {
            Some(previous) if *previous == current => {}
            Some(previous) => {
                assert!(
                    previous.can_transition_to(current),
                    "{} -> {} is not an allowed transition",
                    previous,
                    current
                );
                path.push(current);
            }
            None => path.push(current),
        }
    }

    #[tokio::test]
    async fn test_status_path_follows_transition_rules() {
        let origin = Arc::new(MockChainClient::new());
        let destination = Arc::new(MockChainClient::new());
        let repository = Arc::new(InMemoryMessageRepository::new());
        let store: Arc<dyn MessageRepository> = repository.clone();

        let hash = B256::repeat_byte(0x43);
        origin.set_block_number(20);
        origin.push_event(sent_event(hash, 12, 0));
        destination.set_message_status(hash, OnChainMessageStatus::Claimable);
        destination.set_rate_limit(RateLimitState {
            limit: U256::from(10u64).pow(U256::from(21u64)),
            current_period_amount: U256::ZERO,
        });

        let service = PostmanService::new(config(&[
            ("ORIGIN_INITIAL_FROM_BLOCK", "0"),
            ("DESTINATION_HAS_RATE_LIMITER", "true"),
        ]));
        let mut pollers =
            service.direction_pollers(Direction::OriginToDest, origin.clone(), destination.clone(), &store);
        assert_eq!(pollers.len(), 4);
        let (sent, anchored, claim, status) = (0, 1, 2, 3);

        let key = MessageKey::new(hash, Direction::OriginToDest);
        let mut path: Vec<MessageStatus> = Vec::new();

        tick_and_record(&mut pollers[sent], &repository, key, &mut path).await;
        tick_and_record(&mut pollers[anchored], &repository, key, &mut path).await;
        tick_and_record(&mut pollers[claim], &repository, key, &mut path).await;

        // First claim reverts on the withdrawal limit
        let first_tx = repository.get(key).await.unwrap().claim_tx_hash.unwrap();
        destination.set_receipt(ClaimReceipt {
            transaction_hash: first_tx,
            block_number: Some(21),
            success: false,
            gas_used: 60_000,
        });
        destination.set_revert_reason(first_tx, RevertReason::RateLimitExceeded);
        tick_and_record(&mut pollers[status], &repository, key, &mut path).await;

        tick_and_record(&mut pollers[anchored], &repository, key, &mut path).await;
        tick_and_record(&mut pollers[claim], &repository, key, &mut path).await;
        let second = repository.get(key).await.unwrap();
        let second_tx = second.claim_tx_hash.unwrap();
        assert_ne!(second_tx, first_tx);
        assert_eq!(second.claim_tx_nonce, Some(1));

        destination.set_receipt(ClaimReceipt {
            transaction_hash: second_tx,
            block_number: Some(22),
            success: true,
            gas_used: 60_000,
        });
        tick_and_record(&mut pollers[status], &repository, key, &mut path).await;

        assert_eq!(
            path,
            vec![
                MessageStatus::Sent,
                MessageStatus::Anchored,
                MessageStatus::Pending,
                MessageStatus::Sent,
                MessageStatus::Anchored,
                MessageStatus::Pending,
                MessageStatus::ClaimedSuccess,
            ]
        );
        assert!(path.last().unwrap().is_terminal());
    }
}
