//! Keeps one module's event subscription alive across transport loss and
//! idle timeouts, feeding a bounded channel in strict cursor order.
//!
//! The channel applies backpressure: if the dispatcher falls behind, the
//! pump blocks on `send` and stops pulling from the subscription. Nothing
//! is dropped; on reconnect the pump resumes from the last delivered
//! cursor and discards anything at or below it.

use super::ChainApi;
use crate::constants::SUBSCRIPTION_IDLE_TIMEOUT;
use ck_contract::events::{ContractModule, EventRecord};
use ck_primitives::EventCursor;
use futures::StreamExt;
use std::{cmp::min, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

pub struct EventPump {
	chain: Arc<dyn ChainApi>,
	module: ContractModule,
	cursor: Option<EventCursor>,
	sender: mpsc::Sender<EventRecord>,
}

impl EventPump {
	pub fn new(
		chain: Arc<dyn ChainApi>,
		module: ContractModule,
		resume_after: Option<EventCursor>,
		sender: mpsc::Sender<EventRecord>,
	) -> Self {
		Self { chain, module, cursor: resume_after, sender }
	}

	/// Runs until the receiving side goes away.
	pub async fn run(mut self) -> anyhow::Result<()> {
		let mut reconnect_delay = RECONNECT_INITIAL_DELAY;
		loop {
			match self.chain.subscribe_events(self.module, self.cursor).await {
				Ok(mut stream) => {
					reconnect_delay = RECONNECT_INITIAL_DELAY;
					loop {
						match tokio::time::timeout(SUBSCRIPTION_IDLE_TIMEOUT, stream.next()).await
						{
							Ok(Some(Ok(record))) => {
								// Replays at or below the cursor are expected
								// right after a resubscribe.
								if self.cursor.map_or(true, |c| record.cursor() > c) {
									let cursor = record.cursor();
									if self.sender.send(record).await.is_err() {
										return Ok(())
									}
									self.cursor = Some(cursor);
								}
							},
							Ok(Some(Err(error))) => {
								warn!(module = %self.module, %error, "event subscription errored, re-establishing");
								break
							},
							Ok(None) => {
								warn!(module = %self.module, "event subscription ended, re-establishing");
								break
							},
							Err(_) => {
								debug!(module = %self.module, "event subscription idle, re-establishing");
								break
							},
						}
					}
				},
				Err(error) => {
					warn!(module = %self.module, %error, "could not subscribe to events");
				},
			}

			tokio::time::sleep(reconnect_delay).await;
			reconnect_delay = min(reconnect_delay * 2, RECONNECT_MAX_DELAY);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain_client::{ChainClientError, MockChainApi};
	use ck_contract::events::ContractEvent;
	use ck_primitives::{NodeId, TxDigest, WorkerStatus};

	fn record(height: u64, index: u32) -> EventRecord {
		EventRecord {
			event: ContractEvent::WorkerStatusChanged {
				node_id: NodeId::from("w1"),
				from: WorkerStatus::Pending,
				to: WorkerStatus::Active,
			},
			tx_digest: TxDigest::digest_of(&height.to_be_bytes()),
			block_height: height,
			intra_block: index,
		}
	}

	#[tokio::test]
	async fn resumes_from_cursor_and_dedupes_replays() {
		let mut chain = MockChainApi::new();
		let mut subscriptions = 0u32;
		chain.expect_subscribe_events().returning(move |_, from| {
			subscriptions += 1;
			match subscriptions {
				1 => {
					assert_eq!(from, None);
					// Ends after two events, forcing a resubscribe.
					Ok(futures::stream::iter(vec![Ok(record(1, 0)), Ok(record(2, 0))]).boxed())
				},
				2 => {
					// The pump must resume from what it delivered, and
					// tolerate the server replaying from the cursor.
					assert_eq!(from, Some(EventCursor::new(2, 0)));
					Ok(futures::stream::iter(vec![Ok(record(2, 0)), Ok(record(3, 0))])
						.chain(futures::stream::pending())
						.boxed())
				},
				_ => Err(ChainClientError::Transient("no more".into())),
			}
		});

		let (sender, mut receiver) = mpsc::channel(10);
		let pump = EventPump::new(
			Arc::new(chain),
			ContractModule::WorkerRegistry,
			None,
			sender,
		);
		let handle = tokio::spawn(pump.run());

		let heights: Vec<u64> = [
			receiver.recv().await.unwrap(),
			receiver.recv().await.unwrap(),
			receiver.recv().await.unwrap(),
		]
		.iter()
		.map(|r| r.block_height)
		.collect();
		assert_eq!(heights, [1, 2, 3]);

		// Dropping the receiver ends the pump.
		drop(receiver);
		handle.abort();
	}

	#[tokio::test]
	async fn pump_exits_when_receiver_is_dropped() {
		let mut chain = MockChainApi::new();
		chain.expect_subscribe_events().returning(|_, _| {
			Ok(futures::stream::iter((0..100).map(|h| Ok(record(h, 0))))
				.chain(futures::stream::pending())
				.boxed())
		});

		let (sender, receiver) = mpsc::channel(1);
		let pump = EventPump::new(
			Arc::new(chain),
			ContractModule::WorkerRegistry,
			None,
			sender,
		);
		drop(receiver);

		tokio::time::timeout(Duration::from_secs(1), pump.run())
			.await
			.expect("pump should notice the closed channel")
			.unwrap();
	}
}
