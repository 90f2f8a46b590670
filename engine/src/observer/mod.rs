//! The master event loop: one dispatcher per contract module partition,
//! exactly-once handling backed by the durable progress cursor and the
//! seen-event set.

pub mod executor;
pub mod handlers;

use crate::{
	chain_client::event_stream::EventPump,
	constants::{EVENT_CHANNEL_CAPACITY, SEEN_DIGESTS_CAPACITY, SEEN_DIGESTS_RETENTION},
	db::PersistentStateDB,
	metrics,
	runtime::MasterRuntime,
};
use ck_contract::events::{ContractEvent, ContractModule, EventRecord};
use ck_primitives::{unix_time_now, EventCursor, TxDigest};
use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt};
use handlers::EventHandlers;
use lru::LruCache;
use std::{
	collections::{BTreeMap, HashMap},
	num::NonZeroUsize,
	sync::{Arc, Mutex},
	time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use utilities::{task_scope::Scope, UnendingStream};

/// What a handler tells the dispatcher about one event.
#[derive(Debug)]
pub enum HandlerOutcome {
	/// The side effect is durably acknowledged; advance the cursor.
	Done,
	/// The side effect is not yet on record; run the handler again after
	/// the delay. The cursor stays put.
	RetryLater(Duration),
	/// The handler cannot and need not act; the on-chain state already
	/// reflects the outcome. Logged, cursor advanced.
	Permanent(String),
}

struct ProgressInner {
	cursors: HashMap<ContractModule, EventCursor>,
	seen: LruCache<(TxDigest, u32), ()>,
}

/// The durable progress cursor plus the seen-event set, updated together
/// in a single critical section.
pub struct ProgressTracker {
	db: Arc<PersistentStateDB>,
	inner: Mutex<ProgressInner>,
}

impl ProgressTracker {
	pub fn load(db: Arc<PersistentStateDB>) -> anyhow::Result<Self> {
		let mut seen =
			LruCache::new(NonZeroUsize::new(SEEN_DIGESTS_CAPACITY).expect("capacity is nonzero"));
		let mut persisted = db.load_digests()?;
		// Oldest first, so the newest survive in the LRU.
		persisted.sort_by_key(|(_, seen_at)| *seen_at);
		for (key, _) in persisted {
			seen.put(key, ());
		}

		let mut cursors = HashMap::new();
		for module in ContractModule::ALL {
			if let Some(cursor) = db.load_cursor(module)? {
				info!(module = %module, %cursor, "resuming from cursor");
				cursors.insert(module, cursor);
			}
		}

		Ok(Self { db, inner: Mutex::new(ProgressInner { cursors, seen }) })
	}

	pub fn cursor(&self, module: ContractModule) -> Option<EventCursor> {
		self.inner.lock().expect("progress lock poisoned").cursors.get(&module).copied()
	}

	/// Whether this event was already handled end-to-end, either because it
	/// sits at or below the partition cursor or because its key is in the
	/// seen set.
	pub fn is_processed(&self, record: &EventRecord) -> bool {
		let inner = self.inner.lock().expect("progress lock poisoned");
		if let Some(cursor) = inner.cursors.get(&record.event.module()) {
			if record.cursor() <= *cursor {
				return true
			}
		}
		inner.seen.contains(&(record.tx_digest, record.intra_block))
	}

	/// Durably record the event as handled and advance the cursor. A
	/// failure here is fatal for the calling task: continuing would risk
	/// re-running side effects unbounded after a restart.
	pub fn commit(&self, record: &EventRecord) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().expect("progress lock poisoned");
		let module = record.event.module();
		// The cursor never moves backwards, even when a replayed event
		// below it is re-acknowledged.
		let cursor = inner
			.cursors
			.get(&module)
			.copied()
			.map_or(record.cursor(), |current| current.max(record.cursor()));
		self.db.commit_progress(
			module,
			cursor,
			record.tx_digest,
			record.intra_block,
			unix_time_now(),
		)?;
		inner.cursors.insert(module, cursor);
		inner.seen.put((record.tx_digest, record.intra_block), ());
		Ok(())
	}

	pub fn prune(&self) -> anyhow::Result<usize> {
		self.db.prune_digests(unix_time_now().saturating_sub(SEEN_DIGESTS_RETENTION.as_secs()))
	}
}

/// Spawns the per-partition pumps and dispatchers plus the digest pruner.
pub async fn start(
	scope: &Scope<'_, anyhow::Error>,
	runtime: Arc<MasterRuntime>,
) -> anyhow::Result<()> {
	for module in ContractModule::ALL {
		let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
		let pump = EventPump::new(
			runtime.chain.clone(),
			module,
			runtime.progress.cursor(module),
			sender,
		);
		scope.spawn(pump.run());

		let runtime = runtime.clone();
		match module {
			ContractModule::WorkerRegistry =>
				scope.spawn(run_registry_dispatcher(runtime, receiver)),
			ContractModule::RequestScheduler =>
				scope.spawn(run_scheduler_dispatcher(runtime, receiver)),
		}
	}

	let runtime = runtime.clone();
	scope.spawn_weak(async move {
		loop {
			tokio::time::sleep(SEEN_DIGESTS_RETENTION).await;
			match runtime.progress.prune() {
				Ok(pruned) if pruned > 0 => debug!(pruned, "pruned seen-digest tail"),
				Ok(_) => {},
				Err(error) => warn!(%error, "digest pruning failed"),
			}
		}
	});

	Ok(())
}

/// Worker-registry partition: events are handled strictly in order, one at
/// a time.
async fn run_registry_dispatcher(
	runtime: Arc<MasterRuntime>,
	mut receiver: mpsc::Receiver<EventRecord>,
) -> anyhow::Result<()> {
	let handlers = EventHandlers::new(runtime.clone());
	while let Some(record) = receiver.recv().await {
		if runtime.progress.is_processed(&record) {
			debug!(kind = record.event.kind(), cursor = %record.cursor(), "skipping already-processed event");
			runtime.progress.commit(&record)?;
			continue
		}

		loop {
			match handlers.handle_registry_event(&record).await {
				HandlerOutcome::Done => {
					metrics::EVENTS_PROCESSED
						.with_label_values(&[
							record.event.module().as_str(),
							record.event.kind(),
						])
						.inc();
					runtime.progress.commit(&record)?;
					break
				},
				HandlerOutcome::RetryLater(delay) => {
					warn!(
						kind = record.event.kind(),
						cursor = %record.cursor(),
						delay_ms = delay.as_millis() as u64,
						"handler deferred, retrying"
					);
					tokio::time::sleep(delay).await;
				},
				HandlerOutcome::Permanent(reason) => {
					error!(
						kind = record.event.kind(),
						cursor = %record.cursor(),
						%reason,
						"handler gave up; on-chain state already reflects the outcome"
					);
					runtime.progress.commit(&record)?;
					break
				},
			}
		}
	}
	Ok(())
}

/// Tracks which in-flight events have completed, releasing records for
/// cursor advancement only in contiguous cursor order.
#[derive(Default)]
struct CompletionTracker {
	entries: BTreeMap<EventCursor, (EventRecord, bool)>,
}

impl CompletionTracker {
	fn begin(&mut self, record: EventRecord) {
		self.entries.insert(record.cursor(), (record, false));
	}

	/// Marks `cursor` complete and returns the records now safe to commit,
	/// in order.
	fn complete(&mut self, cursor: EventCursor) -> Vec<EventRecord> {
		if let Some(entry) = self.entries.get_mut(&cursor) {
			entry.1 = true;
		}
		let mut ready = Vec::new();
		while let Some(first) = self.entries.first_entry() {
			if first.get().1 {
				ready.push(first.remove().0);
			} else {
				break
			}
		}
		ready
	}
}

/// Request-scheduler partition: executions start in event order but run
/// concurrently up to the configured parallelism. The cursor advances along
/// the contiguous prefix of completed events, so a crash re-delivers
/// exactly the unfinished ones.
async fn run_scheduler_dispatcher(
	runtime: Arc<MasterRuntime>,
	mut receiver: mpsc::Receiver<EventRecord>,
) -> anyhow::Result<()> {
	let handlers = EventHandlers::new(runtime.clone());
	let parallelism = runtime.settings.event_parallelism as usize;
	let mut executions: FuturesUnordered<BoxFuture<'static, (EventCursor, HandlerOutcome)>> =
		FuturesUnordered::new();
	let mut tracker = CompletionTracker::default();
	let mut channel_open = true;

	while channel_open || !executions.is_empty() {
		tokio::select! {
			maybe_record = receiver.recv(), if channel_open && executions.len() < parallelism => {
				let Some(record) = maybe_record else {
					channel_open = false;
					continue
				};

				if runtime.progress.is_processed(&record) {
					debug!(kind = record.event.kind(), cursor = %record.cursor(), "skipping already-processed event");
					for ready in begin_and_complete(&mut tracker, record) {
						runtime.progress.commit(&ready)?;
					}
					continue
				}

				match &record.event {
					ContractEvent::K8sApiRequestScheduled(scheduled) => {
						let scheduled = scheduled.clone();
						let cursor = record.cursor();
						tracker.begin(record);
						let runtime = runtime.clone();
						executions.push(
							async move {
								let outcome =
									executor::run_execution(&runtime, &scheduled).await;
								(cursor, outcome)
							}
							.boxed(),
						);
					},
					_ => {
						handlers.note_scheduler_event(&record);
						metrics::EVENTS_PROCESSED
							.with_label_values(&[
								record.event.module().as_str(),
								record.event.kind(),
							])
							.inc();
						for ready in begin_and_complete(&mut tracker, record) {
							runtime.progress.commit(&ready)?;
						}
					},
				}
			},
			(cursor, outcome) = executions.next_or_pending() => {
				match outcome {
					HandlerOutcome::Done => {},
					HandlerOutcome::Permanent(reason) => {
						error!(%cursor, %reason, "request execution gave up");
					},
					HandlerOutcome::RetryLater(_) => {
						unreachable!("run_execution resolves retries internally")
					},
				}
				metrics::EVENTS_PROCESSED
					.with_label_values(&[
						ContractModule::RequestScheduler.as_str(),
						"K8sAPIRequestScheduled",
					])
					.inc();
				for ready in tracker.complete(cursor) {
					runtime.progress.commit(&ready)?;
				}
			},
		}
	}
	Ok(())
}

fn begin_and_complete(tracker: &mut CompletionTracker, record: EventRecord) -> Vec<EventRecord> {
	let cursor = record.cursor();
	tracker.begin(record);
	tracker.complete(cursor)
}

#[cfg(test)]
mod tests {
	use super::*;
	use ck_contract::events::ContractEvent;
	use ck_primitives::{NodeId, WorkerStatus};
	use utilities::testing::new_temp_directory_with_nonexistent_file;

	fn record(height: u64, index: u32, digest_byte: u8) -> EventRecord {
		EventRecord {
			event: ContractEvent::JoinTokenSet { node_id: NodeId::from("w1") },
			tx_digest: TxDigest([digest_byte; 32]),
			block_height: height,
			intra_block: index,
		}
	}

	fn status_record(height: u64) -> EventRecord {
		EventRecord {
			event: ContractEvent::WorkerStatusChanged {
				node_id: NodeId::from("w1"),
				from: WorkerStatus::Pending,
				to: WorkerStatus::Active,
			},
			tx_digest: TxDigest([height as u8; 32]),
			block_height: height,
			intra_block: 0,
		}
	}

	fn tracker() -> (tempfile::TempDir, ProgressTracker) {
		let (dir, db_file) = new_temp_directory_with_nonexistent_file();
		let tracker = ProgressTracker::load(Arc::new(
			PersistentStateDB::open_and_migrate_to_latest(&db_file).unwrap(),
		))
		.unwrap();
		(dir, tracker)
	}

	#[test]
	fn commit_advances_cursor_and_marks_seen() {
		let (_dir, tracker) = tracker();
		let record = record(3, 1, 7);

		assert!(!tracker.is_processed(&record));
		tracker.commit(&record).unwrap();
		assert!(tracker.is_processed(&record));
		assert_eq!(
			tracker.cursor(ContractModule::WorkerRegistry),
			Some(EventCursor::new(3, 1))
		);
	}

	#[test]
	fn events_below_cursor_count_as_processed() {
		let (_dir, tracker) = tracker();
		tracker.commit(&record(5, 0, 1)).unwrap();
		// A different digest, but an earlier cursor position.
		assert!(tracker.is_processed(&record(4, 9, 2)));
		assert!(!tracker.is_processed(&record(6, 0, 3)));
	}

	#[test]
	fn sibling_events_of_one_transaction_are_distinct() {
		let (_dir, tracker) = tracker();
		let first = record(3, 0, 7);
		let second = record(3, 1, 7);

		tracker.commit(&first).unwrap();
		// Same digest, later intra-block index: not yet processed.
		assert!(!tracker.is_processed(&second));
	}

	#[test]
	fn completion_tracker_releases_contiguous_prefix_only() {
		let mut tracker = CompletionTracker::default();
		let (a, b, c) = (status_record(1), status_record(2), status_record(3));
		tracker.begin(a.clone());
		tracker.begin(b.clone());
		tracker.begin(c.clone());

		// Completing out of order releases nothing past the gap.
		assert!(tracker.complete(c.cursor()).is_empty());
		assert_eq!(
			tracker
				.complete(a.cursor())
				.iter()
				.map(|r| r.block_height)
				.collect::<Vec<_>>(),
			vec![1]
		);
		// Filling the gap releases the rest in order.
		assert_eq!(
			tracker
				.complete(b.cursor())
				.iter()
				.map(|r| r.block_height)
				.collect::<Vec<_>>(),
			vec![2, 3]
		);
	}
}
