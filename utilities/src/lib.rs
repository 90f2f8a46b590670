pub mod task_scope;

#[cfg(feature = "test-utils")]
pub mod testing;

use futures::{Stream, StreamExt};

/// Extension for streams that are logically unending: when the underlying
/// stream is exhausted, wait forever instead of yielding `None`.
///
/// `FuturesUnordered` yields `None` while empty; inside a `select!` loop that
/// would spin, so callers await `next_or_pending` instead.
pub trait UnendingStream: Stream + Unpin {
	fn next_or_pending(&mut self) -> impl std::future::Future<Output = Self::Item> + Send
	where
		Self: Send,
		Self::Item: Send,
	{
		async {
			match self.next().await {
				Some(item) => item,
				None => futures::future::pending().await,
			}
		}
	}
}

impl<S: Stream + Unpin> UnendingStream for S {}

/// Initialise the process-wide tracing subscriber. Reads `RUST_LOG`;
/// `json` selects machine-readable output for deployments.
pub fn init_tracing(json: bool) {
	let builder = tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env());

	if json {
		builder.json().try_init().expect("setting default subscriber failed");
	} else {
		builder.try_init().expect("setting default subscriber failed");
	}
}
