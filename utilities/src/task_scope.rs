//! Structured task spawning.
//!
//! A scope owns every task spawned inside it. If any strongly spawned task
//! returns an error or panics, the scope tears down: the main future and all
//! sibling tasks are cancelled and the error is returned from [task_scope].
//! When the main future completes, all remaining tasks are cancelled.

use futures::{
	future::BoxFuture,
	stream::{FuturesUnordered, StreamExt},
	Future,
};
use std::{
	marker::PhantomData,
	pin::Pin,
	task::{Context, Poll},
};
use tokio::{
	sync::{mpsc, oneshot},
	task::JoinHandle,
};

enum SpawnedTask<E> {
	Strong(JoinHandle<Result<(), E>>),
	Weak(JoinHandle<()>),
}

pub struct Scope<'env, E: Send + 'static> {
	sender: mpsc::UnboundedSender<SpawnedTask<E>>,
	/// Ties the scope to the stack frame that created it.
	_lifetime: PhantomData<&'env ()>,
}

impl<'env, E: Send + 'static> Scope<'env, E> {
	/// Spawn a task whose failure fails the whole scope.
	pub fn spawn<F>(&self, future: F)
	where
		F: Future<Output = Result<(), E>> + Send + 'static,
	{
		// The receiver only goes away once the scope is unwinding, at which
		// point the spawned task is aborted anyway.
		let _ = self.sender.send(SpawnedTask::Strong(tokio::spawn(future)));
	}

	/// Spawn a task that neither keeps the scope alive nor fails it. Used
	/// for auxiliary servers that should die with the scope.
	pub fn spawn_weak<F>(&self, future: F)
	where
		F: Future<Output = Result<(), E>> + Send + 'static,
	{
		let _ = self.sender.send(SpawnedTask::Weak(tokio::spawn(async move {
			let _ = future.await;
		})));
	}

	/// Spawn a strong task and get a handle resolving to its output.
	///
	/// If the task fails, the scope fails; the handle then never resolves
	/// (the awaiting future is dropped during scope teardown).
	pub fn spawn_with_handle<T, F>(&self, future: F) -> ScopedJoinHandle<T>
	where
		T: Send + 'static,
		F: Future<Output = Result<T, E>> + Send + 'static,
	{
		let (result_sender, result_receiver) = oneshot::channel();
		self.spawn(async move {
			let value = future.await?;
			let _ = result_sender.send(value);
			Ok(())
		});
		ScopedJoinHandle { receiver: Some(result_receiver) }
	}
}

pub struct ScopedJoinHandle<T> {
	receiver: Option<oneshot::Receiver<T>>,
}

impl<T> Future for ScopedJoinHandle<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
		let this = self.get_mut();
		match this.receiver.as_mut() {
			Some(receiver) => match Pin::new(receiver).poll(cx) {
				Poll::Ready(Ok(value)) => Poll::Ready(value),
				// The task failed; the scope is unwinding and will drop us.
				Poll::Ready(Err(_)) => {
					this.receiver = None;
					Poll::Pending
				},
				Poll::Pending => Poll::Pending,
			},
			None => Poll::Pending,
		}
	}
}

/// Run `f` with a fresh scope, driving the returned future alongside all
/// tasks spawned into the scope.
pub async fn task_scope<'env, T, E, F>(f: F) -> Result<T, E>
where
	T: Send + 'static,
	E: Send + 'static,
	F: for<'scope> FnOnce(&'scope Scope<'env, E>) -> BoxFuture<'scope, Result<T, E>>,
{
	let (sender, mut receiver) = mpsc::unbounded_channel();
	let scope = Scope { sender, _lifetime: PhantomData };

	let mut strong_tasks = FuturesUnordered::new();
	let mut weak_tasks: Vec<JoinHandle<()>> = Vec::new();

	let result = {
		let mut main_future = f(&scope);
		loop {
			tokio::select! {
				main_result = &mut main_future => break main_result,
				Some(task) = receiver.recv() => match task {
					SpawnedTask::Strong(handle) => strong_tasks.push(handle),
					SpawnedTask::Weak(handle) => weak_tasks.push(handle),
				},
				Some(join_result) = strong_tasks.next() => match join_result {
					Ok(Ok(())) => {},
					Ok(Err(error)) => break Err(error),
					Err(join_error) => {
						if join_error.is_panic() {
							for handle in strong_tasks.iter() {
								handle.abort();
							}
							for handle in &weak_tasks {
								handle.abort();
							}
							std::panic::resume_unwind(join_error.into_panic());
						}
						// Aborted tasks surface here during teardown only.
					},
				},
			}
		}
	};

	for handle in strong_tasks.iter() {
		handle.abort();
	}
	for handle in &weak_tasks {
		handle.abort();
	}

	result
}
