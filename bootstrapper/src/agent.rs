//! Supervision of the orchestrator agent child process.
//!
//! The supervisor exclusively owns the child; the child exclusively owns
//! its data directory. Shutdown is graceful first (SIGTERM), forced after
//! five seconds.

use anyhow::{Context, Result};
use ck_primitives::NodeId;
use std::{
	collections::VecDeque,
	path::PathBuf,
	process::Stdio,
	time::{Duration, Instant},
};
use tokio::{
	process::{Child, Command},
	sync::{mpsc, oneshot},
	time::timeout,
};
use tracing::{info, warn};

const GRACEFUL_SHUTDOWN_WINDOW: Duration = Duration::from_secs(5);
const RESTART_WINDOW: Duration = Duration::from_secs(300);
const MAX_RESTARTS_IN_WINDOW: usize = 3;
const RESPAWN_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum AgentCommand {
	/// Stop and respawn the child (heartbeat trouble).
	Restart,
	/// Stop the child for good and acknowledge.
	Shutdown(oneshot::Sender<()>),
}

pub struct AgentSupervisor {
	binary_path: PathBuf,
	data_dir: PathBuf,
	node_id: NodeId,
	master_endpoint: String,
	join_token: String,
	commands: mpsc::Receiver<AgentCommand>,
}

impl AgentSupervisor {
	pub fn new(
		binary_path: PathBuf,
		data_dir: PathBuf,
		node_id: NodeId,
		master_endpoint: String,
		join_token: String,
	) -> (Self, mpsc::Sender<AgentCommand>) {
		let (sender, commands) = mpsc::channel(4);
		(
			Self { binary_path, data_dir, node_id, master_endpoint, join_token, commands },
			sender,
		)
	}

	fn spawn_agent(&self) -> Result<Child> {
		info!(binary = %self.binary_path.display(), node_id = %self.node_id, "spawning agent");
		Command::new(&self.binary_path)
			.arg("--server")
			.arg(&self.master_endpoint)
			.arg("--token")
			.arg(&self.join_token)
			.arg("--node-name")
			.arg(self.node_id.as_str())
			.arg("--data-dir")
			.arg(&self.data_dir)
			.stdin(Stdio::null())
			.stdout(Stdio::inherit())
			.stderr(Stdio::inherit())
			.kill_on_drop(true)
			.spawn()
			.with_context(|| {
				format!("could not spawn agent binary {}", self.binary_path.display())
			})
	}

	/// Runs until shut down, respawning the child on unexpected exits. More
	/// than three unexpected exits within five minutes is fatal.
	pub async fn run(mut self) -> Result<()> {
		let mut recent_exits: VecDeque<Instant> = VecDeque::new();
		let mut child = self.spawn_agent()?;

		loop {
			tokio::select! {
				exit = child.wait() => {
					let status = exit.context("could not wait on agent child")?;
					warn!(%status, "agent exited unexpectedly");

					let now = Instant::now();
					recent_exits.push_back(now);
					while recent_exits
						.front()
						.is_some_and(|at| now.duration_since(*at) > RESTART_WINDOW)
					{
						recent_exits.pop_front();
					}
					if recent_exits.len() > MAX_RESTARTS_IN_WINDOW {
						anyhow::bail!(
							"agent exited {} times within {:?}, giving up",
							recent_exits.len(),
							RESTART_WINDOW
						);
					}

					tokio::time::sleep(RESPAWN_DELAY).await;
					child = self.spawn_agent()?;
				},
				Some(command) = self.commands.recv() => match command {
					AgentCommand::Restart => {
						info!("restarting agent on request");
						shutdown_child(&mut child).await;
						child = self.spawn_agent()?;
					},
					AgentCommand::Shutdown(done) => {
						info!("stopping agent");
						shutdown_child(&mut child).await;
						let _ = done.send(());
						return Ok(())
					},
				},
			}
		}
	}
}

/// SIGTERM, a grace window, then SIGKILL.
async fn shutdown_child(child: &mut Child) {
	#[cfg(unix)]
	{
		use nix::{
			sys::signal::{self, Signal},
			unistd::Pid,
		};
		if let Some(pid) = child.id() {
			let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
		}
	}

	match timeout(GRACEFUL_SHUTDOWN_WINDOW, child.wait()).await {
		Ok(Ok(status)) => info!(%status, "agent exited"),
		Ok(Err(error)) => warn!(%error, "error waiting for agent exit"),
		Err(_) => {
			warn!("agent ignored the shutdown signal, killing");
			let _ = child.kill().await;
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::os::unix::fs::PermissionsExt;

	/// A fake agent binary: a script that ignores the agent flags.
	fn fake_agent(dir: &tempfile::TempDir, body: &str) -> PathBuf {
		let path = dir.path().join("agent.sh");
		std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
		std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
		path
	}

	fn supervisor_for(binary: PathBuf) -> (AgentSupervisor, mpsc::Sender<AgentCommand>) {
		AgentSupervisor::new(
			binary,
			PathBuf::from("/tmp"),
			NodeId::from("w1"),
			"http://localhost:8950".to_string(),
			"token".to_string(),
		)
	}

	#[tokio::test]
	async fn shutdown_stops_the_supervisor() {
		let dir = tempfile::tempdir().unwrap();
		let (supervisor, commands) = supervisor_for(fake_agent(&dir, "sleep 60"));
		let handle = tokio::spawn(supervisor.run());

		tokio::time::sleep(Duration::from_millis(200)).await;
		let (done_tx, done_rx) = oneshot::channel();
		commands.send(AgentCommand::Shutdown(done_tx)).await.unwrap();
		done_rx.await.unwrap();

		handle.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn crash_looping_agent_exhausts_the_restart_budget() {
		let dir = tempfile::tempdir().unwrap();
		let (supervisor, _commands) = supervisor_for(fake_agent(&dir, "exit 1"));

		let error = tokio::time::timeout(Duration::from_secs(30), supervisor.run())
			.await
			.expect("budget should be exhausted quickly")
			.unwrap_err();
		assert!(error.to_string().contains("giving up"));
	}

	#[tokio::test]
	async fn restart_respawns_the_child() {
		let dir = tempfile::tempdir().unwrap();
		let (supervisor, commands) = supervisor_for(fake_agent(&dir, "sleep 60"));
		let handle = tokio::spawn(supervisor.run());

		tokio::time::sleep(Duration::from_millis(200)).await;
		commands.send(AgentCommand::Restart).await.unwrap();
		tokio::time::sleep(Duration::from_millis(200)).await;

		// Still running after the restart; shut down cleanly.
		let (done_tx, done_rx) = oneshot::channel();
		commands.send(AgentCommand::Shutdown(done_tx)).await.unwrap();
		done_rx.await.unwrap();
		handle.await.unwrap().unwrap();
	}
}
