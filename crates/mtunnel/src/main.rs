use clap::Parser as _;
use cli::{Cli, Role};
use tokio_util::sync::CancellationToken;

mod cli;
mod client;
mod control;
mod host;
mod log;
mod net;

#[tokio::main]
async fn main() -> eyre::Result<()> {
	let cli = Cli::parse();
	log::init_log(log::level_for_verbosity(cli.verbose))?;

	let shutdown = CancellationToken::new();
	tokio::spawn(watch_shutdown_signals(shutdown.clone()));

	match cli.actas {
		Role::Host => {
			host::run(
				host::HostConfig {
					network: cli.network.into(),
					port: cli.port,
					stun_server: cli.stun_server,
				},
				shutdown,
			)
			.await
		}
		Role::Client => {
			let token = cli.token.ok_or_else(|| eyre::eyre!("-token is required when -actas client"))?;
			client::run(client::ClientRunConfig { port: cli.port, token }, shutdown).await
		}
	}
}

async fn watch_shutdown_signals(shutdown: CancellationToken) {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};

		let mut sigterm = match signal(SignalKind::terminate()) {
			Ok(sigterm) => sigterm,
			Err(err) => {
				mtunnel_core::error!(target: "[MAIN]", "failed to install SIGTERM handler: {err}");
				let _ = tokio::signal::ctrl_c().await;
				shutdown.cancel();
				return;
			}
		};

		tokio::select! {
			_ = tokio::signal::ctrl_c() => {}
			_ = sigterm.recv() => {}
		}
	}

	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}

	shutdown.cancel();
}
