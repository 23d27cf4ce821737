use std::{net::SocketAddr, path::PathBuf, process::ExitCode};

use basalt_node::{ledger::LedgerConstants, Node, Settings};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "basalt-node", about = "Block-lattice DPoS node")]
struct Cli {
	/// Data directory for ledger and wallet databases.
	#[arg(long, env = "BASALT_DATA_PATH", default_value = "basalt-data")]
	data_path: PathBuf,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Run the node until interrupted.
	Start,
	/// Run one bootstrap attempt against the given peers, then exit.
	Bootstrap {
		endpoints: Vec<SocketAddr>,
	},
	/// Create a wallet and print its id.
	WalletCreate,
	/// List wallet ids.
	WalletList,
	/// Print the ledger database schema version.
	DbVersion,
}

#[tokio::main]
async fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let cli = Cli::parse();
	let settings = match Settings::new(Some(&cli.data_path)) {
		Ok(settings) => settings,
		Err(error) => {
			error!("Bad configuration: {error}");
			return ExitCode::from(1)
		},
	};

	match run(cli, settings).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(error) => {
			error!("{error:#}");
			ExitCode::from(2)
		},
	}
}

async fn run(cli: Cli, settings: Settings) -> anyhow::Result<()> {
	match cli.command {
		Command::Start => {
			let node = Node::start(&cli.data_path, &settings, LedgerConstants::dev()).await?;
			tokio::signal::ctrl_c().await?;
			node.stop().await;
		},
		Command::Bootstrap { endpoints } => {
			if endpoints.is_empty() {
				anyhow::bail!("no bootstrap endpoints given");
			}
			let node = Node::start(&cli.data_path, &settings, LedgerConstants::dev()).await?;
			let summary = node.bootstrapper.bootstrap(endpoints).await?;
			println!(
				"pulled {} block(s), pushed {} block(s)",
				summary.pulled_blocks, summary.pushed_blocks
			);
			node.stop().await;
		},
		Command::WalletCreate => {
			let node = Node::start(&cli.data_path, &settings, LedgerConstants::dev()).await?;
			let id = node.wallets.create()?;
			println!("{id}");
			node.stop().await;
		},
		Command::WalletList => {
			let node = Node::start(&cli.data_path, &settings, LedgerConstants::dev()).await?;
			for id in node.wallets.wallet_ids() {
				println!("{id}");
			}
			node.stop().await;
		},
		Command::DbVersion => {
			let store = basalt_node::store::Store::open(&cli.data_path.join("data.ldb"))?;
			let txn = store.tx_begin_read();
			println!("{}", store.version(&txn).unwrap_or(0));
		},
	}
	Ok(())
}
