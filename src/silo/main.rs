//! Silo process entry point: coordinator and storage node launchers
#[macro_use]
extern crate tracing;

mod server;

use std::path::PathBuf;

use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "silo")]
pub enum Command {
	/// Run a coordinator
	#[structopt(name = "server")]
	Server(RunOpt),

	/// Run a storage node
	#[structopt(name = "node")]
	Node(RunOpt),
}

#[derive(StructOpt, Debug)]
pub struct RunOpt {
	/// Configuration file
	#[structopt(short = "c", long = "config", default_value = "./silo.toml")]
	pub config_file: PathBuf,
}

#[tokio::main]
async fn main() {
	if std::env::var("RUST_LOG").is_err() {
		std::env::set_var("RUST_LOG", "silo=info")
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();

	let res = match Command::from_args() {
		Command::Server(opt) => server::run_coordinator(opt.config_file).await,
		Command::Node(opt) => server::run_datanode(opt.config_file).await,
	};

	if let Err(e) = res {
		error!("{}", e);
		std::process::exit(1);
	}
}
