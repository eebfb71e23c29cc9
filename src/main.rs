use std::sync::Arc;

use log::info;

use i2pnetd::{Config, NetworkManager, RpcServer};

fn main() -> anyhow::Result<()> {
	let config = Config::load()?;
	env_logger::Builder::from_default_env()
		.filter_level(config.log_level.as_filter())
		.init();

	let manager = Arc::new(NetworkManager::new(config.clone()));
	let server = RpcServer::bind(&config.socket_path, manager.clone())?;
	info!("i2pnetd ready on {}", config.socket_path);

	let result = server.serve();
	manager.shutdown();
	result?;
	Ok(())
}
