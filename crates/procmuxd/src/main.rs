use procmuxd::{Config, ControlSocket};

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.init();

	let cfg = Config::from_env();
	let control = match ControlSocket::adopt(cfg.control_fd) {
		Ok(control) => control,
		Err(err) => {
			tracing::error!("control socket on fd {} is unusable: {}", cfg.control_fd, err);
			std::process::exit(1);
		}
	};

	if let Err(err) = procmuxd::supervisor::run(cfg, control).await {
		tracing::error!("supervisor failed: {}", err);
		std::process::exit(1);
	}
}
