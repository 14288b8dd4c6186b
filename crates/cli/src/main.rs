//! busline command line tool.
//!
//! Reports engine details and drives the dispatcher and object layers
//! in-process:
//! - `version` / `machine-id` query the engine
//! - `tick` runs a repeating timeout
//! - `ping` calls an echo service over an in-memory connection

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use busline_core::config::{Config, LogConfig};
use busline_core::{UserData, lifecycle};
use busline_mainloop::{Dispatcher, RunMode, Timeout};
use busline_object::{ArgSpec, Connection, HandlerResult, Interface, MemoryTransport, Message, MessageType, MethodSpec, ServiceObject};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

const ECHO_PATH: &str = "/org/busline/Echo";
const ECHO_INTERFACE: &str = "org.busline.Echo";

#[derive(Parser, Debug)]
#[command(name = "busline")]
#[command(about = "D-Bus binding core: engine queries and in-process loop demos")]
struct Cli {
	/// TOML configuration file
	#[arg(short, long, value_name = "PATH", global = true)]
	config: Option<PathBuf>,

	/// Verbose logging
	#[arg(short, long, global = true)]
	verbose: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Print engine and module versions
	Version,
	/// Print the local machine id
	MachineId,
	/// Fire a repeating timeout `count` times
	Tick {
		#[arg(long, default_value_t = 100)]
		interval_ms: u64,
		#[arg(long, default_value_t = 5)]
		count: u32,
		/// Run mode; defaults to the configured one
		#[arg(long)]
		mode: Option<RunMode>,
	},
	/// Call an in-process echo service `count` times
	Ping {
		#[arg(long, default_value_t = 3)]
		count: u32,
		/// Reply timeout; defaults to the configured one
		#[arg(long)]
		timeout_ms: Option<u64>,
	},
}

fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	let config = load_config(cli.config.as_deref())?;
	setup_tracing(cli.verbose, &config.log);

	lifecycle::init().context("starting the engine")?;
	let result = match cli.command {
		Command::Version => version(),
		Command::MachineId => machine_id(),
		Command::Tick { interval_ms, count, mode } => tick(&config, Duration::from_millis(interval_ms), count, mode),
		Command::Ping { count, timeout_ms } => ping(&config, count, timeout_ms.map(Duration::from_millis)),
	};
	let stopped = lifecycle::shutdown();
	debug!(stopped, "engine.shutdown");
	result
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
	match path {
		Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display())),
		None => Ok(Config::default()),
	}
}

fn version() -> anyhow::Result<()> {
	let info = lifecycle::version()?;
	println!("library {}", info.library);
	println!("module  {}", info.module);
	Ok(())
}

fn machine_id() -> anyhow::Result<()> {
	println!("{}", lifecycle::machine_id()?);
	Ok(())
}

fn tick(config: &Config, interval: Duration, count: u32, mode: Option<RunMode>) -> anyhow::Result<()> {
	let mode = match mode {
		Some(mode) => mode,
		None => config.dispatcher.run_mode.parse()?,
	};
	let dispatcher = Dispatcher::with_config(&config.dispatcher)?;
	let fired = Rc::new(Cell::new(0u32));
	let data: UserData = fired.clone();

	let timeout = Timeout::new(
		&dispatcher,
		interval,
		true,
		move |timeout, data| {
			let Some(fired) = data.and_then(|d| d.downcast_ref::<Cell<u32>>()) else {
				anyhow::bail!("tick counter missing");
			};
			fired.set(fired.get() + 1);
			info!(tick = fired.get(), "tick");
			if fired.get() >= count {
				timeout.set_enabled(false)?;
			}
			Ok(())
		},
		Some(data),
	)?;
	if count == 0 {
		return Ok(());
	}
	timeout.set_enabled(true)?;

	info!(backend = dispatcher.backend_name(), %mode, ?interval, count, "tick.start");
	while timeout.is_enabled() {
		dispatcher.run(mode)?;
	}
	println!("fired {}", fired.get());
	Ok(())
}

fn ping(config: &Config, count: u32, timeout: Option<Duration>) -> anyhow::Result<()> {
	let dispatcher = Dispatcher::with_config(&config.dispatcher)?;
	let (client_end, server_end) = MemoryTransport::pair().context("creating transport pair")?;
	let client = Connection::with_config(client_end, config)?;
	let server = Connection::with_config(server_end, config)?;
	client.attach(&dispatcher)?;
	server.attach(&dispatcher)?;
	if let Some(timeout) = timeout {
		client.set_default_timeout(Some(timeout));
	}

	let echo = Interface::new(ECHO_INTERFACE)?.with_handler(|_, connection, message, _| {
		let reply = Message::method_return(message).with_body(message.signature(), message.body().to_vec())?;
		connection.send(reply)?;
		Ok(HandlerResult::Handled)
	});
	echo.register_methods(&[MethodSpec::new("Echo")
		.arg(ArgSpec::new("s").named("text"))
		.arg(ArgSpec::new("s").named("text").direction("out"))])?;
	let object = ServiceObject::new(ECHO_PATH)?;
	object.add_interface(&echo)?;
	server.register_object(&object)?;

	let remaining = Rc::new(Cell::new(count));
	for i in 0..count {
		let message = Message::method_call(None, ECHO_PATH, Some(ECHO_INTERFACE), "Echo")?.with_body("s", format!("ping {i}").into_bytes())?;
		let remaining = Rc::clone(&remaining);
		let stopper = dispatcher.clone();
		client.call(
			message,
			move |call, reply, _| {
				match reply.kind() {
					MessageType::MethodReturn => println!("#{} {}", call.serial(), String::from_utf8_lossy(reply.body())),
					_ => println!("#{} {}", call.serial(), reply.error_name().unwrap_or("error")),
				}
				remaining.set(remaining.get().saturating_sub(1));
				if remaining.get() == 0 {
					stopper.stop()?;
				}
				Ok(())
			},
			None,
		)?;
	}

	if count > 0 {
		dispatcher.run(RunMode::Wait)?;
	}
	client.close();
	server.close();
	Ok(())
}

fn setup_tracing(verbose: bool, log: &LogConfig) {
	use std::fs::OpenOptions;

	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::fmt::format::FmtSpan;
	use tracing_subscriber::prelude::*;

	let filter = || {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| {
			if verbose {
				EnvFilter::new("busline=trace,debug")
			} else {
				EnvFilter::new(&log.filter)
			}
		})
	};

	// BUSLINE_LOG_DIR redirects logs to a per-process file
	if let Some(log_dir) = std::env::var("BUSLINE_LOG_DIR").ok().map(PathBuf::from)
		&& std::fs::create_dir_all(&log_dir).is_ok()
	{
		let log_path = log_dir.join(format!("busline.{}.log", std::process::id()));
		if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
			let file_layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_span_events(FmtSpan::CLOSE)
				.with_target(true);
			tracing_subscriber::registry().with(filter()).with(file_layer).init();
			info!(path = ?log_path, "tracing initialized");
			return;
		}
	}

	tracing_subscriber::fmt().with_env_filter(filter()).with_writer(std::io::stderr).init();
}
