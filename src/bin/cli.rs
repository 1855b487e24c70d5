use clap::{App, Arg, ArgMatches, SubCommand};
use log::{info, warn};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
    sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd::read,
};
use pagebridge::{
    daemon::{AccessMode, ConsumerDaemon, DaemonConfig},
    error::XferError,
    memory::ArenaConfig,
    transport::{ControlChannel, ControlServer, ServerConfig, UnixChannel, UnixConnector},
    AcquireMode, Result, ShutdownFlag, SubsystemConfig, XferContext,
};
use std::{
    os::fd::AsRawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

const DEFAULT_SOCKET: &str = "/tmp/pagebridge.sock";
const STDIN_POLL_MS: i32 = 100;

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

fn main() -> Result<()> {
    let matches = App::new("pagebridge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Zero-copy page transfer queue")
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .global(true)
                .help("Increase log verbosity (repeat for more)"),
        )
        .arg(
            Arg::with_name("socket")
                .short("s")
                .long("socket")
                .value_name("PATH")
                .help("Control socket path")
                .default_value(DEFAULT_SOCKET)
                .global(true)
                .takes_value(true),
        )
        .subcommand(
            SubCommand::with_name("host")
                .about("Own a transfer queue and serve it on the control socket")
                .arg(
                    Arg::with_name("copy")
                        .long("copy")
                        .help("Copy written data into fresh pages instead of pinning in place"),
                )
                .arg(
                    Arg::with_name("max_items")
                        .short("m")
                        .long("max-items")
                        .value_name("COUNT")
                        .help("Maximum number of queued items")
                        .default_value("128")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("frames")
                        .short("f")
                        .long("frames")
                        .value_name("COUNT")
                        .help("Number of page frames in the arena")
                        .default_value("256")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("daemon")
                .about("Consume, inspect and release queued items")
                .arg(
                    Arg::with_name("read")
                        .long("read")
                        .help("Copy items through the read path instead of mapping them"),
                )
                .arg(
                    Arg::with_name("dump")
                        .long("dump")
                        .help("Log hex dumps of inspected items"),
                ),
        )
        .subcommand(SubCommand::with_name("inspect").about("Print the queue depth and head item"))
        .get_matches();

    init_logging(matches.occurrences_of("verbose"));
    let socket = matches.value_of("socket").unwrap_or(DEFAULT_SOCKET).to_string();

    match matches.subcommand() {
        ("host", Some(host_matches)) => handle_host(host_matches, &socket)?,
        ("daemon", Some(daemon_matches)) => handle_daemon(daemon_matches, &socket)?,
        ("inspect", Some(_)) => handle_inspect(&socket)?,
        _ => {
            println!("Pagebridge - Zero-copy page transfer queue");
            println!("Use --help for usage information");
        }
    }

    Ok(())
}

fn init_logging(verbosity: u64) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(SigHandler::Handler(handle_signal), SaFlags::empty(), SigSet::empty());
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

fn parse_count(matches: &ArgMatches, name: &str) -> Result<usize> {
    matches
        .value_of(name)
        .unwrap_or_default()
        .parse()
        .map_err(|_| XferError::invalid_parameter(name, "Invalid count"))
}

fn handle_host(matches: &ArgMatches, socket: &str) -> Result<()> {
    let mode = if matches.is_present("copy") {
        AcquireMode::Copy
    } else {
        AcquireMode::ZeroCopy
    };
    let config = SubsystemConfig::default()
        .with_acquire_mode(mode)
        .with_max_items(parse_count(matches, "max_items")?)
        .with_arena(ArenaConfig::new("pagebridge_host", parse_count(matches, "frames")?));

    install_signal_handlers()?;
    let ctx = Arc::new(XferContext::init(config)?);
    let server = ControlServer::bind(Arc::clone(&ctx), ServerConfig::new(socket))?.spawn()?;

    println!("Serving {:?} queue on {}", mode, socket);
    println!("Each line on stdin becomes one item; Ctrl-C to stop");

    let mut offset = 0i64;
    let mut queue_line = |bytes: &[u8]| {
        let result = match mode {
            AcquireMode::ZeroCopy => ctx.arena().alloc_page().and_then(|mut page| {
                let len = bytes.len().min(page.len());
                page.write(0, &bytes[..len])?;
                ctx.enqueue_write(offset, page.as_slice(), len)
            }),
            AcquireMode::Copy => ctx.enqueue_write(offset, bytes, bytes.len()),
        };
        match result {
            Ok(written) => {
                info!("Queued {} bytes at offset {} (depth {})", written, offset, ctx.count());
                offset += written as i64;
            }
            Err(e) => warn!("Write rejected: {}", e),
        }
    };

    // Stdin is polled so a signal is noticed while no input arrives
    let stdin = std::io::stdin();
    let mut pending = Vec::new();
    let mut chunk = [0u8; 4096];
    while !SIGNALLED.load(Ordering::SeqCst) {
        let mut fds = [PollFd::new(&stdin, PollFlags::POLLIN)];
        match poll(&mut fds, STDIN_POLL_MS) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        let n = match read(stdin.as_raw_fd(), &mut chunk) {
            Ok(n) => n,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            if !pending.is_empty() {
                queue_line(&pending);
                pending.clear();
            }
            break;
        }

        pending.extend_from_slice(&chunk[..n]);
        for line in take_lines(&mut pending) {
            queue_line(&line);
        }
    }

    while !SIGNALLED.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    let stats = server.stop()?;
    let report = ctx.teardown();
    println!("Connections served: {}", stats.connections);
    println!("Requests served: {}", stats.requests);
    println!("Items drained at shutdown: {}", report.drained_items);
    Ok(())
}

/// Split complete lines off the front of `pending`, dropping their endings
fn take_lines(pending: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(end) = pending.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(line);
    }
    lines
}

fn handle_daemon(matches: &ArgMatches, socket: &str) -> Result<()> {
    let access_mode = if matches.is_present("read") {
        AccessMode::Read
    } else {
        AccessMode::Map
    };
    let config = DaemonConfig::default()
        .with_access_mode(access_mode)
        .with_verbose(matches.is_present("dump"));

    install_signal_handlers()?;
    let shutdown = ShutdownFlag::new();
    let forward = shutdown.clone();
    thread::spawn(move || {
        while !SIGNALLED.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(50));
        }
        forward.request();
    });

    let mut daemon = ConsumerDaemon::new(UnixConnector::new(socket), config)?.with_shutdown(shutdown);
    let stats = daemon.run();

    println!("\nConsumer statistics:");
    println!("  Processed: {}", stats.processed);
    println!("  Empty items: {}", stats.empty_items);
    println!("  Bytes inspected: {}", stats.bytes);
    println!("  Map failures: {}", stats.map_failures);
    println!("  Errors: {}", stats.errors);
    println!("  Reconnects: {}", stats.reconnects);
    Ok(())
}

fn handle_inspect(socket: &str) -> Result<()> {
    let mut channel = UnixChannel::connect(socket, Some(Duration::from_secs(5)))?;
    let count = channel.count()?;
    println!("Queue depth: {}", count);

    match channel.info() {
        Ok(info) => {
            println!("Head item:");
            println!("  Offset: {}", info.offset);
            println!("  Size: {} bytes", info.size);
            println!("  Frame: {}", info.frame_id);
        }
        Err(XferError::NoItem) => println!("Queue is empty"),
        Err(e) => return Err(e),
    }
    Ok(())
}
