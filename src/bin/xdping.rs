//
// Sends ICMP echo requests as raw Ethernet frames over an AF_XDP socket and prints the replies.
//
// Replies only reach the socket when an XDP program redirects them to it, so either pass the
// filter object with --program (needs the libbpf feature) or attach one beforehand.
//
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cli_table::{format::Justify, Table, WithTitle};
use rlimit::{setrlimit, Resource};
use structopt::StructOpt;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use afxdp_ping::config::Config;
use afxdp_ping::ping::{PingParams, PingStats, Pinger};
use afxdp_ping::proto::MacAddr;
use afxdp_ping::socket::{Readiness, Socket};

#[derive(StructOpt, Debug)]
#[structopt(name = "xdping")]
enum Cmd {
    /// Ping a host on the local link
    Ping(PingOpt),
}

#[derive(StructOpt, Debug)]
struct PingOpt {
    #[structopt(long, short = "i")]
    interface: String,

    #[structopt(long, default_value = "0")]
    queue: u32,

    #[structopt(long)]
    src_mac: MacAddr,

    #[structopt(long)]
    dst_mac: MacAddr,

    #[structopt(long)]
    src_ip: Ipv4Addr,

    #[structopt(long)]
    dst_ip: Ipv4Addr,

    /// Requests to send
    #[structopt(long, short = "c", default_value = "4")]
    count: u64,

    #[structopt(long, default_value = "1000")]
    interval_ms: u64,

    #[structopt(long, default_value = "1000")]
    timeout_ms: u64,

    /// ICMP payload bytes
    #[structopt(long, short = "s", default_value = "56")]
    size: usize,

    /// Verify checksums, identifier and sender of replies
    #[structopt(long)]
    strict: bool,

    /// YAML file with socket, rule and program settings
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// XDP object to load and attach, overriding the config file
    #[structopt(long, parse(from_os_str))]
    program: Option<PathBuf>,

    #[structopt(long)]
    zero_copy: bool,

    #[structopt(long, conflicts_with = "zero-copy")]
    copy: bool,

    #[structopt(long)]
    huge_tlb: bool,

    /// Pin to this CPU core
    #[structopt(long)]
    core: Option<usize>,
}

#[derive(Debug, Table)]
struct SummaryRow {
    #[table(name = "Host")]
    host: Ipv4Addr,
    #[table(name = "Sent", justify = "Justify::Right")]
    sent: u64,
    #[table(name = "Received", justify = "Justify::Right")]
    received: u64,
    #[table(name = "Loss (%)", justify = "Justify::Right")]
    loss: String,
    #[table(name = "Dup", justify = "Justify::Right")]
    duplicates: u64,
    #[table(name = "Late", justify = "Justify::Right")]
    late: u64,
    #[table(name = "Min (ms)", justify = "Justify::Right")]
    min: String,
    #[table(name = "Avg (ms)", justify = "Justify::Right")]
    avg: String,
    #[table(name = "Max (ms)", justify = "Justify::Right")]
    max: String,
}

fn ms(d: Option<Duration>) -> String {
    match d {
        Some(d) => format!("{:.3}", d.as_secs_f64() * 1000.0),
        None => "-".to_string(),
    }
}

impl SummaryRow {
    fn new(host: Ipv4Addr, stats: &PingStats) -> SummaryRow {
        SummaryRow {
            host,
            sent: stats.sent,
            received: stats.received,
            loss: format!("{:.1}", stats.loss_percent()),
            duplicates: stats.duplicates,
            late: stats.late,
            min: ms(stats.min_rtt),
            avg: ms(stats.avg_rtt()),
            max: ms(stats.max_rtt),
        }
    }
}

fn fail<E: std::fmt::Display>(step: &str, err: E) -> ! {
    eprintln!("{} failed: {}", step, err);
    process::exit(1);
}

fn load_config(opt: &PingOpt) -> Config {
    let mut config = match &opt.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(err) => fail("loading config", err),
        },
        None => Config::default(),
    };

    config.socket.zero_copy |= opt.zero_copy;
    config.socket.copy |= opt.copy;
    config.socket.huge_tlb |= opt.huge_tlb;
    if let Some(path) = &opt.program {
        config.program = Some(afxdp_ping::config::ProgramConfig::new(path));
    }

    if let Err(err) = config.validate() {
        fail("validating config", err);
    }

    config
}

#[cfg(feature = "libbpf")]
fn setup_program(
    config: &Config,
    opt: &PingOpt,
    socket: &mut Socket,
) -> Option<afxdp_ping::program::XdpProgram> {
    use afxdp_ping::program::XdpProgram;

    let program_config = config.program.as_ref()?;

    let r = XdpProgram::load(program_config);
    let mut program = match r {
        Ok(program) => program,
        Err(err) => fail("loading XDP program", err),
    };

    let table = match config.rule_table() {
        Ok(table) => table,
        Err(err) => fail("building rule table", err),
    };
    if let Err(err) = program.sync_rules(&table) {
        fail("installing rules", err);
    }
    if let Err(err) = program.register(socket) {
        fail("registering socket", err);
    }
    if let Err(err) = program.attach(&opt.interface) {
        fail("attaching XDP program", err);
    }

    Some(program)
}

#[cfg(not(feature = "libbpf"))]
fn setup_program(config: &Config, _opt: &PingOpt, _socket: &mut Socket) -> Option<()> {
    if config.program.is_some() {
        fail(
            "loading XDP program",
            "built without the libbpf feature; attach the program externally",
        );
    }

    None
}

fn ping(opt: PingOpt) -> i32 {
    let config = load_config(&opt);

    if let Some(id) = opt.core {
        if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
            warn!("pinning to core {} failed", id);
        }
    }

    if let Err(err) = setrlimit(Resource::MEMLOCK, rlimit::INFINITY, rlimit::INFINITY) {
        warn!("raising the memlock limit failed: {}", err);
    }

    let r = Socket::open(&opt.interface, opt.queue, &config.socket);
    let mut socket = match r {
        Ok(socket) => socket,
        Err(err) => fail("opening socket", err),
    };

    // Detached when this returns, after the socket is closed
    let _program = setup_program(&config, &opt, &mut socket);

    let filled = socket.fill_reserve();
    debug!("filled {} frames", filled);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(err) = ctrlc::set_handler(move || r.store(false, Ordering::SeqCst)) {
        warn!("installing the CTRL-C handler failed: {}", err);
    }

    let mut params = PingParams::new(opt.src_mac, opt.dst_mac, opt.src_ip, opt.dst_ip);
    params.payload_size = opt.size;
    params.timeout = Duration::from_millis(opt.timeout_ms);
    params.strict = opt.strict;

    let mut pinger = Pinger::new(params);
    let interval = Duration::from_millis(opt.interval_ms);

    info!(
        "PING {} ({} bytes of data) via {} queue {}",
        opt.dst_ip, opt.size, opt.interface, opt.queue
    );

    let mut next_send = Instant::now();
    let mut last_send = None;
    let mut failed = false;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();

        if pinger.stats().sent < opt.count && now >= next_send {
            let r = pinger.send(&mut socket, now);
            match r {
                Ok(Some(seq)) => debug!("sent seq={}", seq),
                Ok(None) => warn!("no frame or tx slot free, request skipped"),
                Err(err) => {
                    eprintln!("sending request failed: {}", err);
                    failed = true;
                    break;
                }
            }
            next_send = now + interval;
            last_send = Some(now);
        }

        let r = socket.poll(Duration::from_millis(10));
        match r {
            Ok(Readiness::Ready) => {
                let r = pinger.receive(&mut socket, Instant::now());
                match r {
                    Ok(replies) => {
                        for reply in replies {
                            println!(
                                "{} bytes from {}: seq={} ttl={} time={:.3} ms",
                                reply.bytes,
                                reply.from,
                                reply.seq,
                                reply.ttl,
                                reply.rtt.as_secs_f64() * 1000.0
                            );
                        }
                    }
                    Err(err) => {
                        eprintln!("receiving replies failed: {}", err);
                        failed = true;
                        break;
                    }
                }
            }
            Ok(Readiness::Timeout) => {}
            Err(err) => {
                eprintln!("polling socket failed: {}", err);
                failed = true;
                break;
            }
        }

        let now = Instant::now();
        pinger.expire(now);

        let done_sending = pinger.stats().sent >= opt.count;
        let waited = last_send.map_or(true, |t| now.duration_since(t) >= pinger.params().timeout);
        if done_sending && (pinger.outstanding() == 0 || waited) {
            break;
        }
    }

    match socket.kernel_stats() {
        Ok(Some(k)) => debug!("kernel stats: {:?}", k),
        Ok(None) => {}
        Err(err) => warn!("{}", err),
    }
    debug!("socket stats: {:?}", socket.stats());

    let stats = pinger.finish();
    let rows = vec![SummaryRow::new(opt.dst_ip, &stats)];
    if let Err(err) = cli_table::print_stdout(rows.with_title()) {
        println!("error: {:?}", err);
    }

    socket.close();

    if failed {
        1
    } else {
        0
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let code = match Cmd::from_args() {
        Cmd::Ping(opt) => ping(opt),
    };
    process::exit(code);
}
