use std::{
    error::Error,
    net::SocketAddr,
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use clap::Parser;
use crossbeam::channel::{bounded, select, tick};
use svcsock::{
    app::echo::Echo,
    common::Config,
    framework::os::{LocalRegister, Poller, TcpListener, UdpSocket},
    registry::{Registry, Worker},
};
use tracing::{info, warn};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    #[derive(Parser, Debug)]
    #[clap(name = "Svcsock Echo Server", version)]
    struct Args {
        /// Properties file, see `common::config`.
        #[clap(short, long, parse(from_os_str))]
        config: Option<PathBuf>,
        #[clap(short, long = "worker-number")]
        n_worker: Option<usize>,
        #[clap(long)]
        udp: Option<SocketAddr>,
        #[clap(long)]
        tcp: Option<SocketAddr>,
    }
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(n_worker) = args.n_worker {
        config.n_worker = n_worker.max(1);
    }
    if args.udp.is_some() {
        config.udp = args.udp;
    }
    if args.tcp.is_some() {
        config.tcp = args.tcp;
    }

    let mut poller = Poller::new()?;
    let reactor = poller.reactor();
    let registry = Registry::new(config.clone(), Arc::new(LocalRegister));
    if let Some(addr) = config.udp {
        let socket = UdpSocket::bind(&reactor, addr)?;
        let sock = registry.add_udp(Box::new(socket))?;
        info!("serving udp as socket {}", sock.id());
    }
    if let Some(addr) = config.tcp {
        let listener = TcpListener::bind(&reactor, addr)?;
        let sock = registry.add_listener(Box::new(listener))?;
        info!("serving tcp as socket {}", sock.id());
    }

    let workers: Vec<_> = (0..config.n_worker).map(|_| registry.worker()).collect();
    let interrupters: Vec<_> = workers.iter().map(Worker::interrupter).collect();
    let shutdown = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler({
        let shutdown = shutdown.clone();
        let interrupters = interrupters.clone();
        move || {
            println!();
            if !shutdown.swap(true, Ordering::SeqCst) {
                for interrupter in &interrupters {
                    interrupter.interrupt();
                }
            } else {
                warn!("double ctrl-c, quit ungracefully");
                process::abort();
            }
        }
    })?;

    let worker_threads: Vec<_> = workers
        .into_iter()
        .map(|mut worker| {
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                let mut echo = Echo::default();
                worker.run(&mut echo, || shutdown.load(Ordering::SeqCst));
                echo.n_call
            })
        })
        .collect();

    let (stop_aging, aging_stopped) = bounded::<()>(0);
    let aging_thread = thread::spawn({
        let registry = registry.clone();
        let ticker = tick(config.connection_max_age.max(Duration::from_secs(1)));
        move || loop {
            select! {
                recv(ticker) -> _ => registry.age_temp_sockets(),
                recv(aging_stopped) -> _ => break,
            }
        }
    });

    info!("start polling with {} workers", config.n_worker);
    let polled = poller.run(|| shutdown.load(Ordering::SeqCst));
    if !shutdown.swap(true, Ordering::SeqCst) {
        for interrupter in &interrupters {
            interrupter.interrupt();
        }
    }

    drop(stop_aging);
    let mut n_call = 0;
    for worker_thread in worker_threads {
        n_call += worker_thread.join().unwrap();
    }
    aging_thread.join().unwrap();
    registry.shutdown();
    info!("served {} calls", n_call);
    println!("{}", registry.stats());
    println!("{}", registry.latency_report());
    Ok(polled?)
}
