mod cli;
mod top;

use std::error::Error;
use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::info;

use cycleprof_core::{Config, LocalNotifier, Profiler, ProfilerLoop, SimConfig, SimulatedGraph};
use cycleprof_net::{NetHost, ProfilerClient};

use cli::{Command, ServeOptions, TopOptions};
use top::{format_record, GapTracker};

fn init_logging(verbose: bool) {
    use simplelog::{ColorChoice, LevelFilter, TermLogger, TerminalMode};

    let log_level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    if let Err(e) = TermLogger::init(
        log_level,
        simplelog::Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    ) {
        eprintln!("cannot initialize logging: {}", e);
    }
}

fn load_config(opts: &ServeOptions) -> Config {
    match &opts.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn serve(opts: ServeOptions) -> Result<(), Box<dyn Error>> {
    let config = load_config(&opts);
    let listen = opts.listen.clone().unwrap_or_else(|| config.server_listen());

    let host = NetHost::bind(&listen)?.with_max_subscribers(config.max_subscribers());
    let addr = host.local_addr()?;
    let engine = Arc::new(LocalNotifier::new());
    let profiler = Profiler::new(config.profiler_config(), engine.clone(), host)?;
    let looper = ProfilerLoop::spawn(profiler)?;

    let defaults = SimConfig::default();
    let sim = SimulatedGraph::new(SimConfig {
        followers: opts.followers.unwrap_or(defaults.followers),
        quantum: opts.quantum.unwrap_or(defaults.quantum),
        xrun_every: opts.xrun_every,
        ..defaults
    })
    .spawn(engine)?;

    info!("profiler service on {}", addr);
    match opts.duration {
        Some(duration) => thread::sleep(duration),
        None => loop {
            thread::sleep(Duration::from_secs(3600));
        },
    }

    sim.stop();
    looper.shutdown();
    Ok(())
}

fn top(opts: TopOptions) -> Result<(), Box<dyn Error>> {
    let mut client = ProfilerClient::connect(&opts.connect, "cycleprof-top")?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut tracker = GapTracker::default();
    let mut seen = 0u64;

    while let Some(records) = client.recv_records()? {
        for record in &records {
            let gap = tracker.gap(record);
            if opts.json {
                writeln!(out, "{}", serde_json::to_string(record)?)?;
            } else {
                writeln!(out, "{}", format_record(record, gap))?;
            }
            seen += 1;
            if opts.count.is_some_and(|count| seen >= count) {
                out.flush()?;
                client.goodbye()?;
                return Ok(());
            }
        }
        out.flush()?;
    }
    info!("profiler shut down after {} records", seen);
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = match cli::parse(&args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}\n\n{}", e, cli::USAGE);
            return ExitCode::from(2);
        }
    };
    init_logging(args.verbose);

    let result = match args.command {
        Command::Serve(opts) => serve(opts),
        Command::Top(opts) => top(opts),
        Command::Help => {
            println!("{}", cli::USAGE);
            Ok(())
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("cycleprof: {}", e);
            ExitCode::FAILURE
        }
    }
}
