//! Command line parsing.

use std::path::PathBuf;
use std::time::Duration;

pub const USAGE: &str = "\
usage: cycleprof <command> [options]

commands:
  serve   run a simulated graph with the profiler and serve it over TCP
  top     connect to a profiler and print one line per cycle

serve options:
  --config <path>      configuration file (default: ~/.config/cycleprof/config.toml)
  --listen <addr>      listen address, overrides [server] listen
  --duration <secs>    stop after this many seconds
  --followers <n>      simulated follower nodes (default 3)
  --quantum <n>        simulated quantum in samples (default 1024)
  --xrun-every <n>     make every n-th cycle overrun

top options:
  --connect <addr>     profiler address (default 127.0.0.1:4713)
  --json               print records as JSON lines
  --count <n>          exit after n records

  -v, --verbose        debug logging";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Serve(ServeOptions),
    Top(TopOptions),
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServeOptions {
    pub config: Option<PathBuf>,
    pub listen: Option<String>,
    pub duration: Option<Duration>,
    pub followers: Option<usize>,
    pub quantum: Option<u32>,
    pub xrun_every: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopOptions {
    pub connect: String,
    pub json: bool,
    pub count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub verbose: bool,
    pub command: Command,
}

fn value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn parsed<T: std::str::FromStr>(args: &[String], flag: &str) -> Result<Option<T>, String> {
    match value(args, flag) {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| format!("invalid value for {}: '{}'", flag, v)),
        None => Ok(None),
    }
}

/// Parse arguments, without the program name.
pub fn parse(args: &[String]) -> Result<Args, String> {
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    let command = match args.first().map(String::as_str) {
        Some("serve") => Command::Serve(ServeOptions {
            config: value(args, "--config").map(PathBuf::from),
            listen: value(args, "--listen").map(str::to_string),
            duration: parsed::<f64>(args, "--duration")?
                .filter(|s| *s > 0.0)
                .map(Duration::from_secs_f64),
            followers: parsed(args, "--followers")?,
            quantum: parsed::<u32>(args, "--quantum")?.filter(|q| *q > 0),
            xrun_every: parsed(args, "--xrun-every")?,
        }),
        Some("top") => Command::Top(TopOptions {
            connect: value(args, "--connect")
                .unwrap_or("127.0.0.1:4713")
                .to_string(),
            json: args.iter().any(|a| a == "--json"),
            count: parsed(args, "--count")?,
        }),
        Some("help") | Some("--help") | Some("-h") | None => Command::Help,
        Some(other) => return Err(format!("unknown command '{}'", other)),
    };
    Ok(Args { verbose, command })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn parses_serve() {
        let parsed = parse(&args("serve --listen 0.0.0.0:9000 --duration 2.5 --followers 5 -v")).unwrap();
        assert!(parsed.verbose);
        match parsed.command {
            Command::Serve(opts) => {
                assert_eq!(opts.listen.as_deref(), Some("0.0.0.0:9000"));
                assert_eq!(opts.duration, Some(Duration::from_millis(2500)));
                assert_eq!(opts.followers, Some(5));
                assert_eq!(opts.quantum, None);
            }
            other => panic!("expected serve, got {:?}", other),
        }
    }

    #[test]
    fn parses_top_defaults() {
        let parsed = parse(&args("top --json")).unwrap();
        assert_eq!(
            parsed.command,
            Command::Top(TopOptions {
                connect: "127.0.0.1:4713".into(),
                json: true,
                count: None,
            })
        );
    }

    #[test]
    fn rejects_bad_numbers_and_commands() {
        assert!(parse(&args("serve --followers lots")).is_err());
        assert!(parse(&args("record")).is_err());
        assert_eq!(parse(&[]).unwrap().command, Command::Help);
    }
}
