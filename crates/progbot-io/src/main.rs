use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use progbot_io::{
    PeripheralSupervisor, ProcessRegistry, ScanHit, SerialLink, StationConfig, SupervisorConfig,
    SyntheticDriver, logging, worker,
};

const USAGE: &str = "\
Usage: progbot <command> [options]

Commands:
  worker                 Run the peripheral worker on stdin/stdout (spawned by the supervisor)
  send <line>            Send one line over the serial link and print the response
  scan                   Start a camera worker, scan once, print the hit as JSON

Options:
  --config <file>        Station config (JSON) [default: PROGBOT_* environment]
  --port <path>          Serial port (send)
  --baud <rate>          Baud rate (send)
  --timeout <secs>       Exchange timeout, split across retries (send)
  --retries <n>          Attempts (send) or frames to try (scan)";

#[derive(Debug, Default)]
struct Options {
    config: Option<PathBuf>,
    port: Option<String>,
    baud: Option<u32>,
    timeout: Option<f64>,
    retries: Option<u32>,
}

#[derive(Debug)]
enum Invocation {
    Worker,
    Send { options: Options, line: String },
    Scan { options: Options },
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let invocation = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    let code = match invocation {
        Invocation::Worker => run_worker(),
        Invocation::Send { options, line } => report(run_send(options, &line)),
        Invocation::Scan { options } => report(run_scan(options)),
    };
    process::exit(code);
}

fn report(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    }
}

fn parse_args(args: &[String]) -> Result<Invocation, String> {
    let command = args.get(1).ok_or("missing command")?;
    let mut options = Options::default();
    let mut positional: Vec<String> = Vec::new();

    let mut i = 2;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--config" | "--port" | "--baud" | "--timeout" | "--retries" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| format!("{flag} requires a value"))?;
                match flag {
                    "--config" => options.config = Some(PathBuf::from(value)),
                    "--port" => options.port = Some(value.clone()),
                    "--baud" => options.baud = Some(parse_number(flag, value)?),
                    "--timeout" => options.timeout = Some(parse_number(flag, value)?),
                    _ => options.retries = Some(parse_number(flag, value)?),
                }
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    match command.as_str() {
        "worker" => Ok(Invocation::Worker),
        "send" => {
            if positional.is_empty() {
                return Err("missing required argument: <line>".to_string());
            }
            Ok(Invocation::Send {
                options,
                line: positional.join(" "),
            })
        }
        "scan" => match positional.first() {
            Some(arg) => Err(format!("unexpected argument: {arg}")),
            None => Ok(Invocation::Scan { options }),
        },
        "--help" | "-h" => Err(String::new()),
        other => Err(format!("unknown command: {other}")),
    }
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid value for {flag}: {value}"))
}

fn load_config(options: &Options) -> Result<StationConfig> {
    let mut config = match &options.config {
        Some(path) => StationConfig::from_json_file(path)?,
        None => StationConfig::from_env()?,
    };
    if let Some(port) = &options.port {
        config = config.with_port(port.clone());
    }
    if let Some(baud) = options.baud {
        config = config.with_baud(baud);
    }
    if let Some(secs) = options.timeout {
        let Ok(timeout) = Duration::try_from_secs_f64(secs) else {
            bail!("--timeout must be a non-negative number of seconds, got {secs}");
        };
        config = config.with_serial_timeout(timeout);
    }
    Ok(config)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

fn run_worker() -> i32 {
    let logs = logging::init_worker_tracing();

    let rt = match runtime() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: {e:#}");
            return 1;
        }
    };
    let result = rt.block_on(worker::run_stdio_worker(SyntheticDriver::from_env, Some(logs)));
    // stdin is read on a blocking thread that never returns on its own.
    rt.shutdown_background();

    match result {
        Ok(exit) => exit.code(),
        Err(e) => {
            eprintln!("worker error: {e}");
            1
        }
    }
}

fn run_send(options: Options, line: &str) -> Result<()> {
    logging::init_tracing();
    let config = load_config(&options)?;
    let retries = options.retries.unwrap_or(config.serial.retries);

    runtime()?.block_on(async {
        let mut link = SerialLink::new(config.serial.port.clone(), config.serial.baud);
        link.connect()?;
        let response = link
            .send_command(line, config.serial.timeout(), retries)
            .await;
        link.disconnect().await;
        println!("{}", response?);
        Ok::<(), anyhow::Error>(())
    })
}

fn run_scan(options: Options) -> Result<()> {
    logging::init_tracing();
    let config = load_config(&options)?;
    let retries = options.retries.unwrap_or(config.camera.scan_retries);

    let registry = ProcessRegistry::new();
    let _exit_guard = registry.exit_guard();

    runtime()?.block_on(async {
        let supervisor_config = SupervisorConfig::new()
            .with_command_timeout(config.camera.command_timeout())
            .with_enqueue_timeout(config.camera.enqueue_timeout());
        let mut supervisor = PeripheralSupervisor::new(supervisor_config, registry.clone());
        supervisor.start().await?;

        let outcome: Result<ScanHit> = async {
            let driver_kind = supervisor
                .init_driver(config.camera.driver_mode())
                .await
                .context("camera init failed")?;
            tracing::info!(%driver_kind, "Camera ready");
            supervisor
                .scan(Some(retries))
                .await
                .context("no symbol found")
        }
        .await;

        supervisor.shutdown().await;
        let hit = outcome?;
        println!("{}", serde_json::to_string(&hit)?);
        Ok::<(), anyhow::Error>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("progbot")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_send_with_options() {
        let parsed = parse_args(&args(&[
            "send", "--port", "/dev/ttyUSB0", "--retries", "3", "G28", "X",
        ]))
        .unwrap();
        match parsed {
            Invocation::Send { options, line } => {
                assert_eq!(options.port.as_deref(), Some("/dev/ttyUSB0"));
                assert_eq!(options.retries, Some(3));
                assert_eq!(line, "G28 X");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn send_requires_line() {
        let err = parse_args(&args(&["send"])).unwrap_err();
        assert!(err.contains("<line>"));
    }

    #[test]
    fn rejects_bad_number() {
        let err = parse_args(&args(&["scan", "--retries", "many"])).unwrap_err();
        assert_eq!(err, "invalid value for --retries: many");
    }

    #[test]
    fn oversized_timeout_is_an_error() {
        let options = Options {
            timeout: Some(1e300),
            ..Default::default()
        };
        let err = load_config(&options).unwrap_err();
        assert!(err.to_string().contains("--timeout"), "{err:#}");
    }

    #[test]
    fn parses_worker() {
        assert!(matches!(
            parse_args(&args(&["worker"])).unwrap(),
            Invocation::Worker
        ));
    }
}
