use fuzz_proxy::config::ProxyConfig;
use fuzz_proxy::logger::{self, BreadcrumbFlags, LogSink};
use fuzz_proxy::mutation::{FuzzStyle, MutatorConfig};
use fuzz_proxy::tcp::TcpOptions;
use fuzz_proxy::udp::RelayOptions;
use fuzz_proxy::{Proxy, ProxyOptions};
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

const USAGE: &str = "usage: fuzz-proxy <config.yaml> [--mutator PATH] [--style STYLE] \
[--mutator-timeout-ms N] [--log-level LEVEL] [--no-transparent] [--connect-delay-ms N]";

fn main() -> anyhow::Result<ExitCode> {
    let settings = Settings::parse(env::args().skip(1))?;
    let config = ProxyConfig::load(&settings.config_path)?;

    let level = settings
        .log_level
        .clone()
        .or_else(|| config.general.log_level.clone());
    let sink = match config.general.log_dir.as_deref() {
        Some(dir) if !dir.is_empty() => {
            std::fs::create_dir_all(dir)?;
            LogSink::File(Path::new(dir).join("fuzz-proxy.log"))
        }
        _ => LogSink::Stderr,
    };
    let breadcrumbs = if level.as_deref() == Some("debug") {
        BreadcrumbFlags::ALL
    } else {
        BreadcrumbFlags::BOOT
    };
    logger::install_sink(Some(sink), level.as_deref(), breadcrumbs)?;

    config.validate()?;
    if let Some(fuzzer) = config.fuzzer() {
        logger::info(format!("running as fuzzer entity '{}' ({})", fuzzer.name, fuzzer.ip));
    }

    let proxy = Proxy::new(&config, settings.options());
    proxy.start()?;
    logger::info(format!(
        "fuzz-proxy up: {} udp connections, {} tcp listeners",
        proxy.udp_connection_count(),
        proxy.tcp_listener_count()
    ));

    // The launcher terminates the proxy; only a fatal relay error ends it here.
    match proxy.wait_fatal() {
        Some(error) => {
            logger::error(format!("terminating: {error}"));
            eprintln!("[fuzz-proxy] fatal: {error}");
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

#[derive(Debug)]
struct Settings {
    config_path: PathBuf,
    mutator: MutatorConfig,
    log_level: Option<String>,
    transparent: bool,
    connect_delay: Option<Duration>,
}

impl Settings {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut config_path = None;
        let mut mutator = MutatorConfig::default();
        let mut log_level = None;
        let mut transparent = true;
        let mut connect_delay = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--mutator" => {
                    mutator.path = PathBuf::from(value_for(&mut args, "--mutator")?);
                }
                "--style" => {
                    mutator.style = value_for(&mut args, "--style")?.parse::<FuzzStyle>()?;
                }
                "--mutator-timeout-ms" => {
                    let value = value_for(&mut args, "--mutator-timeout-ms")?;
                    let millis: u64 = value
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid mutator timeout '{value}'"))?;
                    mutator.timeout = Duration::from_millis(millis);
                }
                "--log-level" => {
                    log_level = Some(value_for(&mut args, "--log-level")?);
                }
                "--no-transparent" => transparent = false,
                "--connect-delay-ms" => {
                    let value = value_for(&mut args, "--connect-delay-ms")?;
                    let millis: u64 = value
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid connect delay '{value}'"))?;
                    connect_delay = Some(Duration::from_millis(millis));
                }
                "-h" | "--help" => {
                    println!("{USAGE}");
                    std::process::exit(0);
                }
                other if other.starts_with("--") => {
                    anyhow::bail!("unknown option {other}\n{USAGE}");
                }
                other => {
                    if config_path.replace(PathBuf::from(other)).is_some() {
                        anyhow::bail!("more than one config file given\n{USAGE}");
                    }
                }
            }
        }

        let config_path = config_path.ok_or_else(|| anyhow::anyhow!("{USAGE}"))?;
        Ok(Self {
            config_path,
            mutator,
            log_level,
            transparent,
            connect_delay,
        })
    }

    fn options(&self) -> ProxyOptions {
        let mut tcp = TcpOptions::default();
        if let Some(delay) = self.connect_delay {
            tcp.connect_delay = delay;
        }
        ProxyOptions {
            mutator: self.mutator.clone(),
            relay: RelayOptions {
                transparent: self.transparent,
                ..RelayOptions::default()
            },
            tcp,
        }
    }
}

fn value_for(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<String> {
    args.next()
        .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
}
