use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, Command};
use mbcore::{AtPort, CancelToken, KernelDevice, PortType, ProbeTask, Schedule, UdevRuleSet};

/// Reads kernel-device properties from the process environment instead of a
/// real udev binding, so this demo binary can exercise
/// [`UdevRuleSet::evaluate`] without depending on udev itself (out of scope
/// per the core's non-goals).
struct EnvKernelDevice;

impl KernelDevice for EnvKernelDevice {
    fn property(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

fn cli() -> Command {
    Command::new("mbcore-cli")
        .author(clap::crate_authors!())
        .about("Probes a candidate modem control port and reports its classification")
        .arg_required_else_help(true)
        .arg(
            Arg::new("device")
                .value_name("device")
                .short('d')
                .long("device")
                .required(true)
                .help("Character device to probe, e.g. /dev/ttyUSB2"),
        )
        .arg(
            Arg::new("rules-dir")
                .value_name("dir")
                .long("rules-dir")
                .required(false)
                .help("Directory of udev rule files (77-mm-*..80-mm-*) to evaluate before probing"),
        )
        .arg(
            Arg::new("timeout-ms")
                .value_name("ms")
                .long("timeout-ms")
                .required(false)
                .default_value("3000")
                .value_parser(value_parser!(u64))
                .help("Per-command timeout for each entry of the AT probe schedule"),
        )
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let matches = cli().get_matches();
    let device = matches.get_one::<String>("device").expect("required").clone();
    let timeout_ms = *matches.get_one::<u64>("timeout-ms").expect("has default");
    let rules_dir = matches.get_one::<String>("rules-dir").cloned();

    // SerialPort is Rc-based and not Send (see its doc comment): it belongs
    // to one event loop on one task, so the whole demo runs on a
    // current-thread runtime inside a LocalSet.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(device, rules_dir, timeout_ms))
}

async fn run(device: String, rules_dir: Option<String>, timeout_ms: u64) -> Result<()> {
    if let Some(dir) = &rules_dir {
        let rule_set = UdevRuleSet::load_dir(Path::new(dir))
            .map_err(|e| anyhow::anyhow!("loading udev rules from {dir}: {e}"))?;
        let tags = rule_set.evaluate(&EnvKernelDevice);
        for (name, value) in &tags {
            tracing::info!(%name, %value, "udev tag");
        }
    }

    let at_port = AtPort::new(&device);
    at_port
        .serial_port()
        .open()
        .with_context(|| format!("opening {device}"))?;

    let mut schedule = Schedule::builtin_at_probe();
    for entry in &mut schedule.entries {
        entry.timeout = Duration::from_millis(timeout_ms);
    }

    let mut task = ProbeTask::new(at_port.clone(), schedule);
    match task.run(CancelToken::new()).await {
        Ok(PortType::At) => println!("{device}: classified AT"),
        Ok(other) => println!("{device}: classified {other:?}"),
        Err(e) => eprintln!("{device}: probe failed: {e}"),
    }

    at_port.serial_port().close();
    Ok(())
}
