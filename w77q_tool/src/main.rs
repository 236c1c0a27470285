// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use log::{info, warn};
use packed_struct::prelude::PrimitiveEnum;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use w77q_regs::config::{AwdtThreshold, Awdtcfg};
use w77q_sec::sim::SimDevice;
use w77q_sec::{
    ConfigAction, EntropySource, Kid, Qlib, QlibConfig, QlibError, SectionConfig, SessionAccess, Target,
};

mod keys;

use keys::KeyFile;

type SimQlib<'k> = Qlib<'k, SimDevice>;

#[derive(Debug, Parser)]
enum Command {
    /// Print the detected part and its section map
    Info,
    /// Print the effective library configuration as TOML
    ShowConfig,
    /// Write a section key with a provisioning session derived from the
    /// master key, then prove it by opening a session
    Provision {
        #[arg(value_parser = parse_int::parse::<u8>)]
        section: u8,
        /// Provision the restricted key instead of the full access key
        #[clap(long)]
        restricted: bool,
    },
    /// Write hex data under a full access session and read it back signed
    WriteRead {
        #[arg(value_parser = parse_int::parse::<u8>)]
        section: u8,
        #[arg(value_parser = parse_int::parse::<u32>)]
        offset: u32,
        /// Data to write, as hex
        data: String,
    },
    /// Configure the watchdog, let simulated time pass and report its state
    Watchdog {
        /// Timeout, rounded down to a power of two number of seconds
        #[clap(long, default_value = "16", value_parser = parse_int::parse::<u64>)]
        threshold_secs: u64,
        #[clap(long, default_value = "0", value_parser = parse_int::parse::<u64>)]
        advance_ms: u64,
        /// Touch the watchdog after advancing
        #[clap(long)]
        touch: bool,
        /// Reset the part on expiry
        #[clap(long)]
        reset: bool,
    },
    /// Report what the application should act on, starting from the
    /// given counter values
    Notifications {
        #[clap(long, default_value = "0", value_parser = parse_int::parse::<u32>)]
        tc: u32,
        #[clap(long, default_value = "0", value_parser = parse_int::parse::<u32>)]
        dmc: u32,
    },
    /// Apply a section configuration (TOML) under a full access session
    ConfigSection {
        #[arg(value_parser = parse_int::parse::<u8>)]
        section: u8,
        file: PathBuf,
        /// Exchange the halves of a rollback section as well
        #[clap(long)]
        swap: bool,
        /// none, reload or reset
        #[clap(long, default_value = "reload")]
        action: ConfigAction,
    },
    /// Print a section's configuration as the device reports it
    ShowSection {
        #[arg(value_parser = parse_int::parse::<u8>)]
        section: u8,
    },
    /// List which keys the part holds
    KeyStatus,
    /// Software reset of the part
    Reset,
    /// Secure format of the whole part. Erases every section.
    Format {
        /// Also restore the factory GMC and GMT and drop the section keys
        #[clap(long)]
        factory_default: bool,
        /// Skip interactive confirmation
        #[clap(short, long)]
        yes: bool,
    },
}

#[derive(Debug, Parser)]
#[clap(name = "w77q-tool")]
struct Opts {
    /// Part to simulate
    #[clap(short, long, default_value = "w77q25nwxxi-rev-a")]
    target: Target,
    /// Key file (TOML); built in demo keys are used if omitted
    #[clap(short, long)]
    keys: Option<PathBuf>,
    /// Library configuration (TOML)
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Log every bus transaction
    #[clap(short, long)]
    verbose: bool,
    #[clap(subcommand)]
    cmd: Command,
}

fn init_logger(verbose: bool) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if verbose {
        builder.filter_level(log::LevelFilter::Trace);
    }
    builder
        .format(|buf, record| {
            let level = match record.level() {
                log::Level::Error => "ERROR".red(),
                log::Level::Warn => "WARN".yellow(),
                log::Level::Info => "INFO".cyan(),
                log::Level::Debug => "DEBUG".green(),
                log::Level::Trace => "TRACE".blue(),
            };
            writeln!(buf, "{level:<5} | {}", record.args())
        })
        .init();
}

/// Nonces for the host PRNG. A real integration feeds a hardware TRNG.
fn clock_entropy() -> Box<dyn EntropySource> {
    let mut state = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x2545_f491_4f6c_dd1d)
        | 1;
    Box::new(move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    })
}

fn load_config(path: Option<&PathBuf>) -> Result<QlibConfig> {
    let Some(path) = path else {
        return Ok(QlibConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("could not read {path:?}"))?;
    QlibConfig::from_toml(&text).with_context(|| format!("could not parse {path:?}"))
}

fn attach<'k>(sim: SimDevice, config: QlibConfig) -> Result<SimQlib<'k>> {
    let mut q = Qlib::new(sim, clock_entropy(), config);
    q.connect()?;
    q.cfg_init(None).context("part detection failed")?;
    q.sync_state().context("could not read device state")?;
    Ok(q)
}

fn threshold_from_secs(secs: u64) -> Result<AwdtThreshold> {
    if secs == 0 {
        bail!("watchdog threshold must be at least one second");
    }
    let log2 = (63 - secs.leading_zeros()) as u8;
    AwdtThreshold::from_primitive(log2).ok_or_else(|| anyhow!("watchdog threshold {secs}s is too long"))
}

fn confirm(expected: &str) -> Result<()> {
    println!("Please type '{expected}' to continue:");
    print!("> ");
    std::io::stdout().flush()?;
    let mut reply = String::new();
    std::io::stdin().read_line(&mut reply)?;
    let reply = reply.trim();
    if reply != expected {
        bail!("invalid reply: expected '{expected}', got '{reply}'");
    }
    Ok(())
}

fn print_info(q: &SimQlib<'_>) -> Result<()> {
    let caps = q.capabilities().ok_or_else(|| anyhow!("capabilities not resolved"))?;
    let ctx = q.context();
    let sections: Vec<_> = ctx
        .die()
        .sections
        .iter()
        .enumerate()
        .filter(|(_, s)| s.enabled)
        .map(|(i, s)| {
            json!({
                "index": i,
                "base": format!("{:#x}", s.base),
                "size": format!("{:#x}", s.size),
                "plain-read": s.plain_rd,
                "plain-write": s.plain_wr,
            })
        })
        .collect();
    let out = json!({
        "target": caps.target.to_string(),
        "features": format!("{:?}", caps.features),
        "hw-ver": format!("{:#010x}", caps.hw_ver.bits()),
        "wid": format!("{:#018x}", q.get_wid()),
        "reset": {
            "power-on": ctx.reset_status.power_on,
            "watchdog": ctx.reset_status.watchdog,
            "fallback-remap": ctx.reset_status.fallback_remap,
        },
        "sections": sections,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn provision<'k>(q: &mut SimQlib<'k>, keys: &'k KeyFile, section: u8, full: bool) -> Result<()> {
    let master = keys
        .master
        .as_ref()
        .ok_or_else(|| anyhow!("provisioning needs a master key in the key file"))?;
    let key = keys
        .key(section, full)
        .ok_or_else(|| anyhow!("no key for section {section} in the key file"))?;
    let kid = if full {
        Kid::full(section)
    } else {
        Kid::restricted(section)
    };
    q.provision_key(&master.0, kid, key)
        .with_context(|| format!("provisioning {kid:?} failed"))?;
    info!("provisioned {:?}", kid);

    q.register_key(section, key, full)?;
    let access = if full {
        SessionAccess::Full
    } else {
        SessionAccess::Restricted
    };
    q.open_session(section, access)
        .context("session with the new key failed")?;
    q.close_session(section)?;
    println!("{} {kid:?} on section {section}", "provisioned".green());
    Ok(())
}

fn write_read<'k>(q: &mut SimQlib<'k>, keys: &'k KeyFile, section: u8, offset: u32, data: &str) -> Result<()> {
    let data = hex::decode(data).context("data is not hex")?;
    let key = keys
        .key(section, true)
        .ok_or_else(|| anyhow!("no full access key for section {section}"))?;
    q.register_key(section, key, true)?;
    q.open_session(section, SessionAccess::Full)?;
    let r = (|| -> Result<Vec<u8>> {
        q.write(section, offset, &data)?;
        let mut back = vec![0u8; data.len()];
        q.read(section, offset, &mut back, true)?;
        Ok(back)
    })();
    if let Err(e) = q.close_session(section) {
        warn!("closing the session failed: {e}");
    }
    let back = r?;
    if back != data {
        bail!("read back {} differs", hex::encode(&back));
    }
    println!("{}", hex::encode(back));
    Ok(())
}

fn config_section<'k>(
    q: &mut SimQlib<'k>,
    keys: &'k KeyFile,
    section: u8,
    file: &PathBuf,
    swap: bool,
    action: ConfigAction,
) -> Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let cfg: SectionConfig = toml::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;
    let key = keys
        .key(section, true)
        .ok_or_else(|| anyhow!("no full access key for section {section}"))?;
    q.register_key(section, key, true)?;
    q.open_session(section, SessionAccess::Full)?;
    let r = q.config_section(section, &cfg, swap, action);
    if q.context().key_mngr().is_session_open() {
        if let Err(e) = q.close_session(section) {
            warn!("closing the session failed: {e}");
        }
    }
    r.with_context(|| format!("configuring section {section} failed"))?;
    let info = q.get_section_configuration(section)?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn key_status(q: &mut SimQlib<'_>) -> Result<()> {
    let mut sections = vec![];
    for s in 0..w77q_regs::NUM_SECTIONS as u8 {
        sections.push(json!({
            "section": s,
            "restricted": q.is_key_provisioned(Kid::restricted(s))?,
            "full": q.is_key_provisioned(Kid::full(s))?,
        }));
    }
    let out = json!({
        "master": q.is_key_provisioned(Kid::DEVICE_MASTER)?,
        "secret": q.is_key_provisioned(Kid::DEVICE_SECRET)?,
        "sections": sections,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn watchdog(q: &mut SimQlib<'_>, threshold_secs: u64, advance_ms: u64, touch: bool, reset: bool) -> Result<()> {
    let mut cfg = Awdtcfg::new(threshold_from_secs(threshold_secs)?);
    cfg.enable = true;
    cfg.sw_reset_en = reset;
    q.watchdog_configure(&cfg)?;
    q.bus_mut().advance(Duration::from_millis(advance_ms));
    if touch {
        q.watchdog_touch()?;
    }
    if q.bus().awdt() != &cfg {
        println!("{}", "watchdog reset the part".yellow());
        q.sync_state()?;
    }
    let status = q.watchdog_get()?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logger(opts.verbose);

    let config = load_config(opts.config.as_ref())?;
    let keys = match &opts.keys {
        Some(p) => KeyFile::load(p)?,
        None => {
            warn!("no key file given, using the built in demo keys");
            KeyFile::demo()
        }
    };

    let mut sim = SimDevice::new(opts.target);
    let master_only = matches!(opts.cmd, Command::Provision { .. });
    keys.install(&mut sim, master_only);
    if let Command::Notifications { tc, dmc } = opts.cmd {
        sim.set_mc(tc, dmc);
    }

    if let Command::ShowConfig = opts.cmd {
        print!("{}", toml::to_string(&config)?);
        return Ok(());
    }

    let mut q = attach(sim, config)?;
    match opts.cmd {
        Command::Info | Command::ShowConfig => print_info(&q)?,
        Command::Provision {
            section,
            restricted,
        } => provision(&mut q, &keys, section, !restricted)?,
        Command::WriteRead {
            section,
            offset,
            data,
        } => write_read(&mut q, &keys, section, offset, &data)?,
        Command::Watchdog {
            threshold_secs,
            advance_ms,
            touch,
            reset,
        } => watchdog(&mut q, threshold_secs, advance_ms, touch, reset)?,
        Command::Notifications { .. } => {
            let n = q.get_notifications()?;
            println!("{}", serde_json::to_string_pretty(&n)?);
        }
        Command::ConfigSection {
            section,
            file,
            swap,
            action,
        } => config_section(&mut q, &keys, section, &file, swap, action)?,
        Command::ShowSection { section } => {
            let info = q.get_section_configuration(section)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::KeyStatus => match key_status(&mut q) {
            Err(e) if matches!(e.downcast_ref::<QlibError>(), Some(QlibError::NotSupported(_))) => {
                bail!("{} cannot report its keys", opts.target)
            }
            r => r?,
        },
        Command::Reset => {
            q.reset_flash()?;
            println!("{} dmc {:#x}", "reset".green(), q.context().die().mc[1]);
        }
        Command::Format {
            factory_default,
            yes,
        } => {
            let master = keys
                .master
                .as_ref()
                .ok_or_else(|| anyhow!("format needs the master key"))?;
            println!("{}: this erases every section", "WARNING".red());
            if !yes {
                confirm("Format the part")?;
            }
            q.format_device(&master.0, false, factory_default)?;
            q.sync_state()?;
            print_info(&q)?;
        }
    }
    Ok(())
}
