// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use log::{info, warn};
use qmc_areas::{
    state::STATE_GPR, BootState, Extent, FirmwareHeader, FwState, MemoryMap, Region,
    UpdateManifest, HEADER_BLOCK_SIZE,
};
use qmc_boot::{
    auth,
    event::{self, encode_visual, AesCtrCipher, LogCipher, LoggedEvent},
    flash::Nor,
    keys, se,
    sign::{self, ImageSpec},
    sim::{DirMedia, Peer, SimBoard, SimPanel},
    BootConfig, BootReport, Bootloader, LogEvent, Outcome,
};
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strum::IntoEnumIterator;

#[derive(Debug, Parser)]
struct KeyArgs {
    /// PKCS#8 private key (PEM)
    #[clap(short = 'k', long = "key")]
    private_key: PathBuf,
}

#[derive(Debug, Parser)]
enum Command {
    /// Build and sign a firmware image
    MakeImage {
        #[clap(long)]
        version: u32,

        /// Slot the image is linked for
        #[clap(long, value_enum, default_value = "main-fw")]
        slot: Region,

        /// Link address; overrides `--slot`
        #[arg(long, value_parser = parse_int::parse::<u32>)]
        base: Option<u32>,

        /// Primary-core code, placed after the vector table
        #[clap(long)]
        code: Option<PathBuf>,

        /// Secondary-core image
        #[clap(long)]
        secondary: Option<PathBuf>,

        #[arg(long, value_parser = parse_int::parse::<u32>)]
        stack_pointer: Option<u32>,

        /// Start of the configuration data used by the image
        #[arg(long, value_parser = parse_int::parse::<u32>)]
        cfg_addr: Option<u32>,

        #[arg(long, value_parser = parse_int::parse::<u32>, default_value_t = 0)]
        cfg_len: u32,

        #[clap(flatten)]
        key: KeyArgs,

        /// output file (binary)
        #[clap(short = 'o', long = "out")]
        dest_img: PathBuf,
    },
    /// Wrap a signed image into an update package
    MakePackage {
        #[clap(short = 'i', long = "in")]
        src_img: PathBuf,

        /// Version checked against the trusted manifest version
        #[clap(long)]
        version: u32,

        /// Base of the staging region the package is linked for
        #[arg(long, value_parser = parse_int::parse::<u32>)]
        staging: Option<u32>,

        #[clap(flatten)]
        key: KeyArgs,

        #[clap(short = 'o', long = "out")]
        dest_pkg: PathBuf,
    },
    /// Write the public half of a private key
    PublicKey {
        #[clap(flatten)]
        key: KeyArgs,

        #[clap(short = 'o', long = "out")]
        dest_pem: PathBuf,
    },
    /// Dump the header or manifest of an image or package
    Inspect {
        src: PathBuf,

        /// Public key (PEM) to check the signature against
        #[clap(long)]
        public_key: Option<PathBuf>,

        #[clap(long)]
        json: bool,
    },
    /// Boot a simulated device described by a TOML file
    Boot {
        config: PathBuf,

        /// Number of consecutive power-ups
        #[clap(long, default_value_t = 1)]
        boots: u32,

        /// Decrypt and print the persistent event log afterwards
        #[clap(long)]
        dump_log: bool,

        #[clap(long)]
        json: bool,

        #[clap(short, long)]
        verbose: bool,
    },
    /// List every event with its code and halt pattern
    Events {
        #[clap(long)]
        json: bool,
    },
}

#[derive(Debug, Parser)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

/// A simulation file: boot tunables plus the device they run on
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct SimConfig {
    #[serde(default)]
    boot: BootConfig,
    device: DeviceConfig,
}

/// Paths are relative to the simulation file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct DeviceConfig {
    fw_public_key: PathBuf,
    fwu_public_key: PathBuf,
    main_image: Option<PathBuf>,
    recovery_image: Option<PathBuf>,
    cfg_data: Option<PathBuf>,

    /// Trusted firmware version held by the secure element
    #[serde(default)]
    fw_version: u32,
    #[serde(default)]
    manifest_version: u32,

    /// Request bits left by the previous firmware run
    #[serde(default)]
    fw_state: u8,

    /// Directory standing in for the removable card
    media_dir: Option<PathBuf>,
    #[serde(default)]
    buttons_held: bool,

    #[serde(default = "default_ready_ms")]
    secondary_ready_ms: u32,
    #[serde(default)]
    secondary_silent: bool,

    #[serde(default)]
    seed: u64,
}

fn default_ready_ms() -> u32 {
    15
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("could not read {}", path.display()))
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("could not read {}", path.display()))
}

fn public_key(path: &Path) -> Result<RsaPublicKey> {
    sign::load_public_key(&read_text(path)?)
        .with_context(|| format!("could not load public key from {}", path.display()))
}

impl DeviceConfig {
    fn build(&self, cfg: &BootConfig, dir: &Path) -> Result<SimBoard> {
        let map = &cfg.memory;
        let mut sim = SimBoard::new(map, self.seed);
        sim.commission(
            public_key(&dir.join(&self.fw_public_key))?,
            public_key(&dir.join(&self.fwu_public_key))?,
        );
        sim.se.set_version(se::FW_VERSION, self.fw_version);
        sim.se.set_version(se::MAN_VERSION, self.manifest_version);

        for (file, region) in [
            (&self.main_image, map.main_fw),
            (&self.recovery_image, map.recovery),
            (&self.cfg_data, map.cfg_data),
        ] {
            let Some(file) = file else { continue };
            let bytes = read_bytes(&dir.join(file))?;
            if bytes.len() as u64 > u64::from(region.len) {
                bail!("{} does not fit {region}", file.display());
            }
            sim.flash.load(region.start, &bytes)?;
        }

        let state = BootState::default().with_fw_state(FwState::from_bits(self.fw_state)?);
        sim.gpr.regs[STATE_GPR] = state.to_word()?;

        if let Some(media) = &self.media_dir {
            sim.media = Box::new(DirMedia::new(dir.join(media)));
        }
        if self.buttons_held {
            sim.panel = SimPanel::held();
        }
        sim.soc.peer = if self.secondary_silent {
            Peer::Never
        } else {
            Peer::ReadyAfter(self.secondary_ready_ms)
        };
        Ok(sim)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct BootRun {
    boots: Vec<BootReport>,
    fw_state: u8,
    fw_version: Option<u32>,
    manifest_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_log: Option<Vec<LoggedEvent>>,
}

fn print_report(n: u32, report: &BootReport) {
    let outcome = match report.outcome {
        Outcome::Handoff {
            entry,
            backup_active,
        } => format!(
            "handoff to {:#010x} (sp {:#010x}){}",
            entry.reset_vector & !1,
            entry.stack_pointer,
            if backup_active { " from recovery" } else { "" }
        )
        .green(),
        Outcome::Reset { event } => format!("reset requested after {event}").yellow(),
        Outcome::Halted { event, pattern } => format!("halted on {event}, LEDs {pattern}").red(),
    };
    println!("boot {n}: {outcome}");
    for e in &report.events {
        println!("    {:#04x} {e}", e.code());
    }
}

/// Unwraps the log keys of a simulated device and decrypts its event log
fn read_event_log(sim: &mut SimBoard, cfg: &BootConfig) -> Result<Vec<LoggedEvent>> {
    let mut flash = Nor::new(&mut sim.flash, cfg.flash_attempts);
    if keys::key_store_blank(&mut flash, cfg.memory.key_store)? {
        warn!("key store is blank; the event log cannot be decrypted");
        return Ok(vec![]);
    }
    let keys = keys::reconstruct_keys(&mut flash, &mut sim.puf, cfg.memory.key_store)?;
    let mut cipher = AesCtrCipher::default();
    cipher.load_keys(&keys.log.key, &keys.log.nonce)?;
    Ok(event::read_log(&mut flash, cfg.memory.event_log, &mut cipher)?)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct Inspection {
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest: Option<UpdateManifest>,
    header: FirmwareHeader,
    signature_len: usize,
    /// First bytes of the framed signature, hex
    signature_head: String,
    signature_valid: Option<bool>,
}

/// Returns the signed bytes and the framed signature of an image or package
fn signed_parts(bytes: &[u8], data_len: u32, sig_offset: u32) -> Result<(&[u8], &[u8])> {
    let data = bytes
        .get(..data_len as usize)
        .ok_or_else(|| anyhow!("file is shorter than its signed extent ({data_len:#x})"))?;
    let at = bytes
        .get(sig_offset as usize..)
        .ok_or_else(|| anyhow!("signature offset {sig_offset:#x} is past the end of the file"))?;
    let len = auth::signature_len(at)?;
    let sig = at
        .get(..len)
        .ok_or_else(|| anyhow!("signature is truncated"))?;
    Ok((data, sig))
}

fn inspect(bytes: &[u8], key: Option<&RsaPublicKey>) -> Result<Inspection> {
    let (kind, manifest, header, (data, sig)) = if UpdateManifest::is_tagged(bytes) {
        let m = UpdateManifest::parse(bytes).context("could not parse manifest")?;
        let offset = m
            .sign_data_addr
            .checked_sub(m.fwu_data_addr)
            .ok_or_else(|| anyhow!("manifest signature precedes the package"))?;
        let inner = bytes
            .get(HEADER_BLOCK_SIZE..)
            .ok_or_else(|| anyhow!("package holds no image"))?;
        let header = FirmwareHeader::parse(inner).context("could not parse packaged image")?;
        let parts = signed_parts(bytes, m.fwu_data_length, offset)?;
        ("package", Some(m), header, parts)
    } else {
        let header = FirmwareHeader::parse(bytes).context("could not parse image header")?;
        let offset = header
            .sign_data_addr
            .checked_sub(header.fw_data_addr)
            .ok_or_else(|| anyhow!("image signature precedes the image"))?;
        let parts = signed_parts(bytes, header.fw_data_length, offset)?;
        ("image", None, header, parts)
    };
    Ok(Inspection {
        kind,
        manifest,
        header,
        signature_len: sig.len(),
        signature_head: hex::encode(&sig[..sig.len().min(16)]),
        signature_valid: key.map(|k| sign::verify_extent(k, data, sig)),
    })
}

fn print_header(hdr: &FirmwareHeader) {
    println!("  version            {}", hdr.version);
    println!("  extent             {}", hdr.extent());
    println!("  vector table       {:#010x}", hdr.cm7_vector_table_addr);
    println!("  signature at       {:#010x}", hdr.sign_data_addr);
    println!("  secondary image    {}", hdr.cm4_extent());
    println!("  secondary boot     {:#010x}", hdr.cm4_boot_addr);
    println!("  configuration      {}", hdr.cfg_extent());
}

fn main() -> Result<()> {
    let cmd = Opts::parse();

    // Boot installs the trace logger; everyone else can use the default
    if !matches!(cmd.cmd, Command::Boot { .. }) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cmd.cmd {
        Command::MakeImage {
            version,
            slot,
            base,
            code,
            secondary,
            stack_pointer,
            cfg_addr,
            cfg_len,
            key,
            dest_img,
        } => {
            let map = MemoryMap::default();
            let private_key = sign::load_private_key(&read_text(&key.private_key)?)?;
            let mut spec = ImageSpec::new(version, base.unwrap_or(map.region(slot).start));
            if let Some(code) = code {
                spec.code = read_bytes(&code)?;
            }
            if let Some(secondary) = secondary {
                spec.secondary = read_bytes(&secondary)?;
            }
            if let Some(sp) = stack_pointer {
                spec.stack_pointer = sp;
            }
            spec.cfg = Extent::new(cfg_addr.unwrap_or(map.cfg_data.start), cfg_len);
            let image = sign::sign_image(&spec, &private_key)?;
            if image.len() as u64 > u64::from(map.region(slot).len) {
                println!("{}: image is larger than the {slot} slot", "WARNING".red());
            }
            std::fs::write(&dest_img, image)?;
            info!("Signed image written to {}", dest_img.display());
        }
        Command::MakePackage {
            src_img,
            version,
            staging,
            key,
            dest_pkg,
        } => {
            let map = MemoryMap::default();
            let private_key = sign::load_private_key(&read_text(&key.private_key)?)?;
            let image = read_bytes(&src_img)?;
            FirmwareHeader::parse(&image)
                .with_context(|| format!("{} is not a firmware image", src_img.display()))?;
            let staging = Extent::new(staging.unwrap_or(map.staging.start), map.staging.len);
            let pkg = sign::build_package(&image, version, staging, &private_key)?;
            if pkg.len() as u64 > u64::from(staging.len) {
                bail!("package ({:#x} bytes) does not fit {staging}", pkg.len());
            }
            std::fs::write(&dest_pkg, pkg)?;
            info!("Update package written to {}", dest_pkg.display());
        }
        Command::PublicKey { key, dest_pem } => {
            let private_key = sign::load_private_key(&read_text(&key.private_key)?)?;
            let pem = RsaPublicKey::from(&private_key)
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| anyhow!("could not encode public key: {e}"))?;
            std::fs::write(&dest_pem, pem)?;
            info!("Public key written to {}", dest_pem.display());
        }
        Command::Inspect {
            src,
            public_key: key_path,
            json,
        } => {
            let bytes = read_bytes(&src)?;
            let key = key_path.as_deref().map(public_key).transpose()?;
            let report = inspect(&bytes, key.as_ref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            println!("{} {}", report.kind, src.display());
            if let Some(m) = &report.manifest {
                println!("  package version    {}", m.version);
                println!("  package extent     {}", m.extent());
                println!("  image extent       {}", m.image_extent());
                println!("  signature at       {:#010x}", m.sign_data_addr);
                println!("image");
            }
            print_header(&report.header);
            let verdict = match report.signature_valid {
                Some(true) => "valid".green(),
                Some(false) => "INVALID".red(),
                None => "not checked".normal(),
            };
            println!(
                "  signature          {} bytes, {verdict}\n                     {}..",
                report.signature_len, report.signature_head
            );
        }
        Command::Boot {
            config,
            boots,
            dump_log,
            json,
            verbose,
        } => {
            qmc_boot::init_boot_logger(verbose);
            let sim_cfg: SimConfig = toml::from_str(&read_text(&config)?)
                .with_context(|| format!("could not parse {}", config.display()))?;
            let cfg = sim_cfg.boot;
            cfg.validate()?;
            let dir = config.parent().unwrap_or_else(|| Path::new("."));
            let mut sim = sim_cfg.device.build(&cfg, dir)?;

            let mut reports = vec![];
            for n in 1..=boots {
                let report = Bootloader::new(&cfg, sim.board()).run();
                if !json {
                    print_report(n, &report);
                }
                let halted = matches!(report.outcome, Outcome::Halted { .. });
                reports.push(report);
                sim.power_cycle();
                if halted {
                    break;
                }
            }

            let event_log = if dump_log {
                Some(read_event_log(&mut sim, &cfg)?)
            } else {
                None
            };
            let run = BootRun {
                boots: reports,
                fw_state: (sim.gpr.regs[STATE_GPR] >> 24) as u8,
                fw_version: sim.se.version(se::FW_VERSION),
                manifest_version: sim.se.version(se::MAN_VERSION),
                event_log,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
                return Ok(());
            }
            println!(
                "request bits {:#04x}, trusted versions fw {} manifest {}",
                run.fw_state,
                run.fw_version.map_or("-".to_string(), |v| v.to_string()),
                run.manifest_version.map_or("-".to_string(), |v| v.to_string()),
            );
            if let Some(log) = &run.event_log {
                println!("event log ({} records)", log.len());
                for rec in log {
                    let name = rec
                        .event
                        .map_or_else(|| "unknown".red().to_string(), |e| e.to_string());
                    println!("    {:#010x} #{:<4} {:#04x} {name}", rec.addr, rec.seq, rec.code);
                }
            }
        }
        Command::Events { json } => {
            #[derive(Serialize)]
            struct Row {
                code: u16,
                name: String,
                category: String,
                pattern: Option<String>,
            }
            let rows: Vec<Row> = LogEvent::iter()
                .map(|e| {
                    let pattern = encode_visual(e);
                    Row {
                        code: e.code(),
                        name: e.to_string(),
                        category: format!("{:?}", e.category()),
                        pattern: (pattern != qmc_boot::LedPattern::OFF)
                            .then(|| pattern.to_string()),
                    }
                })
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for r in rows {
                    println!(
                        "{:#04x}  {:<24} {:<15} {}",
                        r.code,
                        r.name,
                        r.category,
                        r.pattern.as_deref().unwrap_or("")
                    );
                }
            }
        }
    }

    Ok(())
}
