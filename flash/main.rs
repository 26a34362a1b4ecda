// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher  -  ESP32 firmware flasher
//
//  Finds the board, fetches or picks up firmware, and drives esptool through
//  chip detection, erase, write and verification.
//
//  USAGE
//  ─────
//    esp32-flasher detect [--all]
//    esp32-flasher firmware list
//    esp32-flasher flash  --folder build/release          [--port /dev/ttyUSB0]
//    esp32-flasher flash  --version 2.1.0                 [--baud 115200] [--no-verify]
//    esp32-flasher download 2.1.0
//    esp32-flasher verify   2.1.0
//    esp32-flasher inspect  build/release/firmware.bin
//    esp32-flasher erase    [--port COM3]
//    esp32-flasher chip-id  [--port COM3]
//    esp32-flasher cache list | clear
//    esp32-flasher config show | path
// ─────────────────────────────────────────────────────────────────────────────

mod render;

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use env_logger::Env;
use log::{debug, warn};

use esp32_flasher::detect;
use esp32_flasher::firmware::{self, FirmwareSet};
use esp32_flasher::{
    CancelToken, FirestoreStore, FirmwareCache, FirmwareDescriptor, FlashError, Flasher, MetadataClient,
    Outcome, Phase, ProgressHub, Reporter, Resolver, Settings, SettingsStore,
};

// ─────────────────────────────────────────────────────────────────────────────
//  CLI definition (clap derive)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "esp32-flasher",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Flash ESP32 firmware through esptool, from a folder or the cloud catalogue",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Suppress progress output
    #[arg(long, global = true)]
    quiet: bool,

    /// Log every esptool invocation and state change
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Settings file  (default: <config dir>/esp32-flasher/settings.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Detect connected ESP32 devices
    Detect {
        /// List every serial port, not only ESP candidates
        #[arg(long)]
        all: bool,
    },
    /// Query the cloud firmware catalogue
    Firmware(FirmwareArgs),
    /// Write firmware to a connected device
    Flash(FlashArgs),
    /// Download a firmware version into the local cache
    Download {
        version: String,
    },
    /// Check a downloaded version against its declared size and SHA-256
    Verify {
        version: String,
    },
    /// Validate a firmware file and show what can be learned from it
    Inspect {
        file: PathBuf,
    },
    /// Erase the whole flash chip
    Erase(PortArgs),
    /// Identify the connected chip
    ChipId(PortArgs),
    /// Manage the download cache
    Cache(CacheArgs),
    /// Show settings
    Config(ConfigArgs),
}

#[derive(Args)]
struct FirmwareArgs {
    #[command(subcommand)]
    command: FirmwareCmd,
}

#[derive(Subcommand)]
enum FirmwareCmd {
    /// List published versions, newest first
    List,
}

#[derive(Args)]
struct FlashArgs {
    /// Serial port  (auto-detect if omitted)
    #[arg(long, short = 'p')]
    port: Option<String>,

    /// Local folder with firmware.bin [+ bootloader.bin, partitions.bin]
    #[arg(long, short = 'f', conflicts_with = "version")]
    folder: Option<PathBuf>,

    /// Cloud firmware version  (downloaded first if not cached)
    #[arg(long)]
    version: Option<String>,

    /// Override baud rate
    #[arg(long, short = 'b')]
    baud: Option<u32>,

    /// Skip verify_flash after writing
    #[arg(long)]
    no_verify: bool,

    /// Refuse application-only firmware sets
    #[arg(long)]
    require_complete: bool,
}

#[derive(Args)]
struct PortArgs {
    /// Serial port  (auto-detect if omitted)
    #[arg(long, short = 'p')]
    port: Option<String>,

    /// Override baud rate
    #[arg(long, short = 'b')]
    baud: Option<u32>,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCmd,
}

#[derive(Subcommand)]
enum CacheCmd {
    /// Cached versions with per-file presence
    List,
    /// Delete every cached download
    Clear,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCmd,
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the effective settings
    Show,
    /// Print the settings file location
    Path,
}

// ─────────────────────────────────────────────────────────────────────────────
//  Entry point
// ─────────────────────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    let result = Ctx::load(&cli).and_then(|mut ctx| match cli.command {
        Cmd::Detect { all }    => cmd_detect(all),
        Cmd::Firmware(args)    => match args.command {
            FirmwareCmd::List => cmd_firmware_list(&ctx),
        },
        Cmd::Flash(args)       => cmd_flash(&mut ctx, args),
        Cmd::Download { version } => cmd_download(&ctx, &version),
        Cmd::Verify { version }   => cmd_verify(&ctx, &version),
        Cmd::Inspect { file }  => cmd_inspect(&file),
        Cmd::Erase(args)       => cmd_erase(&ctx, args),
        Cmd::ChipId(args)      => cmd_chip_id(&ctx, args),
        Cmd::Cache(args)       => cmd_cache(&ctx, args),
        Cmd::Config(args)      => cmd_config(&ctx, args),
    });

    if let Err(e) = result {
        match e.downcast_ref::<FlashError>() {
            Some(fe) => render::flash_error(fe),
            None => eprintln!("{} {:#}", "✗".red().bold(), e),
        }
        std::process::exit(1);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Shared context
// ─────────────────────────────────────────────────────────────────────────────

struct Ctx {
    settings: Settings,
    store:    SettingsStore,
    quiet:    bool,
    cancel:   CancelToken,
    /// False when the settings file was unreadable; it is then left untouched.
    persist:  bool,
}

impl Ctx {
    fn load(cli: &Cli) -> anyhow::Result<Self> {
        let store = SettingsStore::new(cli.config.clone().unwrap_or_else(SettingsStore::default_path));
        let (settings, persist) = match store.load() {
            Ok(s) => (s, true),
            Err(e) => {
                warn!("{e}; using defaults");
                (Settings::default(), false)
            }
        };
        debug!("settings: {}", store.path().display());

        let cancel = CancelToken::new();
        let handler_token = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
            warn!("could not install Ctrl-C handler: {e}");
        }

        Ok(Ctx { settings, store, quiet: cli.quiet, cancel, persist })
    }

    fn cache(&self) -> FirmwareCache {
        FirmwareCache::new(self.settings.cache_dir.clone().unwrap_or_else(FirmwareCache::default_root))
    }

    fn resolver(&self) -> Resolver {
        Resolver::new(self.cache())
    }

    fn flasher(&self, baud: Option<u32>, no_verify: bool) -> Flasher {
        let mut params = self.settings.flash.clone();
        if let Some(b) = baud {
            params.baud = b;
        }
        if no_verify {
            params.verify = false;
        }
        Flasher::new(params).with_esptool(self.settings.esptool.clone())
    }

    /// Settings with environment overrides applied. Never written back.
    fn effective(&self) -> Settings {
        let mut s = self.settings.clone();
        s.apply_env(|k| std::env::var(k).ok());
        s
    }

    fn metadata(&self) -> anyhow::Result<MetadataClient<FirestoreStore>> {
        let s = self.effective();
        let (project, key) = s.cloud.credentials()?;
        let mut store = FirestoreStore::new(project, key);
        if let Some(url) = &s.cloud.base_url {
            store = store.with_base_url(url.as_str());
        }
        Ok(MetadataClient::new(store, s.cloud.collections.clone()))
    }

    fn descriptor(&self, version: &str) -> anyhow::Result<FirmwareDescriptor> {
        Ok(self.metadata()?.find(version)?)
    }

    fn save(&self) {
        if !self.persist {
            return;
        }
        if let Err(e) = self.store.save(&self.settings) {
            warn!("could not save settings: {e}");
        }
    }

    /// Pick the port: explicit, else scan and fall back to the last one used.
    fn port(&self, explicit: Option<String>) -> anyhow::Result<String> {
        if let Some(p) = explicit {
            return Ok(p);
        }
        if !self.quiet {
            print!("{} auto-detecting device… ", "→".cyan());
        }
        let found = detect::scan();
        match detect::choose_port(&found, None, self.settings.last_port.as_deref()) {
            Ok(p) => {
                if !self.quiet {
                    println!("{}", p.bold());
                }
                Ok(p)
            }
            Err(e) => {
                if !self.quiet {
                    println!();
                }
                Err(e.into())
            }
        }
    }
}

/// Run `work` on a worker thread while this thread draws its progress.
fn with_progress<T, F>(hub: &ProgressHub, phase: Phase, quiet: bool, work: F) -> esp32_flasher::Result<Outcome<T>>
where
    T: Send,
    F: FnOnce(&mut Reporter<'_>) -> esp32_flasher::Result<Outcome<T>> + Send,
{
    let rx = hub.channel();
    thread::scope(|s| {
        let worker = s.spawn(|| {
            let mut reporter = hub.reporter(phase)?;
            work(&mut reporter)
        });

        while !worker.is_finished() {
            if let Ok(u) = rx.recv_timeout(Duration::from_millis(100)) {
                if !quiet {
                    render::progress(&u);
                }
            }
        }
        let mut drew = false;
        for u in rx.try_iter() {
            if !quiet {
                render::progress(&u);
            }
            drew = true;
        }
        if !quiet && (drew || hub.last().is_some_and(|u| u.phase == phase)) {
            render::progress_end();
        }

        worker.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
//  Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_detect(all: bool) -> anyhow::Result<()> {
    if all {
        render::ports(&detect::list_all_ports());
    } else {
        render::candidates(&detect::scan());
    }
    Ok(())
}

fn cmd_firmware_list(ctx: &Ctx) -> anyhow::Result<()> {
    let list = ctx.metadata()?.fetch().context("failed to fetch firmware catalogue")?;
    render::firmware_list(&list, &ctx.cache());
    Ok(())
}

fn cmd_flash(ctx: &mut Ctx, args: FlashArgs) -> anyhow::Result<()> {
    let hub = ProgressHub::new();

    // ── Resolve firmware ──────────────────────────────────────────────────
    let set = match (&args.version, &args.folder) {
        (Some(v), _) => match resolve_version(ctx, &hub, v)? {
            Some(set) => set,
            None => return cancelled(),
        },
        (None, Some(dir)) => resolve_folder(ctx, dir)?,
        (None, None) => {
            let Some(dir) = ctx.settings.last_folder().map(PathBuf::from) else {
                bail!("no firmware given: pass --folder <dir> or --version <label>");
            };
            println!("{} using last folder {}", "→".cyan(), dir.display().to_string().bold());
            resolve_folder(ctx, &dir)?
        }
    };

    if args.require_complete && !set.is_complete() {
        bail!("firmware {} is application-only and --require-complete was given", set.version());
    }

    // ── Flash ─────────────────────────────────────────────────────────────
    let port = ctx.port(args.port)?;
    let flasher = ctx.flasher(args.baud, args.no_verify);

    if !ctx.quiet {
        render::header(
            "Flashing",
            &[format!("port: {port}"), format!("baud: {}", flasher.params().baud)],
        );
        render::firmware_set(&set);
        println!();
    }

    let cancel = ctx.cancel.clone();
    let outcome = with_progress(&hub, Phase::Flash, ctx.quiet, |rep| flasher.flash(&set, &port, rep, &cancel))?;

    match outcome {
        Outcome::Done(report) => {
            render::flash_report(&report);
            ctx.settings.last_port = Some(port);
            ctx.save();
            Ok(())
        }
        Outcome::Cancelled => cancelled(),
    }
}

fn resolve_folder(ctx: &mut Ctx, dir: &std::path::Path) -> anyhow::Result<FirmwareSet> {
    let set = ctx.resolver().resolve_local(dir)?;
    if ctx.settings.remember_folder(dir) {
        ctx.save();
    }
    Ok(set)
}

/// `None` when the download was cancelled.
fn resolve_version(ctx: &Ctx, hub: &ProgressHub, version: &str) -> anyhow::Result<Option<FirmwareSet>> {
    let resolver = ctx.resolver();

    let desc = match ctx.descriptor(version) {
        Ok(d) => d,
        // Offline use of an already downloaded version.
        Err(e) if resolver.cache().is_downloaded(version) => {
            warn!("catalogue unavailable ({e:#}); using cached {version}");
            return Ok(Some(resolver.cache().cached_set(version, "cached download")?));
        }
        Err(e) => return Err(e),
    };

    if !resolver.cache().is_downloaded(version) && !ctx.quiet {
        render::header("Downloading", &[format!("version: {version}")]);
    }
    let cancel = ctx.cancel.clone();
    let out = with_progress(hub, Phase::Download, ctx.quiet, |rep| resolver.resolve_remote(&desc, rep, &cancel))?;
    Ok(out.done())
}

fn cmd_download(ctx: &Ctx, version: &str) -> anyhow::Result<()> {
    let hub = ProgressHub::new();
    match resolve_version(ctx, &hub, version)? {
        Some(set) => {
            println!("{} firmware {} ready", "✓".green().bold(), set.version().bold());
            render::firmware_set(&set);
            Ok(())
        }
        None => cancelled(),
    }
}

fn cmd_verify(ctx: &Ctx, version: &str) -> anyhow::Result<()> {
    let desc = ctx.descriptor(version)?;
    if desc.size.is_none() && desc.checksum.is_none() {
        println!("{} {} declares neither size nor checksum; nothing to compare", "!".yellow(), version);
        return Ok(());
    }
    ctx.resolver().verify(&desc)?;
    println!("{} firmware {} matches its declared size and checksum", "✓".green().bold(), version.bold());
    Ok(())
}

fn cmd_inspect(file: &std::path::Path) -> anyhow::Result<()> {
    let info = firmware::inspect(file)?;
    render::firmware_info(&info);
    Ok(())
}

fn cmd_erase(ctx: &Ctx, args: PortArgs) -> anyhow::Result<()> {
    let port = ctx.port(args.port)?;
    let flasher = ctx.flasher(args.baud, true);
    if !ctx.quiet {
        println!("{} erasing flash on {} (this may take a while)…", "→".cyan(), port.bold());
    }
    match flasher.erase(&port, &ctx.cancel)? {
        Outcome::Done(()) => {
            println!("{} flash erased", "✓".green().bold());
            Ok(())
        }
        Outcome::Cancelled => cancelled(),
    }
}

fn cmd_chip_id(ctx: &Ctx, args: PortArgs) -> anyhow::Result<()> {
    let port = ctx.port(args.port)?;
    let flasher = ctx.flasher(args.baud, true);
    match flasher.chip_id(&port, &ctx.cancel)? {
        Outcome::Done(Some(family)) => {
            println!("{} {} on {}", "✓".green().bold(), family.bold(), port);
            Ok(())
        }
        Outcome::Done(None) => Err(anyhow!("esptool answered on {port} but the chip family was not recognised")),
        Outcome::Cancelled => cancelled(),
    }
}

fn cmd_cache(ctx: &Ctx, args: CacheArgs) -> anyhow::Result<()> {
    let cache = ctx.cache();
    match args.command {
        CacheCmd::List => {
            println!("{} {}", "cache:".dimmed(), cache.root().display());
            render::cache_list(&cache.list()?);
        }
        CacheCmd::Clear => {
            cache.clear().with_context(|| format!("failed to clear {}", cache.root().display()))?;
            println!("{} cache cleared", "✓".green().bold());
        }
    }
    Ok(())
}

fn cmd_config(ctx: &Ctx, args: ConfigArgs) -> anyhow::Result<()> {
    match args.command {
        ConfigCmd::Path => println!("{}", ctx.store.path().display()),
        ConfigCmd::Show => {
            let mut shown = ctx.effective();
            if shown.cloud.api_key.is_some() {
                shown.cloud.api_key = Some("********".into());
            }
            println!("{} {}", "#".dimmed(), ctx.store.path().display().to_string().dimmed());
            print!("{}", toml::to_string_pretty(&shown).context("failed to render settings")?);
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn cancelled() -> anyhow::Result<()> {
    println!("{} cancelled", "!".yellow());
    Ok(())
}
