use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use upkeeper::backup::InstallBackup;
use upkeeper::catalog::{self, RepoManifest};
use upkeeper::engine::state::{ProgressEvent, UpgradeOutcome, UpgradeStage};
use upkeeper::networking::NetworkClient;
use upkeeper::patcher::DataPatcher;
use upkeeper::release::is_upgrade;
use upkeeper::storage::JsonFileStore;
use upkeeper::{Result, UpgradeConfig, UpgradeError, Upgrader, env, preflight};

#[derive(Parser, Debug)]
#[command(
    name = "upkeeper",
    author,
    version,
    about = "Checks for, downloads and applies upgrades to an installed service"
)]
struct Cli {
    /// JSON config file. Missing means defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Install root to operate on, overriding the config file.
    #[arg(long, global = true)]
    install_dir: Option<PathBuf>,

    /// Release channel (e.g. stable, beta), overriding the config file.
    #[arg(long, global = true)]
    channel: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve current, next and latest versions and record them.
    Check,
    /// Run the full upgrade to the next release.
    Upgrade,
    /// Only check that the install root holds expected entries.
    Preflight,
    /// Merge a repository manifest file into the plugin catalog.
    SyncCatalog {
        /// Repository manifest (settings plus `plugins` list).
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    debug!("config: {config:?}");
    let store = JsonFileStore::new(env::records_file(&config.data_dir()));

    match cli.command {
        Command::Check => {
            let remote = NetworkClient::from_config(&config);
            let backup = InstallBackup::new(&config);
            let patcher = DataPatcher::new();
            let manifest =
                Upgrader::new(config, &remote, &backup, &patcher, &store).refresh_manifest()?;
            println!("current: {}", manifest.version);
            println!("next:    {}", manifest.next_version);
            println!("latest:  {}", manifest.latest_version);
            if is_upgrade(&manifest.version, &manifest.next_version)? {
                println!("upgrade available: {}", manifest.next_version);
            } else {
                println!("already on the current version");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Upgrade => upgrade(config, &store),
        Command::Preflight => {
            match preflight::check_expected_files(&config.install_dir, &config.expected_entries) {
                Ok(()) => {
                    println!("{}: install layout looks as expected", config.install_dir.display());
                    Ok(ExitCode::SUCCESS)
                }
                Err(UpgradeError::Preflight { unexpected }) => {
                    for name in unexpected {
                        println!("unexpected entry: {name}");
                    }
                    Ok(ExitCode::FAILURE)
                }
                Err(err) => Err(err),
            }
        }
        Command::SyncCatalog { file } => {
            let text = fs::read_to_string(&file)
                .map_err(|e| UpgradeError::io(format!("reading {}", file.display()), e))?;
            let manifest = RepoManifest::from_json(&text)?;
            let merged = catalog::sync_plugins(&store, &manifest.repo, &manifest.plugins)?;
            println!("merged {merged} plugins from {}", manifest.repo.id);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(cli: &Cli) -> Result<UpgradeConfig> {
    let mut config = match &cli.config {
        Some(path) => UpgradeConfig::load(path)?,
        None => UpgradeConfig::default(),
    };
    if let Some(dir) = &cli.install_dir {
        config.install_dir = dir.clone();
    }
    if let Some(channel) = &cli.channel {
        config.channel = channel.clone();
    }
    config.validate()?;
    Ok(config)
}

fn upgrade(config: UpgradeConfig, store: &JsonFileStore) -> Result<ExitCode> {
    let remote = NetworkClient::from_config(&config);
    let backup = InstallBackup::new(&config);
    let patcher = DataPatcher::new();
    let (tx, rx) = mpsc::channel();

    let report = thread::scope(|s| {
        s.spawn(move || render_progress(rx));
        Upgrader::new(config, &remote, &backup, &patcher, store)
            .with_observer(tx)
            .run()
    })?;

    match report.outcome {
        UpgradeOutcome::Upgraded { from, to, backup } => {
            println!("upgraded {from} -> {to} (backup in {})", backup.display());
            Ok(ExitCode::SUCCESS)
        }
        UpgradeOutcome::AlreadyCurrent { version } => {
            println!("already on {version}, nothing to do");
            Ok(ExitCode::SUCCESS)
        }
        UpgradeOutcome::Failed { stage, reason } => {
            eprintln!("upgrade failed during {stage}: {reason}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn render_progress(rx: Receiver<ProgressEvent>) {
    let mut bar: Option<ProgressBar> = None;
    for event in rx {
        match event {
            ProgressEvent::Line(line) => match &bar {
                Some(bar) => bar.println(line),
                None => println!("{line}"),
            },
            ProgressEvent::Download { downloaded, total } => {
                let bar = bar.get_or_insert_with(|| download_bar(total));
                if let Some(total) = total {
                    bar.set_length(total);
                }
                bar.set_position(downloaded);
            }
            ProgressEvent::Stage(stage) if stage != UpgradeStage::Download => {
                if let Some(bar) = bar.take() {
                    bar.finish_and_clear();
                }
            }
            ProgressEvent::Stage(_) => {}
            ProgressEvent::Finished(_) => break,
        }
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
}

fn download_bar(total: Option<u64>) -> ProgressBar {
    let bar = match total {
        Some(total) => ProgressBar::new(total),
        None => ProgressBar::no_length(),
    };
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.cyan.bold} download [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec}",
    ) {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}
