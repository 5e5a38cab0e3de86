use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use patchkit::codec::Codec;
use patchkit::events::UpdateEvent;
use patchkit::repository::{self, Repository};
use patchkit::{Updater, UpdaterConfig, UpdaterState};

#[derive(Parser)]
#[command(name = "patchkit", about = "Binary patch repository builder and update client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a local tree is behind the repository
    Check {
        /// Repository URL or directory
        repository: String,
        /// Local directory to check
        dir: PathBuf,
    },
    /// Update a local tree to the repository's current revision
    Update {
        /// Repository URL or directory
        repository: String,
        /// Local directory to update
        dir: PathBuf,
        /// Staging directory (same filesystem as the local directory)
        #[arg(long)]
        tmp: Option<PathBuf>,
    },
    /// Build a package from a directory snapshot and register it
    Mkpackage {
        /// Repository directory
        repo: PathBuf,
        /// New snapshot directory
        newdir: PathBuf,
        /// New revision id
        newrev: String,
        /// Old snapshot directory (omit for a complete install)
        olddir: Option<PathBuf>,
        /// Old revision id
        oldrev: Option<String>,
    },
    /// Register an externally built package (blob + .metadata)
    Addpackage {
        /// Repository directory
        repo: PathBuf,
        /// Path to the package blob
        package: PathBuf,
    },
    /// Drop a package from the repository
    Rmpackage {
        /// Repository directory
        repo: PathBuf,
        /// Package name, e.g. patch1_2 or complete_3
        name: String,
    },
    /// Point the repository's current revision
    Setversion {
        /// Repository directory
        repo: PathBuf,
        /// Revision id
        rev: String,
    },
    /// Drop packages that no cheapest chain to the current revision uses
    Simplify {
        /// Repository directory
        repo: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { repository, dir } => {
            let mut updater = Updater::new(UpdaterConfig::new(repository, dir))?;
            match updater.check_for_updates().await? {
                UpdaterState::AlreadyUptodate => {
                    println!("Already up to date (revision {})", updater.local_revision());
                }
                _ => {
                    let target = updater.target_revision().expect("checked");
                    println!(
                        "Update available: {} -> {} {}",
                        if updater.local_revision().is_empty() {
                            "<none>"
                        } else {
                            updater.local_revision()
                        },
                        target.id,
                        target.description
                    );
                }
            }
        }
        Commands::Update {
            repository,
            dir,
            tmp,
        } => {
            let mut config = UpdaterConfig::new(repository, dir);
            config.tmp_dir = tmp;
            let mut updater = Updater::new(config)?;
            let mut events = updater.subscribe();
            let printer = tokio::spawn(async move {
                let mut last_percent = 0u32;
                while let Some(event) = events.recv().await {
                    match event {
                        UpdateEvent::Progress { applied, .. } => {
                            let percent = (applied * 100.0) as u32;
                            if percent / 10 > last_percent / 10 {
                                println!("  {percent}% applied");
                                last_percent = percent;
                            }
                        }
                        UpdateEvent::Operation { path, kind, detail } => {
                            println!("  [{kind:?}] {path}: {detail}");
                        }
                    }
                }
            });

            let start = Instant::now();
            let result = updater.update().await;
            let revision = updater.local_revision().to_string();
            // Dropping the updater closes the event channel so the printer
            // drains and exits.
            drop(updater);
            let _ = printer.await;

            match result {
                Ok(UpdaterState::Uptodate) => {
                    println!(
                        "Updated to revision {} in {:.3}s",
                        revision,
                        start.elapsed().as_secs_f64()
                    );
                }
                Ok(state) => println!("Nothing to do ({state})"),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Mkpackage {
            repo,
            newdir,
            newrev,
            olddir,
            oldrev,
        } => {
            let old = match (olddir, oldrev) {
                (Some(dir), Some(rev)) => Some((dir, rev)),
                (None, None) => None,
                _ => bail!("olddir and oldrev must be given together"),
            };

            let mut repo = Repository::open(repo)?;
            let start = Instant::now();
            let summary =
                repository::make_package(&mut repo, &newdir, &newrev, old, &Codec::default())
                    .await?;
            let package = summary.package.expect("package registered");

            println!("Package {} created", package.name());
            println!("  Directories: {}", summary.dirs);
            println!("  Files added: {}", summary.files_added);
            println!("  Files patched: {}", summary.files_patched);
            println!("  Files unchanged: {}", summary.files_unchanged);
            println!("  Files deleted: {}", summary.files_deleted);
            println!("  Directories deleted: {}", summary.dirs_deleted);
            println!("  Blob size: {} bytes", package.size);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Addpackage { repo, package } => {
            let mut repo = Repository::open(repo)?;
            let package = repo.add_package(&package)?;
            println!("Registered {}", package.name());
        }
        Commands::Rmpackage { repo, name } => {
            let mut repo = Repository::open(repo)?;
            repo.remove_package(&name)?;
            println!("Removed {name}");
        }
        Commands::Setversion { repo, rev } => {
            let mut repo = Repository::open(repo)?;
            repo.set_current(&rev)?;
            println!("Current revision set to {rev}");
        }
        Commands::Simplify { repo } => {
            let mut repo = Repository::open(repo)?;
            let removed = repo.simplify()?;
            if removed.is_empty() {
                println!("All packages are on a useful chain");
            } else {
                for name in removed {
                    println!("Dropped {name}");
                }
            }
        }
    }

    Ok(())
}
