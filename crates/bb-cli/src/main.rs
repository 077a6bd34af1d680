use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use bb_core::engine::{CloneRequest, LinkRequest, Reporter, RunStatus, Session, SyncOptions};
use bb_core::fix::FixOptions;
use bb_core::git::SystemGit;
use bb_core::paths::Paths;
use bb_core::types::{Catalog, MachineRepoRecord};

mod scheduler;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BB_BUILD_GIT_SHA"),
    ", ",
    env!("BB_BUILD_PROFILE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "bb", version, long_version = LONG_VERSION)]
#[command(about = "Keep your Git repositories consistent across machines, no server required")]
struct Cli {
    /// Suppress verbose progress output.
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new project in a catalog and register its origin.
    Init {
        /// Project name; defaults to the current directory's name.
        project: Option<String>,
        #[arg(long)]
        catalog: Option<String>,
        /// Record the repository as public.
        #[arg(long)]
        public: bool,
        /// Create an initial commit and push it.
        #[arg(long)]
        push: bool,
        /// Use an https origin URL instead of ssh.
        #[arg(long)]
        https: bool,
    },
    /// Clone a repository into its catalog-derived path.
    Clone {
        /// `owner/name`, a bare name, or a full URL.
        repo: String,
        #[arg(long)]
        catalog: Option<String>,
        /// Directory name to clone as, overriding the repository name.
        #[arg(long = "as")]
        rename: Option<String>,
        #[arg(long, conflicts_with = "no_shallow")]
        shallow: bool,
        #[arg(long)]
        no_shallow: bool,
        /// Partial-clone filter, e.g. `blob:none`. An empty value unsets it.
        #[arg(long, conflicts_with = "no_filter")]
        filter: Option<String>,
        #[arg(long)]
        no_filter: bool,
        /// Sparse-checkout paths (repeatable).
        #[arg(long = "only")]
        only: Vec<String>,
    },
    /// Symlink a repository's catalog path into a directory.
    Link {
        /// Repo key or repository name.
        selector: String,
        /// Link name, overriding the repository name.
        #[arg(long = "as")]
        rename: Option<String>,
        /// Directory to create the link in; defaults to the current one.
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Link the absolute path instead of a relative one.
        #[arg(long)]
        absolute: bool,
        #[arg(long)]
        catalog: Option<String>,
    },
    /// Observe catalogs and publish this machine's snapshot.
    Scan {
        #[arg(long = "include-catalog")]
        include_catalog: Vec<String>,
    },
    /// Scan, pick winners across machines, and reconcile local trees.
    Sync {
        #[arg(long = "include-catalog")]
        include_catalog: Vec<String>,
        /// Push local work even where auto-push policy would not.
        #[arg(long)]
        push: bool,
        /// Emit unsyncable notifications through the configured backend.
        #[arg(long)]
        notify: bool,
        #[arg(long)]
        notify_backend: Option<String>,
        /// Report planned reconcile steps without mutating anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show per-repository state.
    Status {
        #[arg(long)]
        json: bool,
        #[arg(long = "include-catalog")]
        include_catalog: Vec<String>,
    },
    /// Diagnose the environment and report unsyncable repositories.
    Doctor {
        #[arg(long = "include-catalog")]
        include_catalog: Vec<String>,
    },
    /// Clone every repository known to the shared area that is missing here.
    Ensure {
        #[arg(long = "include-catalog")]
        include_catalog: Vec<String>,
    },
    /// List or apply remediation actions for unsyncable repositories.
    Fix {
        /// Repo key or repository name.
        project: Option<String>,
        /// Action to apply; omit to list applicable actions.
        action: Option<String>,
        #[arg(long = "include-catalog")]
        include_catalog: Vec<String>,
        /// Commit message for stage-commit-push.
        #[arg(long)]
        message: Option<String>,
        /// Branch name for publish-new-branch.
        #[arg(long)]
        publish_branch: Option<String>,
        /// Return to the original branch after sync-with-upstream.
        #[arg(long)]
        return_to_original_sync: bool,
        #[arg(long, value_parser = ["rebase", "merge"])]
        sync_strategy: Option<String>,
        /// Reuse the last scan even if it is stale.
        #[arg(long)]
        no_refresh: bool,
    },
    /// Inspect or change shared per-repository settings.
    Repo {
        #[command(subcommand)]
        cmd: RepoCommands,
    },
    /// Manage catalogs.
    Catalog {
        #[command(subcommand)]
        cmd: CatalogCommands,
    },
    /// Manage the periodic sync trigger.
    Scheduler {
        #[command(subcommand)]
        cmd: SchedulerCommands,
    },
    /// Print the resolved configuration and file locations.
    Config,
    /// Generate shell completions.
    Completion { shell: Shell },
}

#[derive(Subcommand, Debug)]
enum RepoCommands {
    /// Set the auto-push policy.
    Policy {
        repo: String,
        #[arg(long)]
        auto_push: String,
    },
    /// Set the preferred remote.
    Remote {
        repo: String,
        #[arg(long)]
        preferred_remote: String,
    },
    /// Manually override the cached push access.
    AccessSet {
        repo: String,
        #[arg(long, value_parser = ["read_write", "read_only", "unknown"])]
        push_access: String,
    },
    /// Re-probe push access against the remote.
    AccessRefresh { repo: String },
}

#[derive(Subcommand, Debug)]
enum CatalogCommands {
    Add {
        name: String,
        root: PathBuf,
        /// Path segments below the root that identify a repository (1 or 2).
        #[arg(long, default_value_t = 1)]
        depth: u8,
        /// Make this the default catalog.
        #[arg(long)]
        default: bool,
        /// Clone repositories missing locally during sync.
        #[arg(long)]
        auto_clone: bool,
    },
    Rm {
        name: String,
    },
    /// Set the default catalog.
    Default {
        name: String,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum SchedulerCommands {
    Install {
        /// Minutes between sync runs.
        #[arg(long, default_value_t = 30)]
        interval_minutes: u64,
    },
    Status,
    Remove,
}

struct CliReporter {
    quiet: bool,
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        if !self.quiet {
            eprintln!("[info] {msg}");
        }
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("bb: {err:#}");
            2
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    if let Commands::Completion { shell } = &cli.cmd {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "bb", &mut io::stdout());
        return Ok(0);
    }

    let git = SystemGit::from_env();
    let paths = Paths::from_env()?;
    let mut reporter = CliReporter { quiet: cli.quiet };

    match cli.cmd {
        Commands::Completion { .. } => unreachable!("handled above"),

        Commands::Init {
            project,
            catalog,
            public,
            push,
            https,
        } => {
            let session = Session::open(&git, paths)?;
            session.run_init(
                project.as_deref(),
                catalog.as_deref(),
                public,
                push,
                https,
                &mut reporter,
            )?;
            Ok(0)
        }

        Commands::Clone {
            repo,
            catalog,
            rename,
            shallow,
            no_shallow: _,
            filter,
            no_filter,
            only,
        } => {
            let session = Session::open(&git, paths)?;
            // An empty --filter means the same thing as --no-filter.
            let filter = if no_filter { None } else { filter };
            let path = session.run_clone(
                &CloneRequest {
                    selector: repo,
                    catalog,
                    rename,
                    shallow,
                    filter,
                    only,
                },
                &mut reporter,
            )?;
            println!("{}", path.display());
            Ok(0)
        }

        Commands::Link {
            selector,
            rename,
            dir,
            absolute,
            catalog,
        } => {
            let session = Session::open(&git, paths)?;
            let path = session.run_link(
                &LinkRequest {
                    selector,
                    rename,
                    dir,
                    absolute,
                    catalog,
                },
                &mut reporter,
            )?;
            println!("{}", path.display());
            Ok(0)
        }

        Commands::Scan { include_catalog } => {
            let session = Session::open(&git, paths)?;
            let status = session.run_scan(&include_catalog, false, &mut reporter)?;
            Ok(status.exit_code())
        }

        Commands::Sync {
            include_catalog,
            push,
            notify,
            notify_backend,
            dry_run,
        } => {
            let session = Session::open(&git, paths)?;
            let status = session.run_sync(
                &SyncOptions {
                    include: include_catalog,
                    push,
                    dry_run,
                    notify,
                    notify_backend,
                },
                &mut reporter,
            )?;
            Ok(status.exit_code())
        }

        Commands::Status {
            json,
            include_catalog,
        } => {
            let session = Session::open(&git, paths)?;
            let records = session.current_records(&include_catalog, &mut reporter)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_status_table(&records);
            }
            Ok(RunStatus::from_records(&records).exit_code())
        }

        Commands::Doctor { include_catalog } => {
            let session = Session::open(&git, paths)?;
            let status = session.run_doctor(&include_catalog, &mut reporter)?;
            Ok(status.exit_code())
        }

        Commands::Ensure { include_catalog } => {
            let session = Session::open(&git, paths)?;
            let status = session.run_ensure(&include_catalog, &mut reporter)?;
            Ok(status.exit_code())
        }

        Commands::Fix {
            project,
            action,
            include_catalog,
            message,
            publish_branch,
            return_to_original_sync,
            sync_strategy,
            no_refresh,
        } => {
            let session = Session::open(&git, paths)?;
            let options = FixOptions {
                message,
                publish_branch,
                sync_strategy: sync_strategy.as_deref().map(str::parse).transpose()?,
                return_to_original_sync,
            };
            let status = session.run_fix(
                project.as_deref(),
                action.as_deref(),
                &include_catalog,
                &options,
                no_refresh,
                &mut reporter,
            )?;
            Ok(status.exit_code())
        }

        Commands::Repo { cmd } => {
            let session = Session::open(&git, paths)?;
            match cmd {
                RepoCommands::Policy { repo, auto_push } => {
                    let meta = session.repo_set_policy(&repo, auto_push.parse()?)?;
                    println!("{}: auto_push = {}", meta.repo_key, meta.auto_push.as_str());
                }
                RepoCommands::Remote {
                    repo,
                    preferred_remote,
                } => {
                    let meta = session.repo_set_remote(&repo, &preferred_remote)?;
                    println!(
                        "{}: preferred_remote = {}",
                        meta.repo_key,
                        meta.preferred_remote.as_deref().unwrap_or("origin")
                    );
                }
                RepoCommands::AccessSet { repo, push_access } => {
                    let meta = session.repo_access_set(&repo, push_access.parse()?)?;
                    println!(
                        "{}: push_access = {} (manual override)",
                        meta.repo_key,
                        meta.push_access.as_str()
                    );
                }
                RepoCommands::AccessRefresh { repo } => {
                    let meta = session.repo_access_refresh(&repo, &mut reporter)?;
                    println!("{}: push_access = {}", meta.repo_key, meta.push_access.as_str());
                }
            }
            Ok(0)
        }

        Commands::Catalog { cmd } => {
            let mut session = Session::open(&git, paths)?;
            match cmd {
                CatalogCommands::Add {
                    name,
                    root,
                    depth,
                    default,
                    auto_clone,
                } => {
                    let mut catalog = Catalog::new(name, root);
                    catalog.repo_path_depth = depth;
                    if auto_clone {
                        catalog.auto_clone_on_sync = Some(true);
                    }
                    session.catalog_add(catalog, default)?;
                }
                CatalogCommands::Rm { name } => session.catalog_rm(&name)?,
                CatalogCommands::Default { name } => session.catalog_set_default(&name)?,
                CatalogCommands::List => {
                    for catalog in &session.config.catalogs {
                        let marker = if session.config.default_catalog.as_deref()
                            == Some(catalog.name.as_str())
                        {
                            "*"
                        } else {
                            " "
                        };
                        println!(
                            "{marker} {} {} (depth {})",
                            catalog.name,
                            catalog.root.display(),
                            catalog.repo_path_depth
                        );
                    }
                }
            }
            Ok(0)
        }

        Commands::Scheduler { cmd } => {
            let session = Session::open(&git, paths)?;
            match cmd {
                SchedulerCommands::Install { interval_minutes } => {
                    scheduler::install(session.paths(), interval_minutes, &mut reporter)?
                }
                SchedulerCommands::Status => scheduler::status(session.paths(), &mut reporter)?,
                SchedulerCommands::Remove => scheduler::remove(session.paths(), &mut reporter)?,
            }
            Ok(0)
        }

        Commands::Config => {
            let session = Session::open(&git, paths)?;
            println!("# {}", session.paths().config_file().display());
            print!("{}", serde_yaml::to_string(&session.config)?);
            println!("# machine id: {}", session.machine_id);
            println!("# state root: {}", session.paths().state_root().display());
            Ok(0)
        }
    }
}

fn print_status_table(records: &[MachineRepoRecord]) {
    if records.is_empty() {
        println!("no repositories discovered");
        return;
    }
    let key_width = records
        .iter()
        .map(|r| r.repo_key.len())
        .max()
        .unwrap_or(0)
        .max("repository".len());
    println!("{:<key_width$}  {:<20}  {:>5}  {:>6}  state", "repository", "branch", "ahead", "behind");
    for record in records {
        let state = if record.syncable {
            "ok".to_string()
        } else {
            record
                .unsyncable_reasons
                .iter()
                .map(|r| r.as_str())
                .collect::<Vec<_>>()
                .join(",")
        };
        println!(
            "{:<key_width$}  {:<20}  {:>5}  {:>6}  {state}",
            record.repo_key, record.branch, record.ahead, record.behind
        );
    }
}
