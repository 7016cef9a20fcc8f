use std::fmt::Display;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::builder::styling::{AnsiColor, Color, Style, Styles};
use clap::{ArgAction, Args, ColorChoice, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::aot::{Generator, Shell, generate};
use clap_complete_nushell::Nushell;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use git2::Repository;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_indicatif::indicatif_println;

use crate::check::{CheckStatus, check};
use crate::config::Config;
use crate::filter::{self, CleanOptions, CleanOutcome, OnError};
use crate::git::attributes::AttributesTarget;
use crate::git::install::{self, ConfigLevel, Driver, InstallOptions};
use crate::git::stage::{self, StageOutcome};
use crate::notebook::StripScope;
use crate::render::OutputStyle;
use crate::{AppResult, process};

const STYLES: Styles = Styles::styled()
    .header(Style::new().bold())
    .usage(Style::new().bold())
    .error(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Red))))
    .literal(
        Style::new()
            .bold()
            .fg_color(Some(Color::Ansi(AnsiColor::Green))),
    )
    .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Yellow))))
    .valid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
    .invalid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightRed))))
    .context(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Magenta))))
    .context_value(
        Style::new()
            .bold()
            .fg_color(Some(Color::Ansi(AnsiColor::Cyan))),
    );

/// Long-form CLI description shown in `--help`.
const LONG_ABOUT: &str = "nbclean - Keep notebook outputs out of git

Registers a git clean filter that empties every cell's outputs and clears its
execution count before a notebook is staged. The working copy keeps its
outputs; only what git stores is cleaned. Checkouts are left alone.

A typical setup is a single command run inside the repository:

    nbclean install

which writes `filter.strip-notebook-output.clean` to the repository config and
maps `*.ipynb` to the filter in `.gitattributes`.";

/// nbclean - Keep notebook outputs out of git.
#[derive(Parser, Debug, Clone)]
#[command(author, version, propagate_version = true, about, long_about = Some(LONG_ABOUT), styles = STYLES)]
pub struct Cli {
    /// Color choice for the output
    #[arg(long, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// Subcommand to run
    #[command(subcommand)]
    pub cmd: Cmd,
}

/// Top-level commands supported by the CLI.
#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Clean filter: read a notebook on stdin, write it without outputs to stdout
    Clean {
        #[command(flatten)]
        filter: FilterArgs,
        /// Path of the file being filtered, used in log messages (git passes `%f`)
        #[arg(long)]
        pathname: Option<String>,
        #[command(flatten)]
        verbosity: Verbosity<WarnLevel>,
    },

    /// Smudge filter: copy stdin to stdout unchanged
    Smudge {
        #[command(flatten)]
        verbosity: Verbosity<WarnLevel>,
    },

    /// Long-running filter speaking git's process protocol on stdin/stdout
    Process {
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        verbosity: Verbosity<WarnLevel>,
    },

    /// Register the filter in git config and map the notebook pattern to it
    Install {
        #[command(flatten)]
        repo: RepoArgs,
        /// Filter name [default: from config, `strip-notebook-output`]
        #[arg(long)]
        name: Option<String>,
        /// Attribute pattern routed through the filter [default: from config, `*.ipynb`]
        #[arg(long)]
        pattern: Option<String>,
        /// Program used as the clean action [default: from config, `builtin`]
        #[arg(long, value_enum)]
        driver: Option<Driver>,
        /// Git config file that receives the filter definition
        #[arg(long, value_enum, default_value_t)]
        level: ConfigLevel,
        /// Attributes file that receives the pattern mapping
        #[arg(long, value_enum, default_value_t)]
        attributes: AttributesTarget,
        /// Also register the long-running `process` command
        #[arg(long, action = ArgAction::SetTrue)]
        process: bool,
        /// Mark the filter as required, so a failing filter aborts staging
        #[arg(long, action = ArgAction::SetTrue)]
        required: bool,
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        verbosity: Verbosity<WarnLevel>,
    },

    /// Remove the filter definition and its attribute mappings
    Uninstall {
        #[command(flatten)]
        repo: RepoArgs,
        /// Filter name [default: from config]
        #[arg(long)]
        name: Option<String>,
        /// Git config file holding the filter definition
        #[arg(long, value_enum, default_value_t)]
        level: ConfigLevel,
        /// Attributes file holding the pattern mapping
        #[arg(long, value_enum, default_value_t)]
        attributes: AttributesTarget,
        #[command(flatten)]
        verbosity: Verbosity<WarnLevel>,
    },

    /// Show how the filter is configured in a repository
    Status {
        #[command(flatten)]
        repo: RepoArgs,
        /// Filter name [default: from config]
        #[arg(long)]
        name: Option<String>,
        /// Only read this config file instead of the merged configuration
        #[arg(long, value_enum)]
        level: Option<ConfigLevel>,
        /// Print the status as JSON
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
        #[command(flatten)]
        verbosity: Verbosity<WarnLevel>,
    },

    /// Stage files through their configured clean filter
    ///
    /// Files whose filter fails are staged unfiltered, unless the filter is
    /// marked as required
    Stage {
        #[command(flatten)]
        repo: RepoArgs,
        /// Files to stage
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Print the staging results as JSON
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
        #[command(flatten)]
        verbosity: Verbosity<WarnLevel>,
    },

    /// Print the staged content of a file
    Staged {
        #[command(flatten)]
        repo: RepoArgs,
        /// File to print
        path: PathBuf,
        #[command(flatten)]
        verbosity: Verbosity<WarnLevel>,
    },

    /// Report notebooks that still carry outputs or execution counts
    ///
    /// Exits with status 1 when any are found
    Check {
        /// Files or directories to inspect
        #[arg(default_value = ".")]
        paths: Vec<PathBuf>,
        /// Pattern selecting notebooks inside directories [default: from config]
        #[arg(long)]
        pattern: Option<String>,
        /// Cells that must be free of outputs [default: from config]
        #[arg(long, value_enum)]
        scope: Option<StripScope>,
        /// Print the report as JSON
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
        #[command(flatten)]
        verbosity: Verbosity<WarnLevel>,
    },

    /// Generate shell completion for a given shell
    Completion {
        /// Output file to write the completion script to
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// The shell to generate the completion for
        #[arg(value_enum)]
        shell: CompletionShell,

        #[command(flatten)]
        verbosity: Verbosity<WarnLevel>,
    },

    /// Inspect the configuration file
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCmd {
    /// Print the effective configuration
    Show {
        #[command(flatten)]
        verbosity: Verbosity<WarnLevel>,
    },
    /// Print the JSON schema of the configuration file
    Schema {
        #[command(flatten)]
        verbosity: Verbosity<WarnLevel>,
    },
    /// Print where the configuration file is read from
    Path {
        #[command(flatten)]
        verbosity: Verbosity<WarnLevel>,
    },
}

/// Supported completion targets for shell auto-completion.
#[derive(ValueEnum, Clone, Debug)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
    Nushell,
}

impl Display for CompletionShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompletionShell::Bash => "bash",
            CompletionShell::Zsh => "zsh",
            CompletionShell::Fish => "fish",
            CompletionShell::PowerShell => "powershell",
            CompletionShell::Elvish => "elvish",
            CompletionShell::Nushell => "nushell",
        };
        write!(f, "{}", s)
    }
}

impl Generator for &CompletionShell {
    fn generate(&self, cmd: &clap::builder::Command, buf: &mut dyn Write) {
        match self {
            CompletionShell::Bash => Shell::Bash.generate(cmd, buf),
            CompletionShell::Zsh => Shell::Zsh.generate(cmd, buf),
            CompletionShell::Fish => Shell::Fish.generate(cmd, buf),
            CompletionShell::PowerShell => Shell::PowerShell.generate(cmd, buf),
            CompletionShell::Elvish => Shell::Elvish.generate(cmd, buf),
            CompletionShell::Nushell => Nushell.generate(cmd, buf),
        }
    }

    fn file_name(&self, name: &str) -> String {
        match self {
            CompletionShell::Bash => Shell::Bash.file_name(name),
            CompletionShell::Zsh => Shell::Zsh.file_name(name),
            CompletionShell::Fish => Shell::Fish.file_name(name),
            CompletionShell::PowerShell => Shell::PowerShell.file_name(name),
            CompletionShell::Elvish => Shell::Elvish.file_name(name),
            CompletionShell::Nushell => Nushell.file_name(name),
        }
    }
}

/// Cleaning options. Unset flags fall back to the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Cells whose outputs and execution counts are cleared
    #[arg(long, value_enum)]
    pub scope: Option<StripScope>,
    /// Formatting of the cleaned notebook
    #[arg(long, value_enum)]
    pub style: Option<OutputStyle>,
    /// What to do with input that is not a notebook
    #[arg(long, value_enum)]
    pub on_error: Option<OnError>,
}

impl FilterArgs {
    pub fn resolve(&self, base: CleanOptions) -> CleanOptions {
        CleanOptions {
            scope: self.scope.unwrap_or(base.scope),
            style: self.style.unwrap_or(base.style),
            on_error: self.on_error.unwrap_or(base.on_error),
        }
    }
}

/// Selects the repository to operate on.
#[derive(Args, Debug, Clone)]
pub struct RepoArgs {
    /// Path inside the repository
    #[arg(short = 'C', long = "repo", default_value = ".")]
    pub repo: PathBuf,
}

impl RepoArgs {
    pub fn open(&self) -> AppResult<Repository> {
        Ok(Repository::discover(&self.repo)?)
    }
}

/// Helper trait for accessing verbosity flags on commands.
pub trait GetVerbosity {
    fn get_verbosity(&self) -> &Verbosity<WarnLevel>;
}

impl GetVerbosity for Cmd {
    fn get_verbosity(&self) -> &Verbosity<WarnLevel> {
        match self {
            Cmd::Clean { verbosity, .. } => verbosity,
            Cmd::Smudge { verbosity } => verbosity,
            Cmd::Process { verbosity, .. } => verbosity,
            Cmd::Install { verbosity, .. } => verbosity,
            Cmd::Uninstall { verbosity, .. } => verbosity,
            Cmd::Status { verbosity, .. } => verbosity,
            Cmd::Stage { verbosity, .. } => verbosity,
            Cmd::Staged { verbosity, .. } => verbosity,
            Cmd::Check { verbosity, .. } => verbosity,
            Cmd::Completion { verbosity, .. } => verbosity,
            Cmd::Config { cmd } => cmd.get_verbosity(),
        }
    }
}

impl GetVerbosity for ConfigCmd {
    fn get_verbosity(&self) -> &Verbosity<WarnLevel> {
        match self {
            ConfigCmd::Show { verbosity } => verbosity,
            ConfigCmd::Schema { verbosity } => verbosity,
            ConfigCmd::Path { verbosity } => verbosity,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    indicatif_println!("{json}");
    Ok(())
}

impl Cmd {
    /// Execute the chosen top-level command.
    #[tracing::instrument(name = "Running command", level = "debug", skip_all)]
    pub async fn run(&self, config: &Config) -> AppResult<ExitCode> {
        match self {
            Cmd::Clean {
                filter: args,
                pathname,
                ..
            } => {
                let opts = args.resolve(config.clean);
                let outcome = filter::run_clean(
                    tokio::io::stdin(),
                    tokio::io::stdout(),
                    &opts,
                    pathname.as_deref(),
                )
                .await?;
                if let CleanOutcome::Passthrough { reason, .. } = outcome {
                    info!("Passed input through unchanged: {reason}");
                }
                Ok(ExitCode::SUCCESS)
            }
            Cmd::Smudge { .. } => {
                filter::run_smudge(tokio::io::stdin(), tokio::io::stdout()).await?;
                Ok(ExitCode::SUCCESS)
            }
            Cmd::Process { filter: args, .. } => {
                let opts = args.resolve(config.clean);
                process::serve(tokio::io::stdin(), tokio::io::stdout(), &opts).await?;
                Ok(ExitCode::SUCCESS)
            }
            Cmd::Install {
                repo,
                name,
                pattern,
                driver,
                level,
                attributes,
                process,
                required,
                filter: args,
                ..
            } => {
                let repo = repo.open()?;
                let opts = InstallOptions {
                    name: name.clone().unwrap_or_else(|| config.filter_name.clone()),
                    pattern: pattern.clone().unwrap_or_else(|| config.pattern.clone()),
                    driver: driver.unwrap_or(config.driver),
                    level: *level,
                    attributes: *attributes,
                    process: *process,
                    required: *required,
                    clean: args.resolve(config.clean),
                    exe: std::env::current_exe()?,
                };
                let report = install::install(&repo, &opts)?;
                indicatif_println!(
                    "Installed filter `{}` ({} config)\n  clean = {}",
                    report.name,
                    report.level,
                    report.clean
                );
                if let Some(process) = &report.process {
                    indicatif_println!("  process = {process}");
                }
                if report.required {
                    indicatif_println!("  required = true");
                }
                let verb = if report.attributes_changed {
                    "Mapped"
                } else {
                    "Already mapped"
                };
                indicatif_println!(
                    "{verb} `{}` in {}",
                    opts.pattern,
                    report.attributes_path.display()
                );
                Ok(ExitCode::SUCCESS)
            }
            Cmd::Uninstall {
                repo,
                name,
                level,
                attributes,
                ..
            } => {
                let repo = repo.open()?;
                let name = name.as_deref().unwrap_or(&config.filter_name);
                let report = install::uninstall(&repo, name, *level, *attributes)?;
                if report.keys_removed.is_empty() && report.attributes_removed == 0 {
                    indicatif_println!("Filter `{name}` was not installed");
                } else {
                    for key in &report.keys_removed {
                        indicatif_println!("Removed {key}");
                    }
                    indicatif_println!(
                        "Removed {} mapping(s) from {}",
                        report.attributes_removed,
                        report.attributes_path.display()
                    );
                }
                Ok(ExitCode::SUCCESS)
            }
            Cmd::Status {
                repo,
                name,
                level,
                json,
                ..
            } => {
                let repo = repo.open()?;
                let name = name.as_deref().unwrap_or(&config.filter_name);
                let status = install::status(&repo, name, *level)?;
                if *json {
                    print_json(&status)?;
                } else {
                    let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "(unset)".into());
                    indicatif_println!("filter.{name}.clean = {}", show(&status.clean));
                    indicatif_println!("filter.{name}.smudge = {}", show(&status.smudge));
                    indicatif_println!("filter.{name}.process = {}", show(&status.process));
                    indicatif_println!("filter.{name}.required = {}", status.required);
                    if status.attributes.is_empty() {
                        indicatif_println!("No attributes route files to `{name}`");
                    }
                    for source in &status.attributes {
                        for line in &source.lines {
                            indicatif_println!("{}: {line}", source.path.display());
                        }
                    }
                }
                Ok(if status.is_installed() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                })
            }
            Cmd::Stage {
                repo, paths, json, ..
            } => {
                let repo = repo.open()?;
                let reports = stage::stage_paths(&repo, paths).await?;
                if *json {
                    print_json(&reports)?;
                } else {
                    for report in &reports {
                        let how = match &report.outcome {
                            StageOutcome::Unfiltered => "unfiltered".to_string(),
                            StageOutcome::Filtered { filter } => format!("filtered by `{filter}`"),
                            StageOutcome::FellBack { filter, .. } => {
                                format!("unfiltered, `{filter}` failed")
                            }
                        };
                        indicatif_println!("{} {} ({how})", report.blob, report.path.display());
                    }
                }
                Ok(ExitCode::SUCCESS)
            }
            Cmd::Staged { repo, path, .. } => {
                let repo = repo.open()?;
                let bytes = stage::read_staged(&repo, path)?;
                let mut stdout = tokio::io::stdout();
                stdout.write_all(&bytes).await?;
                stdout.flush().await?;
                Ok(ExitCode::SUCCESS)
            }
            Cmd::Check {
                paths,
                pattern,
                scope,
                json,
                ..
            } => {
                let pattern = pattern.as_deref().unwrap_or(&config.pattern);
                let scope = scope.unwrap_or(config.clean.scope);
                let report = check(paths, pattern, scope)?;
                if *json {
                    print_json(&report)?;
                } else {
                    for entry in &report.entries {
                        match &entry.status {
                            CheckStatus::Dirty(i) => indicatif_println!(
                                "{}: {} output(s), {} execution count(s) in {} cell(s)",
                                entry.path.display(),
                                i.outputs,
                                i.counts,
                                i.dirty_cells
                            ),
                            CheckStatus::Unreadable { reason } => indicatif_println!(
                                "{}: unreadable ({reason})",
                                entry.path.display()
                            ),
                            CheckStatus::Clean => {}
                        }
                    }
                    info!(
                        "Checked {} notebook(s), {} unreadable",
                        report.entries.len(),
                        report.unreadable().count()
                    );
                }
                Ok(if report.is_clean() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                })
            }
            Cmd::Completion { shell, output, .. } => {
                let mut cmd = Cli::command();
                if let Some(output_path) = output {
                    let mut file = std::fs::OpenOptions::new()
                        .write(true)
                        .truncate(true)
                        .create(true)
                        .open(output_path)?;
                    generate(shell, &mut cmd, "nbclean", &mut file);
                    info!(
                        "Generated completion script for {} at {}",
                        shell,
                        output_path.display()
                    );
                } else {
                    generate(shell, &mut cmd, "nbclean", &mut std::io::stdout());
                }
                Ok(ExitCode::SUCCESS)
            }
            Cmd::Config { cmd } => {
                match cmd {
                    ConfigCmd::Show { .. } => print_json(config)?,
                    ConfigCmd::Schema { .. } => print_json(&Config::schema())?,
                    ConfigCmd::Path { .. } => {
                        indicatif_println!("{}", Config::path()?.display())
                    }
                }
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}
