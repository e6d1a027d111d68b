//! dockfw - persistent firewall rules for Docker containers
//!
//! # Usage
//!
//! ```bash
//! dockfw init                                   # let per-container FORWARD rules decide
//! dockfw add web --source=1.2.3.4 --dport=80    # FORWARD rule into web
//! dockfw add-internal db --source=web --dport=5432
//! dockfw add-two-ways db --source=web --dport=5432
//! dockfw allow web 1.2.3.4 5.6.7.8              # whitelist for web's published ports
//! dockfw ls                                     # rules of every container
//! dockfw replay --dry-run web                   # what a replay would change
//! dockfw start --pull-deps web                  # start web and its dependencies
//! dockfw add web --from rules.txt               # one flag line per rule
//! ```
//!
//! Exit codes: 0 success, 1 action error, 2 usage error, 3 dry-run found
//! pending changes.

use clap::{ArgAction, Args, Parser, Subcommand};
use dockfw::audit::AuditLog;
use dockfw::config::{self, AppConfig};
use dockfw::core::store::StateStore;
use dockfw::docker::DockerRuntime;
use dockfw::iptables::IptablesBackend;
use dockfw::{Error, Protocol, ReplayReport, Result, RuleKind, RuleRequest, Session, validators};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

shadow_rs::shadow!(build);

type DockerSession = Session<DockerRuntime, IptablesBackend>;

/// Exit status of a dry-run that found pending changes
const EXIT_PENDING_CHANGES: u8 = 3;

#[derive(Parser)]
#[command(name = "dockfw")]
#[command(version = build::PKG_VERSION, long_version = build::CLAP_LONG_VERSION)]
#[command(about = "Persistent per-container iptables rules for Docker hosts", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.config/dockfw/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// More logging on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Remove Docker's catch-all FORWARD rule for the bridge
    Init,
    /// Start containers in dependency order, then replay their rules
    Start {
        /// Pause each container right after starting it
        #[arg(long)]
        paused: bool,
        /// Also start dependencies that were not named
        #[arg(long)]
        pull_deps: bool,
        /// Only print the start order
        #[arg(long)]
        dry_run: bool,
        #[arg(required = true, value_parser = parse_container)]
        containers: Vec<String>,
    },
    /// Whitelist addresses for every port the container publishes
    Allow {
        #[arg(value_parser = parse_container)]
        container: String,
        #[arg(required = true, value_name = "ADDRESS")]
        addresses: Vec<String>,
    },
    /// Add a FORWARD rule
    Add(AddArgs),
    /// Add an INPUT rule
    AddInput(AddArgs),
    /// Add a rule for container to container traffic
    AddInternal(AddArgs),
    /// Add an internal rule and make both containers resolve each other
    AddTwoWays(AddArgs),
    /// Print the recorded rules as the commands that recreate them
    Ls {
        #[arg(value_parser = parse_container)]
        containers: Vec<String>,
    },
    /// Save the launch configuration of running containers
    SaveHostconfig {
        /// Store the live port mapping instead of the configured bindings
        #[arg(long)]
        merge_network: bool,
        /// Fail if a saved configuration no longer matches
        #[arg(long)]
        fail_on_change: bool,
        #[arg(required = true, value_parser = parse_container)]
        containers: Vec<String>,
    },
    /// Re-resolve recorded rules and bring iptables in line
    Replay {
        /// Print planned operations and rule diffs without changing anything
        #[arg(long)]
        dry_run: bool,
        #[arg(required = true, value_parser = parse_container)]
        containers: Vec<String>,
    },
    /// Delete and forget every recorded rule of the containers
    Drop {
        #[arg(required = true, value_parser = parse_container)]
        containers: Vec<String>,
    },
}

#[derive(Args)]
struct AddArgs {
    #[arg(value_parser = parse_container)]
    container: String,

    #[command(flatten)]
    rule: RuleArgs,

    /// Accept bridge addresses and map them back to their containers
    #[arg(long)]
    rev_lookup: bool,

    /// Read one flag line per rule from a file, or stdin with '-'
    #[arg(long, value_name = "FILE|-")]
    from: Option<String>,
}

/// Flags describing one rule
#[derive(Args, Debug, Default)]
struct RuleArgs {
    /// Source: '.', '/', container name, IPv4 address or CIDR (mandatory)
    #[arg(short, long)]
    source: Option<String>,

    #[arg(long, value_parser = parse_port)]
    sport: Option<u16>,

    /// Destination [default: .]
    #[arg(short, long)]
    dest: Option<String>,

    /// Destination port, mandatory except for 'add'
    #[arg(long, value_parser = parse_port)]
    dport: Option<u16>,

    /// [default: tcp]
    #[arg(short, long)]
    protocol: Option<Protocol>,

    /// Extra iptables match expression
    #[arg(long)]
    filter: Option<String>,
}

/// One line of a `--from` file
#[derive(Parser)]
#[command(no_binary_name = true)]
struct RuleLine {
    #[command(flatten)]
    rule: RuleArgs,
}

impl RuleArgs {
    fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.sport.is_none()
            && self.dest.is_none()
            && self.dport.is_none()
            && self.protocol.is_none()
            && self.filter.is_none()
    }

    fn into_request(self, reverse_lookup: bool) -> Result<RuleRequest> {
        let source = self
            .source
            .ok_or_else(|| Error::validation("source", "--source is mandatory"))?;

        let mut request = RuleRequest::new(source, self.dest.unwrap_or_else(|| ".".into()))
            .with_source_port(self.sport.unwrap_or(0))
            .with_destination_port(self.dport.unwrap_or(0))
            .with_protocol(self.protocol.unwrap_or_default())
            .with_filter(self.filter.unwrap_or_default());
        request.reverse_lookup = reverse_lookup;
        Ok(request)
    }
}

/// Which `add*` action runs
#[derive(Clone, Copy)]
enum AddAction {
    Rule(RuleKind),
    TwoWays,
}

fn parse_container(s: &str) -> std::result::Result<String, String> {
    validators::validate_container_id(s).map(str::to_string)
}

fn parse_port(s: &str) -> std::result::Result<u16, String> {
    let port = s
        .parse::<u16>()
        .map_err(|_| format!("'{s}' is not a port number"))?;
    validators::validate_port(port)
}

/// Splits a `--from` line on whitespace; double quotes group words and are
/// removed, so `--filter="-i eth0"` stays one argument.
fn split_flags(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;

    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quoted {
        return Err("unterminated quote".to_string());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Parses the body of a `--from` file. Blank lines and `#` comments are
/// skipped.
fn parse_rule_lines(text: &str, reverse_lookup: bool) -> Result<Vec<RuleRequest>> {
    let mut requests = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let at_line = |message: String| Error::validation("from", format!("line {}: {message}", index + 1));
        let words = split_flags(line).map_err(at_line)?;
        let parsed = RuleLine::try_parse_from(words).map_err(|e| {
            at_line(e.to_string().lines().next().unwrap_or_default().to_string())
        })?;
        requests.push(
            parsed
                .rule
                .into_request(reverse_lookup)
                .map_err(|e| at_line(e.to_string()))?,
        );
    }
    Ok(requests)
}

async fn read_from(source: &str) -> Result<String> {
    if source == "-" {
        use tokio::io::AsyncReadExt;

        let mut text = String::new();
        tokio::io::stdin().read_to_string(&mut text).await?;
        Ok(text)
    } else {
        Ok(tokio::fs::read_to_string(source).await?)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn build_session(config: &AppConfig) -> Result<DockerSession> {
    let runtime = DockerRuntime::connect(config.docker_socket.as_deref(), config.docker_timeout_secs)?;
    let backend = IptablesBackend::new(config.iptables_program());
    let session = Session::new(
        runtime,
        backend,
        StateStore::new(config.state_dir.clone()),
        config.bridge_network(),
    );

    if !config.audit_log {
        return Ok(session);
    }
    match dockfw::utils::ensure_dirs().and_then(|()| AuditLog::new()) {
        Ok(audit) => Ok(session.with_audit(audit)),
        Err(e) => {
            warn!("Audit log disabled: {}", e);
            Ok(session)
        }
    }
}

fn print_replay(report: &ReplayReport) {
    for operation in &report.operations {
        println!("{operation}");
    }
    for diff in &report.diffs {
        print!("{}", diff.unified);
    }
}

async fn run_add(session: &mut DockerSession, action: AddAction, args: AddArgs) -> Result<()> {
    let requests = match &args.from {
        Some(source) => {
            if !args.rule.is_empty() {
                return Err(Error::validation(
                    "from",
                    "When using --from, only '--rev-lookup' is allowed",
                ));
            }
            parse_rule_lines(&read_from(source).await?, args.rev_lookup)?
        }
        None => vec![args.rule.into_request(args.rev_lookup)?],
    };

    for request in &requests {
        let outcome = match action {
            AddAction::Rule(kind) => session.add_rule(&args.container, request, kind).await?,
            AddAction::TwoWays => session.add_two_way_sync(&args.container, request).await?,
        };
        if outcome.already_tracked() {
            info!("{} already tracked", outcome.rule);
        }
    }
    Ok(())
}

/// Runs one command; `Ok(true)` means a dry-run found pending changes.
async fn run(command: Commands, config: &AppConfig) -> Result<bool> {
    let mut session = build_session(config)?;

    match command {
        Commands::Init => {
            if session.initialize_firewall().await? {
                println!("Removed FORWARD -o {} -j DOCKER", config.bridge_interface);
            }
        }
        Commands::Start {
            paused,
            pull_deps,
            dry_run,
            containers,
        } => {
            let report = session
                .start_containers(&containers, paused, pull_deps, dry_run)
                .await?;
            if dry_run {
                for name in &report.order {
                    println!("{name}");
                }
            } else {
                info!("Started {}", report.started.join(", "));
            }
        }
        Commands::Allow {
            container,
            addresses,
        } => {
            session.allow_external(&container, &addresses).await?;
        }
        Commands::Add(args) => run_add(&mut session, AddAction::Rule(RuleKind::Forward), args).await?,
        Commands::AddInput(args) => run_add(&mut session, AddAction::Rule(RuleKind::Input), args).await?,
        Commands::AddInternal(args) => {
            run_add(&mut session, AddAction::Rule(RuleKind::Internal), args).await?;
        }
        Commands::AddTwoWays(args) => run_add(&mut session, AddAction::TwoWays, args).await?,
        Commands::Ls { containers } => {
            for listing in session.list_rules(&containers).await? {
                for line in listing.command_lines() {
                    println!("{line}");
                }
            }
        }
        Commands::SaveHostconfig {
            merge_network,
            fail_on_change,
            containers,
        } => {
            session
                .backup_host_config(&containers, merge_network, fail_on_change)
                .await?;
        }
        Commands::Replay {
            dry_run,
            containers,
        } => {
            let report = session.replay(&containers, dry_run).await?;
            if dry_run {
                print_replay(&report);
                return Ok(report.changed);
            }
            for operation in &report.operations {
                info!("{}", operation);
            }
        }
        Commands::Drop { containers } => {
            let dropped = session.drop_rules(&containers).await?;
            info!("Dropped {} rules", dropped);
        }
    }

    Ok(false)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let config = config::load_config(cli.config.as_deref()).await?;
        run(cli.command, &config).await
    });

    match result {
        Ok(false) => ExitCode::SUCCESS,
        Ok(true) => ExitCode::from(EXIT_PENDING_CHANGES),
        Err(e) => {
            if e.is_fatal() {
                eprintln!("Fatal: {}", e.user_message());
            } else {
                eprintln!("Error: {}", e.user_message());
            }
            ExitCode::FAILURE
        }
    }
}
