//! unifs command line.
//!
//! Every command takes locators: `sftp://amy@build-box/var/log`,
//! `gdrive://work/My Drive/notes.txt`, `tar:///tmp/src.tar!/README`, or a
//! plain local path.
//!
//! Usage:
//!   unifs ls -l sftp://amy@build-box/var/log
//!   unifs cat 'tar:///tmp/src.tar!/README'
//!   echo hi | unifs put gdrive://work/My\ Drive/hi.txt
//!   unifs search /var/log --name '*.log' --depth 2 --size gt,10,MB
//!   unifs drive-login work

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use unifs_vfs::backends::gdrive::OAuthDriveDialer;
use unifs_vfs::backends::sftp::SftpAdapter;
use unifs_vfs::node::{copy_file, move_file};
use unifs_vfs::search::{SearchDepth, SearchEvent, SearchJob, SearchQuery, SizeClause};
use unifs_vfs::{FileNode, Locator, NodeRef, ProtocolRegistry, VfsConfig};

/// Redirect for the installed-app OAuth flow; the code shows up in the
/// browser's address bar.
const DRIVE_REDIRECT_URI: &str = "http://localhost";

#[derive(Parser, Debug)]
#[command(name = "unifs")]
#[command(about = "One file interface over local disks, SFTP, Google Drive, TAR archives and searches")]
struct Args {
    /// Config file (default: <config_dir>/unifs/config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory
    Ls {
        location: String,
        /// Show permissions, size and modification time
        #[arg(short, long)]
        long: bool,
        /// Include hidden entries
        #[arg(short, long)]
        all: bool,
    },
    /// Show a file's attributes
    Stat { location: String },
    /// Write a file to stdout
    Cat { location: String },
    /// Write stdin (or a local file) to a location
    Put {
        location: String,
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// Create a directory
    Mkdir { location: String },
    /// Delete a file or directory
    Rm { location: String },
    /// Move or rename; falls back to copy and delete across backends
    Mv { source: String, target: String },
    /// Change permission bits, e.g. `chmod 640 sftp://host/f`
    Chmod { mode: String, location: String },
    /// Search a tree
    Search(SearchArgs),
    /// List registered schemes
    Schemes,
    /// Authorize a Google Drive account and store its token
    DriveLogin {
        /// Host part of gdrive:// locators for this account
        account: String,
    },
}

#[derive(clap::Args, Debug)]
struct SearchArgs {
    root: String,
    /// Name pattern: substring, glob when it has `*?[`, regex with --regex
    #[arg(long, default_value = "")]
    name: String,
    #[arg(long)]
    case_sensitive: bool,
    #[arg(long)]
    regex: bool,
    /// Only files containing this text
    #[arg(long)]
    text: Option<String>,
    #[arg(long)]
    whole_words: bool,
    /// Size clause `relation,value,unit`, e.g. `gt,10,kB`; repeatable
    #[arg(long = "size")]
    sizes: Vec<SizeClause>,
    /// Levels to list; 0 is unlimited
    #[arg(long, default_value_t = 0)]
    depth: u32,
    #[arg(long)]
    threads: Option<usize>,
    /// Descend into hidden directories
    #[arg(long)]
    hidden: bool,
    /// Descend into TAR archives
    #[arg(long)]
    archives: bool,
    /// Follow symlinked directories
    #[arg(long)]
    symlinks: bool,
    /// Print the equivalent search:// locator instead of running
    #[arg(long)]
    url: bool,
}

impl SearchArgs {
    fn query(&self, target_scheme: &str) -> SearchQuery {
        SearchQuery {
            keyword: self.name.clone(),
            case_sensitive: self.case_sensitive,
            regex: self.regex,
            in_hidden: self.hidden,
            in_archives: self.archives,
            in_symlinks: self.symlinks,
            depth: SearchDepth::from_encoded(self.depth),
            threads: self.threads,
            text: self.text.clone(),
            text_whole_words: self.whole_words,
            sizes: self.sizes.clone(),
            target_scheme: target_scheme.to_string(),
            ..SearchQuery::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _telemetry = unifs_telemetry::init("unifs", args.verbose);

    let config = VfsConfig::load(args.config.as_deref()).context("loading config")?;
    let registry = ProtocolRegistry::with_defaults(config.clone());
    // Keep a handle on the SFTP adapter so its pool can be swept and closed.
    let sftp = Arc::new(SftpAdapter::new(&config));
    registry.register("sftp", sftp.clone());

    let cancel = CancellationToken::new();
    let keep_alive = sftp.spawn_keep_alive(cancel.clone());

    let result = run(&registry, &config, args.command).await;

    cancel.cancel();
    let _ = keep_alive.await;
    sftp.pool().close_all().await;
    result
}

async fn run(registry: &Arc<ProtocolRegistry>, config: &VfsConfig, command: Command) -> Result<()> {
    match command {
        Command::Ls { location, long, all } => cmd_ls(registry, &location, long, all).await,
        Command::Stat { location } => cmd_stat(registry, &location).await,
        Command::Cat { location } => {
            let node = resolve(registry, &location)?;
            let mut reader = node.input_stream().await?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut reader, &mut stdout).await?;
            stdout.flush().await?;
            Ok(())
        }
        Command::Put { location, from } => cmd_put(registry, &location, from.as_deref()).await,
        Command::Mkdir { location } => Ok(resolve(registry, &location)?.mkdir().await?),
        Command::Rm { location } => Ok(resolve(registry, &location)?.delete().await?),
        Command::Mv { source, target } => cmd_mv(registry, &source, &target).await,
        Command::Chmod { mode, location } => {
            let bits = u32::from_str_radix(&mode, 8)
                .with_context(|| format!("mode {mode:?} is not octal"))?;
            if bits > 0o777 {
                bail!("mode {mode:?} has bits outside rwxrwxrwx");
            }
            Ok(resolve(registry, &location)?.change_permissions(bits).await?)
        }
        Command::Search(search) => cmd_search(registry, config, &search).await,
        Command::Schemes => {
            for scheme in registry.schemes() {
                println!("{scheme}");
            }
            Ok(())
        }
        Command::DriveLogin { account } => cmd_drive_login(config, &account).await,
    }
}

/// Locators parse as-is; anything without a scheme is a local path.
fn locate(input: &str) -> Result<Locator> {
    if input.contains("://") {
        return Ok(Locator::parse(input)?);
    }
    let path = std::path::absolute(input).with_context(|| format!("bad path {input:?}"))?;
    Ok(Locator::from_local_path(&path))
}

fn resolve(registry: &Arc<ProtocolRegistry>, input: &str) -> Result<NodeRef> {
    Ok(registry.resolve(&locate(input)?)?)
}

fn format_time(time: Option<SystemTime>) -> String {
    time.map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".repeat(16))
}

async fn cmd_ls(registry: &Arc<ProtocolRegistry>, input: &str, long: bool, all: bool) -> Result<()> {
    let node = resolve(registry, input)?;
    let dir = registry
        .as_browsable(node.clone())
        .await?
        .with_context(|| format!("{} is not a directory", node.locator().redacted()))?;

    let mut children = dir.list().await?;
    children.retain(|c| all || !unifs_vfs::node::is_hidden(c.as_ref()));
    children.sort_by(|a, b| a.locator().name().cmp(b.locator().name()));

    for child in children {
        let attrs = child.attributes().await?;
        let suffix = if attrs.is_directory { "/" } else { "" };
        let name = child.locator().name();
        if long {
            let kind = match (attrs.is_symlink, attrs.is_directory) {
                (true, _) => 'l',
                (false, true) => 'd',
                (false, false) => '-',
            };
            println!(
                "{kind}{} {:>12} {} {name}{suffix}",
                attrs.permissions,
                attrs.size,
                format_time(attrs.modified),
            );
        } else {
            println!("{name}{suffix}");
        }
    }
    Ok(())
}

async fn cmd_stat(registry: &Arc<ProtocolRegistry>, input: &str) -> Result<()> {
    let node = resolve(registry, input)?;
    let attrs = node.attributes().await?;
    println!("locator:     {}", node.locator().redacted());
    if !attrs.exists {
        println!("exists:      no");
        return Ok(());
    }
    let kind = if attrs.is_directory { "directory" } else { "file" };
    println!("type:        {kind}{}", if attrs.is_symlink { " (symlink)" } else { "" });
    println!("size:        {}", attrs.size);
    println!("modified:    {}", format_time(attrs.modified));
    println!("permissions: {}", attrs.permissions);
    println!("owner:       {}", attrs.owner.as_deref().unwrap_or("-"));
    println!("group:       {}", attrs.group.as_deref().unwrap_or("-"));
    if attrs.is_symlink {
        println!("target:      {}", node.canonical().await?.redacted());
    }
    Ok(())
}

async fn cmd_put(registry: &Arc<ProtocolRegistry>, input: &str, from: Option<&Path>) -> Result<()> {
    let node = resolve(registry, input)?;
    let written = match from {
        Some(path) => {
            let source = registry.resolve(&Locator::from_local_path(&std::path::absolute(path)?))?;
            copy_file(source.as_ref(), node.as_ref()).await?
        }
        None => {
            let mut writer = node.output_stream().await?;
            let n = tokio::io::copy(&mut tokio::io::stdin(), &mut writer).await?;
            // Remote writers commit on shutdown.
            writer.shutdown().await?;
            node.attribute_cache().invalidate();
            n
        }
    };
    tracing::info!(locator = %node.locator().redacted(), bytes = written, "written");
    Ok(())
}

async fn cmd_mv(registry: &Arc<ProtocolRegistry>, source: &str, target: &str) -> Result<()> {
    let src = resolve(registry, source)?;
    let mut dst = resolve(registry, target)?;
    if dst.is_directory().await? {
        dst = registry.resolve(&dst.locator().child(src.locator().name()))?;
    }
    move_file(src.as_ref(), dst.as_ref()).await?;
    Ok(())
}

async fn cmd_search(registry: &Arc<ProtocolRegistry>, config: &VfsConfig, args: &SearchArgs) -> Result<()> {
    let root = locate(&args.root)?;
    let query = args.query(root.scheme());
    if args.url {
        println!("{}", query.to_locator(&root));
        return Ok(());
    }

    let entry = registry.resolve(&root)?;
    let job = Arc::new(
        SearchJob::builder([entry])
            .matcher(query.filter(config.search.max_text_bytes)?)
            .browser(query.browser())
            .depth(query.depth)
            .threads(query.threads.unwrap_or(config.search.default_threads))
            .registry(registry.clone())
            .build(),
    );
    let mut events = job.subscribe();
    let task = job.spawn();

    let results = job.results();
    let mut printed = 0;
    loop {
        match events.recv().await {
            Ok(SearchEvent::Matched { .. }) => {
                let snapshot = results.snapshot();
                for hit in &snapshot[printed..] {
                    println!("{}", hit.locator().redacted());
                }
                printed = snapshot.len();
            }
            Ok(SearchEvent::LevelCompleted { level, frontier }) => {
                tracing::debug!(level, frontier, "level done");
            }
            Ok(SearchEvent::Finished { .. }) | Err(RecvError::Closed) => break,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "search events lagged");
            }
        }
    }

    let results = task.await.context("search task failed")?;
    for hit in &results.snapshot()[printed..] {
        println!("{}", hit.locator().redacted());
    }
    tracing::info!(matches = results.len(), "search finished");
    Ok(())
}

async fn cmd_drive_login(config: &VfsConfig, account: &str) -> Result<()> {
    let dialer = OAuthDriveDialer::new(&config.gdrive);
    let url = dialer.oauth().authorize_url(DRIVE_REDIRECT_URI)?;
    eprintln!("Open this page, grant access, then paste the `code` parameter of the page you land on:\n\n  {url}\n");
    eprint!("code: ");

    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    let code = line.trim();
    if code.is_empty() {
        bail!("no authorization code given");
    }

    let token = dialer.oauth().exchange_code(code, DRIVE_REDIRECT_URI).await?;
    dialer.store().save(account, &token).await?;
    eprintln!("stored credentials in {}", dialer.store().path_for(account).display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schemes_parse_and_paths_become_files() {
        assert_eq!(locate("sftp://amy@box/tmp").unwrap().scheme(), "sftp");
        let local = locate("relative/file.txt").unwrap();
        assert_eq!(local.scheme(), "file");
        assert!(local.path().ends_with("/relative/file.txt"));
    }

    #[test]
    fn search_flags_build_the_query() {
        let args = Args::parse_from([
            "unifs", "search", "/var/log", "--name", "*.log", "--depth", "2", "--size", "gt,10,kB",
            "--hidden",
        ]);
        let Command::Search(search) = args.command else {
            panic!("expected search");
        };
        let query = search.query("file");
        assert_eq!(query.keyword, "*.log");
        assert_eq!(query.depth, SearchDepth::Levels(2));
        assert_eq!(query.sizes.len(), 1);
        assert!(query.in_hidden);
        assert!(query.in_subfolders);
    }
}
