use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use rootgrow::accounts::{
    authorize_ssh_keys, create_user, lock_unlock_user, set_user_password, AccountBackend, UserSpec,
};
use rootgrow::resize::Platform;
use rootgrow::{check_root, inspect_root, logging, resize_root, ResizeOptions, SystemTools};

const BUILD_TIMESTAMP: u64 = const_parse_u64(env!("BUILD_TIMESTAMP"));
const GIT_HASH: &str = env!("GIT_HASH");

const fn const_parse_u64(s: &str) -> u64 {
    let bytes = s.as_bytes();
    let mut result: u64 = 0;
    let mut i = 0;
    while i < bytes.len() {
        result = result * 10 + (bytes[i] - b'0') as u64;
        i += 1;
    }
    result
}

fn format_build_time() -> String {
    let days = BUILD_TIMESTAMP / 86400;
    let time_of_day = BUILD_TIMESTAMP % 86400;
    let (year, month, day) = civil_from_days(days);

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
        year,
        month,
        day,
        time_of_day / 3600,
        (time_of_day % 3600) / 60,
        time_of_day % 60
    )
}

/// Gregorian date of a day count since 1970-01-01, in 400-year eras
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z % 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}

fn version_long() -> String {
    format!(
        "{} (built {} git:{})",
        env!("CARGO_PKG_VERSION"),
        format_build_time(),
        GIT_HASH
    )
}

#[derive(Parser)]
#[command(name = "rootgrow")]
#[command(author, version, about = "Grow the mounted root filesystem to fill its disk", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct DiscoveryArgs {
    /// Address disk and partition by their /dev paths instead of private device nodes
    #[arg(long)]
    no_device_nodes: bool,

    /// Read the mount table from this file instead of /proc/self/mounts
    #[arg(long, value_name = "PATH")]
    mount_table: Option<PathBuf>,

    /// sysfs mount point
    #[arg(long, value_name = "PATH")]
    sysfs: Option<PathBuf>,
}

impl DiscoveryArgs {
    fn options(self) -> ResizeOptions {
        ResizeOptions::new()
            .device_nodes(!self.no_device_nodes)
            .mount_table(self.mount_table)
            .sysfs(self.sysfs)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show the root partition, its disk's partition table and the resize plan
    Info {
        #[command(flatten)]
        discovery: DiscoveryArgs,
    },

    /// Show detailed version and build information
    Version,

    /// Grow the root partition to the end of its disk and grow the filesystem
    Resize {
        /// Dry run - show what would be done without making changes
        #[arg(short = 'n', long)]
        dry_run: bool,

        #[command(flatten)]
        discovery: DiscoveryArgs,
    },

    /// Replace a user's SSH authorized keys
    AuthorizeKeys {
        /// Account whose authorized_keys is written
        #[arg(short, long, default_value = "root")]
        user: String,

        /// Read additional keys from this file, one per line
        #[arg(short = 'f', long, value_name = "PATH")]
        keys_file: Option<PathBuf>,

        /// Public keys
        keys: Vec<String>,
    },

    /// Create an OS user account
    CreateUser {
        name: String,

        /// Comment (GECOS) field
        #[arg(short = 'c', long)]
        gecos: Option<String>,

        /// Home directory
        #[arg(short = 'd', long)]
        home: Option<String>,

        /// Do not create the home directory
        #[arg(long)]
        no_create_home: bool,

        /// Primary group
        #[arg(short = 'g', long)]
        primary_group: Option<String>,

        /// Supplementary groups
        #[arg(short = 'G', long, value_delimiter = ',')]
        groups: Vec<String>,

        /// Login shell
        #[arg(short, long)]
        shell: Option<String>,

        /// Already-hashed password to set
        #[arg(long, value_name = "HASH")]
        password_hash: Option<String>,

        /// Lock the account's password
        #[arg(long, conflicts_with = "unlock")]
        lock: bool,

        /// Unlock the account's password
        #[arg(long)]
        unlock: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Info { discovery } => {
            let report = inspect_root(&discovery.options())
                .context("Failed to inspect the root filesystem")?;
            println!("{}", report);
        }

        Commands::Version => {
            println!("rootgrow {}", version_long());
        }

        Commands::Resize { dry_run, discovery } => {
            if !check_root() && !dry_run {
                eprintln!("Warning: This tool requires root privileges to modify block devices.");
                eprintln!("         Use --dry-run to preview changes without root.");
            }

            if dry_run {
                println!("DRY RUN MODE - No changes will be made");
                println!();
            }

            let options = discovery.options().dry_run(dry_run);
            let report = match resize_root(&options) {
                Ok(report) => report,
                Err(failure) => {
                    print_operations(&failure.operations);
                    return Err(failure).context("Failed to grow the root filesystem");
                }
            };

            if cli.verbose || dry_run {
                println!("{}", report);
            }
            println!(
                "Resize {}!",
                if dry_run {
                    "preview complete"
                } else {
                    "complete"
                }
            );
            print_operations(&report.operations);
        }

        Commands::AuthorizeKeys {
            user,
            keys_file,
            mut keys,
        } => {
            if let Some(path) = keys_file {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read keys from {}", path.display()))?;
                keys.extend(text.lines().map(str::to_string));
            }
            if keys.iter().all(|k| k.trim().is_empty()) {
                anyhow::bail!("No keys given");
            }
            let path = authorize_ssh_keys(Path::new("/"), &user, &keys)
                .with_context(|| format!("Failed to authorize keys for {}", user))?;
            println!("Wrote {}", path.display());
        }

        Commands::CreateUser {
            name,
            gecos,
            home,
            no_create_home,
            primary_group,
            groups,
            shell,
            password_hash,
            lock,
            unlock,
        } => {
            let backend = AccountBackend::for_platform(Platform::detect())?;
            let tools = SystemTools;
            let spec = UserSpec {
                name,
                gecos,
                homedir: home,
                no_create_home,
                primary_group,
                groups,
                shell,
            };

            create_user(&tools, backend, &spec)
                .with_context(|| format!("Failed to create user {}", spec.name))?;
            if let Some(hash) = password_hash {
                set_user_password(&tools, backend, &spec.name, &hash)
                    .with_context(|| format!("Failed to set password of {}", spec.name))?;
            }
            if lock || unlock {
                lock_unlock_user(&tools, backend, &spec.name, lock)
                    .with_context(|| format!("Failed to change lock state of {}", spec.name))?;
            }
            println!("User {} created", spec.name);
        }
    }

    Ok(())
}

fn print_operations(operations: &[String]) {
    if operations.is_empty() {
        return;
    }
    println!();
    println!("Operations performed:");
    for op in operations {
        println!("  - {}", op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_civil_from_days() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(59), (1970, 3, 1));
        assert_eq!(civil_from_days(11_016), (2000, 2, 29));
        assert_eq!(civil_from_days(20_089), (2025, 1, 1));
    }

    #[test]
    fn test_cli_parses_resize_flags() {
        let cli = Cli::try_parse_from([
            "rootgrow",
            "resize",
            "--dry-run",
            "--no-device-nodes",
            "--mount-table",
            "/tmp/mounts",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Resize { dry_run, discovery } => {
                assert!(dry_run);
                let options = discovery.options();
                assert!(!options.platform.device_nodes);
                assert_eq!(
                    options.platform.mount_table,
                    Some(PathBuf::from("/tmp/mounts"))
                );
            }
            _ => panic!("expected resize"),
        }
    }

    #[test]
    fn test_cli_lock_conflicts_with_unlock() {
        assert!(Cli::try_parse_from(["rootgrow", "create-user", "core", "--lock", "--unlock"]).is_err());
    }
}
