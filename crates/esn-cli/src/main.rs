//! Operational CLI for the liveness-and-release core: migrations, config
//! hashing, audit export/verification, and the administrative overrides.

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use esn_db::{PgStore, StateStore};
use esn_schemas::{Observer, PollInterval};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "esn")]
#[command(about = "Eternal Sentinel core CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> local)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Audit log commands
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },

    /// Administrative overrides (audited)
    Admin {
        #[command(subcommand)]
        cmd: AdminCmd,
    },

    /// Create a user with an ACTIVE polling config
    UserCreate {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: String,
        /// WEEKLY | BIWEEKLY | MONTHLY
        #[arg(long, default_value = "MONTHLY")]
        interval: String,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Export a user's audit chain as JSONL (oldest first)
    Export {
        #[arg(long)]
        user: Uuid,
    },
    /// Verify a user's audit hash chain
    Verify {
        #[arg(long)]
        user: Uuid,
    },
}

#[derive(Subcommand)]
enum AdminCmd {
    /// Force a confirmation (resets the escalation ladder)
    ForceCheckin {
        #[arg(long)]
        user: Uuid,
    },
    /// Pause polling for a user
    Pause {
        #[arg(long)]
        user: Uuid,
    },
    /// Resume polling for a user
    Resume {
        #[arg(long)]
        user: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = esn_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = esn_db::status(&pool).await?;
                    println!("db_ok={} has_schema={}", s.ok, s.has_schema);
                }
                DbCmd::Migrate => {
                    esn_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = esn_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Audit { cmd } => {
            let pool = esn_db::connect_from_env().await?;
            let store = PgStore::new(pool);
            match cmd {
                AuditCmd::Export { user } => {
                    let events = store.audit_events_for_user(user).await?;
                    print!("{}", esn_audit::export_jsonl(&events)?);
                }
                AuditCmd::Verify { user } => {
                    let events = store.audit_events_for_user(user).await?;
                    let jsonl = esn_audit::export_jsonl(&events)?;
                    match esn_audit::verify_hash_chain_str(&jsonl)? {
                        esn_audit::VerifyResult::Valid { lines } => {
                            println!("chain_valid=true events={lines}");
                        }
                        esn_audit::VerifyResult::Broken { line, reason } => {
                            println!("chain_valid=false line={line} reason={reason}");
                            bail!("audit chain broken");
                        }
                    }
                }
            }
        }

        Commands::Admin { cmd } => {
            let pool = esn_db::connect_from_env().await?;
            let store = PgStore::new(pool);
            let observer = Observer::system();
            let now = Utc::now();
            match cmd {
                AdminCmd::ForceCheckin { user } => {
                    let cfg = store.admin_force_check_in(user, now, &observer).await?;
                    println!("user_id={user} status={}", cfg.status.as_str());
                }
                AdminCmd::Pause { user } => {
                    let cfg = store.pause_polling(user, now, &observer).await?;
                    println!("user_id={user} status={}", cfg.status.as_str());
                }
                AdminCmd::Resume { user } => {
                    let cfg = store.resume_polling(user, now, &observer).await?;
                    println!(
                        "user_id={user} status={} next_check_in_due={}",
                        cfg.status.as_str(),
                        cfg.next_check_in_due.to_rfc3339()
                    );
                }
            }
        }

        Commands::UserCreate {
            email,
            name,
            interval,
        } => {
            let interval = PollInterval::parse(&interval)?;
            let pool = esn_db::connect_from_env().await?;
            let store = PgStore::new(pool);
            let user = store
                .create_user(
                    esn_db::NewUser {
                        email,
                        display_name: name,
                    },
                    interval,
                    Utc::now(),
                )
                .await?;
            println!("user_id={}", user.id);
            println!("email={}", user.email);
        }
    }

    Ok(())
}
