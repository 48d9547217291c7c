use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use sqlx::SqlitePool;
use tracing::{error, info};

use tenant_ledger::audit::verify::find_tampered_records;
use tenant_ledger::audit::{verify::verify_linkage, AuditRecord};
use tenant_ledger::database::{Database, Queries};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let matches = Command::new("verify-audit-log")
        .version("1.0.0")
        .about("Verify tenant audit chain integrity")
        .arg(
            Arg::new("database-url")
                .short('d')
                .long("database-url")
                .value_name("URL")
                .env("DATABASE_URL")
                .help("Chain store to verify")
                .required(true),
        )
        .arg(
            Arg::new("tenant")
                .short('t')
                .long("tenant")
                .value_name("SLUG")
                .help("Verify a single tenant")
                .conflicts_with("all"),
        )
        .arg(
            Arg::new("all")
                .short('a')
                .long("all")
                .action(ArgAction::SetTrue)
                .help("Verify every tenant in the store"),
        )
        .arg(
            Arg::new("deep")
                .long("deep")
                .action(ArgAction::SetTrue)
                .help("Also recompute every stored hash"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let database_url = matches
        .get_one::<String>("database-url")
        .ok_or_else(|| anyhow!("--database-url is required"))?;
    let tenant = matches.get_one::<String>("tenant");
    let all = matches.get_flag("all");
    let deep = matches.get_flag("deep");
    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    // Set log level based on flags
    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let database = Database::new(database_url).await?;
    let pool = database.pool();

    let tenants = match (tenant, all) {
        (Some(tenant), _) => vec![tenant.clone()],
        (None, true) => Queries::tenants(pool).await?,
        (None, false) => return Err(anyhow!("Pass --tenant <SLUG> or --all")),
    };

    if tenants.is_empty() {
        return Err(anyhow!("Chain store has no tenants"));
    }

    let mut failed = 0;
    for tenant_slug in &tenants {
        if let Err(e) = verify_tenant(pool, tenant_slug, deep, verbose).await {
            error!("Tenant {} failed verification: {}", tenant_slug, e);
            failed += 1;
        }
    }

    if failed > 0 {
        error!("{} of {} tenants failed verification", failed, tenants.len());
        std::process::exit(1);
    }

    if !quiet {
        println!("✓ Verified {} tenant chains", tenants.len());
    }

    Ok(())
}

async fn verify_tenant(pool: &SqlitePool, tenant_slug: &str, deep: bool, verbose: bool) -> Result<()> {
    info!("Verifying audit chain of {}", tenant_slug);

    let records = Queries::tenant_chain(pool, tenant_slug).await?;
    if records.is_empty() {
        return Err(anyhow!("No audit records for tenant {}", tenant_slug));
    }

    let report = verify_linkage(tenant_slug, &records);
    if !report.is_valid {
        return Err(anyhow!(report.summary()));
    }

    if verbose {
        println!("✓ {}", report.summary());
    }

    if deep {
        info!("Recomputing stored hashes of {}", tenant_slug);
        let tampered = find_tampered_records(&records);
        if !tampered.is_empty() {
            for violation in &tampered {
                error!(
                    "Record {} ({}) was modified: stored hash {}, fields hash to {}",
                    violation.sequence_number, violation.record_id, violation.actual, violation.expected
                );
            }
            return Err(anyhow!("{} tampered records", tampered.len()));
        }

        if verbose {
            println!("✓ Every stored hash matches its record");
        }
    }

    if verbose {
        print_summary(&records);
    }

    Ok(())
}

fn print_summary(records: &[AuditRecord]) {
    let (Some(first), Some(last)) = (records.first(), records.last()) else {
        return;
    };

    let alerts = records.iter().filter(|r| r.is_security_alert()).count();
    println!("\nAudit Chain Summary:");
    println!("  Total entries: {}", records.len());
    println!("  Security alerts: {}", alerts);
    println!("  First entry: {}", first.timestamp);
    println!("  Last entry: {}", last.timestamp);
    println!(
        "  Head hash: {}",
        last.record_hash.as_deref().unwrap_or("(pending backfill)")
    );
}
