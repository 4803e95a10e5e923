use clap::Parser;
use kvstate_migrate::adapters::host::HostProbe;
use kvstate_migrate::adapters::telemetry_file::{reset_storage_json, TelemetryReset};
use kvstate_migrate::core::identity::IdentityGenerator;
use kvstate_migrate::utils::{logger, validation::Validate};
use kvstate_migrate::{
    CliConfig, FileSnapshotStore, MigrationConfig, MigrationError, MigrationOrchestrator,
    MigrationReport, TracingAuditSink,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliConfig::parse();

    // 初始化日誌
    if cli.json_logs {
        logger::init_json_logger(cli.verbose);
    } else {
        logger::init_cli_logger(cli.verbose);
    }

    tracing::info!("Starting kvstate-migrate");
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    if let Err(e) = cli.validate() {
        fail(&e);
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => fail(&e),
    };

    if !cli.force {
        let running = HostProbe::new(&config.host.process_names).running();
        if !running.is_empty() {
            for process in &running {
                tracing::error!("Host application running: {} (pid {})", process.name, process.pid);
            }
            eprintln!("❌ Close the host application first, or pass --force");
            std::process::exit(2);
        }
    }

    let backup_dir = cli
        .backup_dir
        .clone()
        .or_else(|| config.backup.directory.clone().map(Into::into));
    let snapshots = match &backup_dir {
        Some(dir) => FileSnapshotStore::new(dir),
        None => FileSnapshotStore::beside(&cli.db),
    };

    let options = cli.run_options();
    let mut orchestrator = match MigrationOrchestrator::new(config, snapshots, TracingAuditSink) {
        Ok(orchestrator) => orchestrator,
        Err(e) => fail(&e),
    };

    let report = match orchestrator.run(&cli.db, &options).await {
        Ok(report) => report,
        Err(e) => fail(&e),
    };
    print_summary(&report);

    if let Some(storage_json) = &cli.storage_json {
        let preview = cli.dry_run || !report.committed;
        let snapshots = match &backup_dir {
            Some(dir) => FileSnapshotStore::new(dir),
            None => FileSnapshotStore::beside(storage_json),
        };
        match reset_storage_json(storage_json, &snapshots, &mut IdentityGenerator::new(), preview) {
            Ok(reset) => print_telemetry(&reset),
            Err(e) => fail(&e),
        }
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if !report.validation_ok() {
        eprintln!("❌ Validation failed");
        std::process::exit(1);
    }

    Ok(())
}

fn load_config(cli: &CliConfig) -> kvstate_migrate::Result<MigrationConfig> {
    let config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            MigrationConfig::from_file(path)?
        }
        None => MigrationConfig::builtin()?,
    };
    config.validate()?;
    Ok(config)
}

fn fail(e: &MigrationError) -> ! {
    tracing::error!(
        "❌ Migration failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());
    std::process::exit(e.exit_code());
}

fn print_summary(report: &MigrationReport) {
    println!("📊 Mode: {}{}", report.mode, if report.dry_run { " (dry run)" } else { "" });
    println!(
        "   extracted {} (scanned {}), transformed {}, rules applied {}",
        report.extracted, report.scanned, report.transformed, report.rules_applied
    );
    if report.committed {
        println!(
            "   deleted {} (purged {}), inserted {}, conflicts {}, failed {} in {} batches",
            report.deleted,
            report.purged,
            report.insert.inserted,
            report.insert.conflicts,
            report.insert.failed,
            report.batches
        );
    }
    if let Some(backup) = &report.backup_id {
        println!("   backup: {}", backup);
    }
    for change in &report.changes {
        if change.deleted {
            println!("   {} -> (deleted) [{}]", change.original_key, change.rules.join(", "));
        } else {
            println!("   {} -> {} [{}]", change.original_key, change.key, change.rules.join(", "));
        }
    }
    for record in &report.preview {
        println!("   {} = {}", record.key, truncate(&record.value, 80));
    }
    if let Some(validation) = &report.validation {
        println!(
            "   validation: {} passed, {} failed, {} warnings",
            validation.passed,
            validation.failed,
            validation.warnings.len()
        );
        for result in &validation.results {
            println!("     {:?} {}: {}", result.outcome, result.name, result.message);
        }
    }
    if report.committed {
        println!("✅ Migration committed in {}ms", report.duration_ms);
    } else {
        println!("✅ Finished in {}ms, no changes written", report.duration_ms);
    }
}

fn print_telemetry(reset: &TelemetryReset) {
    let verb = if reset.written { "updated" } else { "would update" };
    println!("📁 {} {}", verb, reset.path.display());
    for change in &reset.changes {
        println!(
            "   {}: {} -> {}",
            change.field,
            change.old.as_deref().unwrap_or("(missing)"),
            change.new
        );
    }
}

fn truncate(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &value[..idx]),
        None => value.to_string(),
    }
}
