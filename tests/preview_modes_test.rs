mod common;

use common::*;
use kvstate_migrate::core::store::file_digest;
use kvstate_migrate::domain::model::{CheckName, CheckOutcome};
use kvstate_migrate::{MigrationError, MigrationMode, Phase, RunOptions};
use tempfile::TempDir;

#[tokio::test]
async fn test_dry_run_never_writes() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = seed_db(dir.path(), &TELEMETRY_ROWS);
    let before = file_digest(&db)?;
    let backups = dir.path().join("backups");
    let (mut orchestrator, audit) = orchestrator(quiet_config(), &backups);

    let options = RunOptions {
        dry_run: true,
        ..RunOptions::new(MigrationMode::Full)
    };
    let report = orchestrator.run(&db, &options).await?;

    assert_eq!(report.extracted, 5);
    assert_eq!(report.transformed, 5);
    assert_eq!(report.changes.len(), 5);
    assert!(!report.committed);
    assert!(report.backup_id.is_none());
    assert!(report.transaction_id.is_none());
    assert_eq!(file_digest(&db)?, before);
    assert!(!backups.exists());

    let phases: Vec<Phase> = audit.events().iter().map(|e| e.phase).collect();
    assert_eq!(phases, vec![Phase::Extract, Phase::Transform]);

    let correlated = report
        .changes
        .iter()
        .find(|c| c.original_key == "machineId:legacy-7f3a")
        .expect("preview lists the correlated row");
    let new_id = correlated.key.trim_start_matches("machineId:");
    assert!(correlated.new_value.contains(new_id));
    assert_eq!(correlated.rules, vec!["machine-id".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_extract_only_honours_limit() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = seed_db(dir.path(), &TELEMETRY_ROWS);
    let (mut orchestrator, _) = orchestrator(quiet_config(), &dir.path().join("backups"));

    let options = RunOptions {
        limit: Some(2),
        ..RunOptions::new(MigrationMode::ExtractOnly)
    };
    let report = orchestrator.run(&db, &options).await?;

    assert_eq!(report.extracted, 2);
    assert_eq!(report.preview.len(), 2);
    assert_eq!(report.preview[0].key, "telemetry.machineId");
    assert_eq!(report.transformed, 0);
    assert!(report.changes.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_transform_only_reports_changes() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = seed_db(dir.path(), &TELEMETRY_ROWS);
    let before = file_digest(&db)?;
    let mut config = quiet_config();
    config.migration.preview_limit = 3;
    let (mut orchestrator, _) = orchestrator(config, &dir.path().join("backups"));

    let report = orchestrator
        .run(&db, &RunOptions::new(MigrationMode::TransformOnly))
        .await?;

    assert_eq!(report.transformed, 5);
    assert_eq!(report.rules_applied, 5);
    assert_eq!(report.changes.len(), 3);
    assert_eq!(file_digest(&db)?, before);
    Ok(())
}

#[tokio::test]
async fn test_custom_query_goes_through_sanitizer() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = seed_db(dir.path(), &TELEMETRY_ROWS);
    let before = file_digest(&db)?;
    let (mut orchestrator, audit) = orchestrator(quiet_config(), &dir.path().join("backups"));

    for unsafe_query in [
        "SELECT * FROM ItemTable; DROP TABLE ItemTable;",
        "UPDATE ItemTable SET value = 1",
    ] {
        let options = RunOptions {
            query: Some(unsafe_query.to_string()),
            ..RunOptions::new(MigrationMode::Full)
        };
        let err = orchestrator.run(&db, &options).await.unwrap_err();
        assert!(matches!(err, MigrationError::UnsafeQuery { .. }), "{unsafe_query}");
        assert_eq!(err.exit_code(), 2);
    }
    assert!(audit.events().is_empty());
    assert_eq!(file_digest(&db)?, before);

    let options = RunOptions {
        query: Some("select key, value from ItemTable limit 5".to_string()),
        ..RunOptions::new(MigrationMode::ExtractOnly)
    };
    let report = orchestrator.run(&db, &options).await?;
    assert_eq!(report.extracted, 5);
    Ok(())
}

#[tokio::test]
async fn test_validate_only_on_healthy_store() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = seed_db(dir.path(), &TELEMETRY_ROWS);
    let (mut orchestrator, _) = orchestrator(quiet_config(), &dir.path().join("backups"));
    orchestrator
        .run(&db, &RunOptions::new(MigrationMode::Full))
        .await?;

    let report = orchestrator
        .run(&db, &RunOptions::new(MigrationMode::ValidateOnly))
        .await?;

    let validation = report.validation.as_ref().expect("validation report");
    assert!(report.validation_ok());
    assert_eq!(validation.checks_run.len(), 6);
    assert!(!report.committed);
    Ok(())
}

#[tokio::test]
async fn test_validate_only_fails_on_unmigrated_store() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = seed_db(dir.path(), &TELEMETRY_ROWS);
    let before = file_digest(&db)?;
    let (mut orchestrator, _) = orchestrator(quiet_config(), &dir.path().join("backups"));

    let report = orchestrator
        .run(&db, &RunOptions::new(MigrationMode::ValidateOnly))
        .await?;

    assert!(!report.validation_ok());
    let validation = report.validation.expect("validation report");
    let accuracy = validation
        .result(CheckName::TransformationAccuracy)
        .expect("accuracy check");
    assert_eq!(accuracy.outcome, CheckOutcome::Failed);
    assert!(accuracy.message.contains("telemetry.machineId"), "{}", accuracy.message);
    assert_eq!(file_digest(&db)?, before);
    Ok(())
}

#[tokio::test]
async fn test_validate_only_flags_malformed_json() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = seed_db(
        dir.path(),
        &[
            ("a", r#"{"ok":true}"#),
            ("b", r#"{"broken": }"#),
            ("c", "[1, 2,]"),
            ("d", "plain"),
        ],
    );
    let (mut orchestrator, _) = orchestrator(quiet_config(), &dir.path().join("backups"));

    let report = orchestrator
        .run(&db, &RunOptions::new(MigrationMode::ValidateOnly))
        .await?;

    assert!(!report.validation_ok());
    let validation = report.validation.expect("validation report");
    assert_eq!(
        validation.result(CheckName::DataFormat).map(|r| r.outcome),
        Some(CheckOutcome::Failed)
    );
    Ok(())
}

#[tokio::test]
async fn test_missing_database_is_usage_error() {
    let dir = TempDir::new().unwrap();
    let (mut orchestrator, _) = orchestrator(quiet_config(), &dir.path().join("backups"));

    let err = orchestrator
        .run(
            &dir.path().join("missing.vscdb"),
            &RunOptions::new(MigrationMode::Full),
        )
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 2);
}
