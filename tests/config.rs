use tempfile::TempDir;

fn test_runtime(database_dsn: String) -> chatgate::app::RuntimeConfig {
    chatgate::app::RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        database_dsn,
        ..chatgate::app::RuntimeConfig::default()
    }
}

#[tokio::test]
async fn sqlite_file_created_for_runtime_dsn() {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("data").join("chatgate.db");
    assert!(!db_path.exists());

    let runtime = test_runtime(format!("sqlite://{}", db_path.display()));
    let _state = chatgate::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");

    assert!(db_path.exists());
}

#[tokio::test]
async fn sqlite_memory_dsn_starts_without_files() {
    let runtime = test_runtime("sqlite::memory:".to_string());
    let _state = chatgate::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");
}

#[tokio::test]
async fn unusable_dsn_fails_state_load() {
    let runtime = test_runtime("postgres://nowhere".to_string());
    let err = chatgate::app::load_state_with_runtime(runtime)
        .await
        .err()
        .expect("load should fail");
    assert_eq!(err.code, "usage_store_init_failed");
}
