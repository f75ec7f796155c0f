use tessera::TesseraError;
use tessera::config::{CacheKind, IdStrategy, StoreConfig};
use tessera::construct::Database;
use tessera::persist::PersistenceMode;

#[test]
fn defaults_open_an_in_memory_store() {
    let config = StoreConfig::default();
    assert_eq!(config.database.mode(), PersistenceMode::InMemory);
    assert_eq!(config.cache.kind, CacheKind::Memory);
    assert_eq!(config.identifiers.strategy, IdStrategy::Random);
    assert_eq!(config.identifiers.max_attempts, 16);
    assert_eq!(config.logging.filter, "info");
    let db = Database::from_config(&config).expect("db");
    let object = db.create("thing", false).unwrap();
    assert!(object > 0 && object <= u64::from(u32::MAX));
}

#[test]
fn settings_are_read_from_a_file() {
    let dir = std::env::temp_dir();
    let config_path = dir.join(format!("tessera_config_{}.toml", std::process::id()));
    let database_path = dir.join(format!("tessera_config_{}.db", std::process::id()));
    let _ = std::fs::remove_file(&database_path);
    std::fs::write(
        &config_path,
        format!(
            "[database]\npath = {:?}\n\n[cache]\nkind = \"table\"\n\n[identifiers]\nstrategy = \"sequential\"\nmax_attempts = 3\n\n[logging]\nfilter = \"debug\"\n",
            database_path.to_string_lossy()
        ),
    )
    .expect("write config");

    let config = StoreConfig::load(Some(&*config_path.to_string_lossy())).expect("config");
    assert_eq!(config.cache.kind, CacheKind::Table);
    assert_eq!(config.identifiers.strategy, IdStrategy::Sequential);
    assert_eq!(config.identifiers.max_attempts, 3);
    assert_eq!(config.logging.filter, "debug");
    assert_eq!(
        config.database.mode(),
        PersistenceMode::File(database_path.to_string_lossy().to_string())
    );

    let db = Database::from_config(&config).expect("db");
    assert_eq!(db.create("thing", false).unwrap(), 1);
    db.close().expect("close");

    let _ = std::fs::remove_file(&config_path);
    let _ = std::fs::remove_file(&database_path);
}

#[test]
fn a_missing_file_is_a_config_error() {
    let missing = std::env::temp_dir().join("tessera_no_such_config.toml");
    assert!(matches!(
        StoreConfig::load(Some(&*missing.to_string_lossy())),
        Err(TesseraError::Config(_))
    ));
}
