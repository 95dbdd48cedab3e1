use std::time::Duration;

use keyrouter::config::load_config;
use keyrouter::{Config, HandlerMode};

#[test]
fn load_config_matches_toml() {
    let cfg: Config = load_config("keyrouter.toml").expect("failed to load config");

    assert_eq!(cfg.work_manager.max_workers, 8);
    assert_eq!(cfg.work_manager.max_buffered_items, 50_000);
    assert_eq!(cfg.work_manager.yield_queue_after, 16);
    assert_eq!(
        cfg.work_manager.remove_empty_queue_after(),
        Duration::from_secs(60)
    );
    assert_eq!(cfg.work_manager.handler_mode, HandlerMode::PerQueue);
    assert_eq!(
        cfg.work_manager.uncontended_dequeue_timeout(),
        Duration::from_millis(250)
    );

    assert_eq!(cfg.journal.path.as_deref(), Some("./data/keyrouter.journal"));
    assert_eq!(cfg.journal.fsync_every_n, Some(128));
    let journal = cfg.journal.journal_config();
    assert_eq!(journal.fsync_interval, Some(Duration::from_secs(1)));
    assert_eq!(journal.channel_capacity, 2048);
    assert_eq!(cfg.journal.store_config().lock_timeout, Duration::from_secs(4));
}

#[test]
fn loaded_config_passes_validation() {
    let cfg = load_config("keyrouter.toml").expect("failed to load config");
    let validated = cfg.work_manager.clone().validated().expect("invalid config");
    assert_eq!(validated.max_workers, 8);
}

#[test]
fn missing_file_is_an_error() {
    assert!(load_config("does-not-exist.toml").is_err());
}
