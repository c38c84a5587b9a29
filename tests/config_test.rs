//! Configuration loading from files and the environment

use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

use crawlnet::config::Config;

const SAMPLE: &str = r#"
cluster = false

[logging]
level = "debug"
format = "json"

[master]
id = "2"
http_address = ":9001"
leader_check_interval_secs = 5
seeds = ["books"]

[worker]
id = "7"
work_count = 3
min_body_len = 100

[fetcher]
timeout_ms = 1500
user_agent = "crawlnet-test"

[[tasks]]
name = "books"
url = "https://book.example.com/tag/"
cookie = "bid=abc"
wait_time_secs = 1
max_depth = 3
limits = [{ event_count = 1, event_dur_secs = 2 }, { event_count = 20, event_dur_secs = 60, bucket = 20 }]

[[tasks]]
name = "groups"
url = "https://www.example.com/group/"
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_from_file() {
    let file = write_config(SAMPLE);
    let config = Config::from_file(file.path()).unwrap();
    config.validate().unwrap();

    assert!(!config.cluster);
    assert_eq!(config.logging.format, "json");
    assert_eq!(config.master.http_address, ":9001");
    assert_eq!(config.worker.work_count, 3);
    // Omitted fields keep their defaults
    assert_eq!(config.worker.service_name, "crawlnet.worker");
    assert_eq!(config.worker.idle_log_secs, 10);
    assert_eq!(config.fetch_timeout(), Duration::from_millis(1500));

    assert_eq!(config.tasks.len(), 2);
    let books = &config.tasks[0];
    assert_eq!(books.cookie, "bid=abc");
    assert_eq!(books.max_depth, 3);
    assert_eq!(books.limits.len(), 2);
    assert_eq!(books.limits[0].bucket, 1);
    assert_eq!(books.limits[1].bucket, 20);

    let groups = &config.tasks[1];
    assert_eq!(groups.max_depth, 5);
    assert!(groups.limits.is_empty());

    assert_eq!(config.seeds(), vec!["books".to_string()]);
    let pool = config.pool_config();
    assert_eq!(pool.min_body_len, 100);
}

#[test]
fn test_empty_file_uses_defaults() {
    let file = write_config("");
    let config = Config::from_file(file.path()).unwrap();
    assert!(config.cluster);
    assert_eq!(config.master.leader_check_interval_secs, 20);
    assert!(config.validate().is_ok());
}

#[test]
fn test_malformed_file_is_rejected() {
    let file = write_config("[worker\nwork_count = ");
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("Failed to parse TOML"));
}

#[test]
fn test_missing_file_is_rejected() {
    let err = Config::from_file(std::path::Path::new("/nonexistent/crawlnet.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_zero_rate_limit_is_invalid() {
    let file = write_config(
        r#"
[[tasks]]
name = "books"
url = "https://book.example.com/"
limits = [{ event_count = 0, event_dur_secs = 1 }]
"#,
    );
    let config = Config::from_file(file.path()).unwrap();
    assert!(config.validate().is_err());
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config(SAMPLE);
    std::env::set_var("CRAWLNET_WORK_COUNT", "9");
    std::env::set_var("CRAWLNET_MASTER_ID", "4");

    let config = Config::load(Some(file.path()));

    std::env::remove_var("CRAWLNET_WORK_COUNT");
    std::env::remove_var("CRAWLNET_MASTER_ID");

    let config = config.unwrap();
    assert_eq!(config.worker.work_count, 9);
    assert_eq!(config.master.id, "4");
}

#[test]
#[serial]
fn test_invalid_environment_value() {
    std::env::set_var("CRAWLNET_WORK_COUNT", "0");
    let result = Config::load(None);
    std::env::remove_var("CRAWLNET_WORK_COUNT");

    let err = result.unwrap_err();
    assert!(err.to_string().contains("work_count"));
}
