use super::*;
use once_cell::sync::Lazy;
use std::sync::Mutex;

// Environment variables are process-global; serialize the tests that
// mutate them.
static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const ALL_KEYS: &[&str] = &[
    "MAILRECV_LISTEN_IP",
    "MAILRECV_LISTEN_PORT",
    "MAILRECV_RECEIVE_TIMEOUT_MS",
    "MAILRECV_HOST_NAME",
    "MAILRECV_MAX_SESSIONS",
    "MAILRECV_MAX_MESSAGES",
    "MAILRECV_MAX_SMTP_ERR",
    "MAILRECV_MAX_SMTP_NOOP",
    "MAILRECV_MAX_SMTP_VRFY",
    "MAILRECV_MAX_SMTP_RCPT",
    "MAILRECV_BANNER_DELAY_MS",
    "MAILRECV_ERROR_DELAY_MS",
    "MAILRECV_MAX_DATA_SIZE",
    "MAILRECV_STORE_DATA",
    "MAILRECV_STORE_PATH",
    "MAILRECV_LOG_PATH",
    "MAILRECV_LOG_VERBOSE",
    "MAILRECV_DO_TEMPFAIL",
    "MAILRECV_CHECK_HELO_FORMAT",
    "MAILRECV_EARLY_TALKERS",
    "MAILRECV_WHITELISTS",
    "MAILRECV_BLACKLISTS",
    "MAILRECV_LOCAL_DOMAINS",
    "MAILRECV_LOCAL_MAILBOXES",
];

fn clear_env() {
    for key in ALL_KEYS {
        env::remove_var(key);
    }
}

#[test]
fn config_from_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    env::set_var("MAILRECV_LISTEN_IP", "0.0.0.0");
    env::set_var("MAILRECV_LISTEN_PORT", "2525");
    env::set_var("MAILRECV_HOST_NAME", "mx.example.com");
    env::set_var("MAILRECV_STORE_DATA", "yes");
    env::set_var("MAILRECV_BLACKLISTS", "zen.spamhaus.org, bl.example.net,");
    env::set_var("MAILRECV_LOCAL_DOMAINS", "local.test");

    let config = Config::from_env().expect("config should load");

    assert_eq!(config.listen_ip, "0.0.0.0");
    assert_eq!(config.listen_port, 2525);
    assert_eq!(config.host_name, "mx.example.com");
    assert!(config.store_data);
    assert_eq!(
        config.blacklists,
        vec!["zen.spamhaus.org".to_string(), "bl.example.net".to_string()]
    );
    assert_eq!(config.local_domains, vec!["local.test".to_string()]);

    clear_env();
}

#[test]
fn config_default_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let config = Config::from_env().expect("config should load");

    assert_eq!(config.listen_ip, "127.0.0.1");
    assert_eq!(config.listen_port, 25);
    assert_eq!(config.receive_timeout_ms, 20_000);
    assert_eq!(config.max_sessions, 16);
    assert_eq!(config.max_smtp_err, 4);
    assert!(!config.store_data);
    assert!(config.check_helo_format);
    assert!(config.early_talkers);
    assert!(config.log_path.is_none());
    assert!(config.whitelists.is_empty());
    assert_eq!(config.listen_addr(), "127.0.0.1:25");
}

#[test]
fn config_rejects_bad_numbers_and_booleans() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    env::set_var("MAILRECV_LISTEN_PORT", "not-a-port");
    assert!(Config::from_env().is_err());
    env::remove_var("MAILRECV_LISTEN_PORT");

    env::set_var("MAILRECV_STORE_DATA", "maybe");
    assert!(Config::from_env().is_err());

    clear_env();
}

#[test]
fn receive_timeout_zero_means_infinite() {
    let config = Config {
        receive_timeout_ms: 0,
        ..Config::default()
    };
    assert!(config.receive_timeout().is_none());

    let config = Config {
        receive_timeout_ms: 1500,
        ..Config::default()
    };
    assert_eq!(config.receive_timeout(), Some(Duration::from_millis(1500)));
}
