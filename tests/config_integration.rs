//! Configuration loading: file defaults, environment precedence, token
//! table parsing.

use std::io::Write;

use serial_test::serial;
use streamgate::Config;

fn clear_env() {
    for var in [
        "API_ID",
        "API_HASH",
        "BOT_TOKEN",
        "STRING_SESSION",
        "BIN_CHANNEL",
        "SLEEP_THRESHOLD",
        "MAX_CONCURRENT_PER_CLIENT",
        "BIND_ADDR",
        "PORT",
        "MULTI_TOKEN1",
        "MULTI_TOKEN2",
    ] {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_env_only_configuration() {
    clear_env();
    std::env::set_var("API_ID", "12345");
    std::env::set_var("API_HASH", "abcdef");
    std::env::set_var("BOT_TOKEN", "100:primary");
    std::env::set_var("BIN_CHANNEL", "-1009999");
    std::env::set_var("MULTI_TOKEN1", "101:one");
    std::env::set_var("MULTI_TOKEN2", "102:two");
    std::env::set_var("STRING_SESSION", "AQAAblob");
    std::env::set_var("PORT", "9090");

    let config = Config::load(None).unwrap();
    config.validate().unwrap();

    assert_eq!(config.api_id, 12345);
    assert_eq!(config.bot_token, "100:primary");
    assert_eq!(config.bin_channel, -1009999);
    assert_eq!(config.additional_tokens.len(), 2);
    assert_eq!(config.additional_tokens[&1], "101:one");
    assert_eq!(config.string_session.as_deref(), Some("AQAAblob"));
    assert_eq!(config.server.port, 9090);

    let ids: Vec<_> = config.session_specs().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![0, 1, 2, 99]);
    clear_env();
}

#[test]
#[serial]
fn test_env_overrides_file() {
    clear_env();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        concat!(
            "api_id: 1\n",
            "api_hash: from_file\n",
            "bot_token: \"1:file\"\n",
            "bin_channel: -100123\n",
            "server:\n",
            "  port: 8000\n",
        )
    )
    .unwrap();

    std::env::set_var("API_HASH", "from_env");

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.api_id, 1);
    assert_eq!(config.api_hash, "from_env");
    assert_eq!(config.bot_token, "1:file");
    assert_eq!(config.server.port, 8000);
    clear_env();
}

#[test]
#[serial]
fn test_missing_required_fields_fail_validation() {
    clear_env();
    let config = Config::load(None).unwrap();
    assert!(config.validate().is_err());
}
