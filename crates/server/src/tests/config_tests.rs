use super::*;

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(
        normalize_database_url("sqlite:./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(
        normalize_database_url("   "),
        Settings::default().database_url
    );
}

#[test]
fn creates_parent_dir_for_sqlite_url() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("data").join("fieldops.db");

    let url = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(url.starts_with("sqlite://"));
    assert!(temp_root.path().join("data").exists());
}

#[test]
fn settings_file_overrides_defaults() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let stem = temp_root.path().join("server");
    fs::write(
        stem.with_extension("toml"),
        r#"
server_bind = "0.0.0.0:9000"
offer_sweep_interval_seconds = 5
extra_transitions = "DONE:IN_PROGRESS"
"#,
    )
    .expect("write settings");

    let settings = load_settings_from(stem.to_string_lossy().as_ref()).expect("settings");
    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.offer_sweep_interval_seconds, 5);
    assert_eq!(settings.token_ttl_seconds, Settings::default().token_ttl_seconds);

    let graph = settings.transition_graph().expect("graph");
    assert!(graph.is_allowed(MissionStatus::Done, MissionStatus::InProgress));
    assert!(graph.is_allowed(MissionStatus::Published, MissionStatus::Draft));
}

#[test]
fn missing_settings_file_falls_back_to_defaults() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let settings = load_settings_from(temp_root.path().join("absent").to_string_lossy().as_ref())
        .expect("settings");
    assert_eq!(
        settings.offer_sweep_interval_seconds,
        Settings::default().offer_sweep_interval_seconds
    );
}

#[test]
fn extra_transitions_parse_from_pairs() {
    let pairs = parse_extra_transitions(" DONE:IN_PROGRESS , BILLABLE:DONE ,").expect("pairs");
    assert_eq!(
        pairs,
        vec![
            (MissionStatus::Done, MissionStatus::InProgress),
            (MissionStatus::Billable, MissionStatus::Done),
        ]
    );
    assert!(parse_extra_transitions("").expect("empty").is_empty());
}

#[test]
fn malformed_extra_transitions_are_rejected() {
    assert!(parse_extra_transitions("DONE-IN_PROGRESS").is_err());
    assert!(parse_extra_transitions("DONE:SOMEWHERE").is_err());

    let settings = Settings {
        extra_transitions: "CLOSED:PAID".into(),
        ..Settings::default()
    };
    assert!(settings.transition_graph().is_err());
}
