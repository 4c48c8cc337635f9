use analysis_worker::cli::LogLevel;
use analysis_worker::logging::build_filter;
use tracing::level_filters::LevelFilter;

#[test]
fn cli_flag_wins_over_the_environment() {
    let filter = build_filter(Some(LogLevel::Debug), Some("trace")).unwrap();
    assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
}

#[test]
fn environment_value_is_a_full_directive_string() {
    let filter = build_filter(None, Some("analysis_worker=trace,sqlx=info")).unwrap();
    assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
}

#[test]
fn defaults_to_info_when_nothing_is_set() {
    for env in [None, Some(""), Some("   ")] {
        let filter = build_filter(None, env).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO), "env {env:?}");
    }
}

#[test]
fn malformed_directives_name_the_variable() {
    let err = build_filter(None, Some("sqlx=loud")).unwrap_err();
    assert!(err.to_string().contains("ANALYSIS_WORKER_LOG"), "{err}");
}
