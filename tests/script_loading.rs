use std::fs;

use tempfile::tempdir;
use tissue_bridge::config::RuntimeConfig;
use tissue_bridge::loader::{DirectorySource, EmbeddedSource, SearchPath};
use tissue_bridge::{BridgeError, RuntimeHandle};

fn runtime_with(scripts: EmbeddedSource) -> RuntimeHandle {
    RuntimeHandle::create(&RuntimeConfig::default(), SearchPath::new().with(scripts)).expect("runtime should start")
}

#[test]
fn bundled_scripts_load_repeatedly() {
    let mut runtime = runtime_with(EmbeddedSource::bundled());
    for _ in 0..3 {
        runtime.load("catissue/database").expect("database script should load");
        runtime.load("catissue/embed/jbridge").expect("facade script should load");
    }
    let loaded = runtime.loaded_scripts();
    assert_eq!(loaded.len(), 2, "each script is recorded once");
    assert!(loaded.iter().all(|script| script.loads == 3));
    assert!(loaded.iter().all(|script| script.digest.len() == 64));
}

#[test]
fn missing_scripts_report_the_exact_identifier() {
    let mut runtime = runtime_with(EmbeddedSource::bundled());
    for script_id in ["catissue/missing", "catissue/../database", "/catissue/database", ""] {
        match runtime.load(script_id) {
            Err(BridgeError::ScriptNotFound { script_id: reported }) => assert_eq!(reported, script_id),
            other => panic!("expected ScriptNotFound for '{script_id}', got {other:?}"),
        }
    }
}

#[test]
fn malformed_scripts_fail_to_parse() {
    let mut runtime = runtime_with(EmbeddedSource::new().with("lab/broken", "fn broken( { 1 }"));
    match runtime.load("lab/broken") {
        Err(BridgeError::ScriptParse { script_id, cause }) => {
            assert_eq!(script_id, "lab/broken");
            assert!(!cause.is_empty());
        }
        other => panic!("expected ScriptParse, got {other:?}"),
    }
}

#[test]
fn failed_execution_commits_no_definitions() {
    let mut runtime = runtime_with(
        EmbeddedSource::new()
            .with("lab/partial", "fn partial() { 1 }\nthrow \"refusing to load\";")
            .with("lab/accessor", "fn accessor() { singleton(\"accessor\", || #{ n: 0 }) }"),
    );
    match runtime.load("lab/partial") {
        Err(BridgeError::ScriptExecution { script_id, cause }) => {
            assert_eq!(script_id, "lab/partial");
            assert_eq!(cause, "refusing to load");
        }
        other => panic!("expected ScriptExecution, got {other:?}"),
    }
    runtime.load("lab/accessor").expect("accessor should load");
    let target = runtime.resolve("accessor()").expect("resolve accessor");
    let err = runtime.invoke(&target, "partial", Vec::new()).unwrap_err();
    assert!(matches!(err, BridgeError::MethodNotFound { .. }), "got {err:?}");
}

#[test]
fn script_variables_do_not_leak_between_loads() {
    let mut runtime = runtime_with(
        EmbeddedSource::new()
            .with("lab/first", "let leaked = 41;\nfn first() { 1 }")
            .with("lab/second", "let seen = leaked + 1;"),
    );
    runtime.load("lab/first").expect("first script");
    let err = runtime.load("lab/second").unwrap_err();
    assert!(matches!(err, BridgeError::ScriptExecution { .. }), "got {err:?}");
}

#[test]
fn later_scripts_call_earlier_definitions_at_top_level() {
    let mut runtime = runtime_with(
        EmbeddedSource::new()
            .with("lab/base", "fn base_value() { 20 }")
            .with("lab/derived", "if base_value() != 20 { throw \"base missing\"; }\nfn derived() { base_value() + 1 }"),
    );
    runtime.load("lab/base").expect("base");
    runtime.load("lab/derived").expect("derived sees base");
}

#[test]
fn redefinition_rebinds_live_references() {
    let dir = tempdir().expect("temp dir");
    let script = dir.path().join("greeter.rhai");
    fs::write(
        &script,
        r#"
            fn greeter() { singleton("greeter", || #{ greeted: 0 }) }
            fn greet() { this.greeted += 1; "v1" }
        "#,
    )
    .expect("write v1");
    let mut runtime = RuntimeHandle::create(
        &RuntimeConfig::default(),
        SearchPath::new().with(DirectorySource::new(dir.path())),
    )
    .expect("runtime");
    runtime.load("greeter").expect("load v1");
    let greeter = runtime.resolve("greeter()").expect("resolve greeter");
    let first = runtime.invoke(&greeter, "greet", Vec::new()).expect("greet v1");
    assert_eq!(first.into_string().as_deref(), Ok("v1"));

    fs::write(
        &script,
        r#"
            fn greeter() { singleton("greeter", || #{ greeted: 0 }) }
            fn greet() { this.greeted += 1; "v2:" + this.greeted }
        "#,
    )
    .expect("write v2");
    runtime.load("greeter").expect("load v2");
    let second = runtime.invoke(&greeter, "greet", Vec::new()).expect("greet v2");
    assert_eq!(second.into_string().as_deref(), Ok("v2:2"), "existing state is kept, methods are replaced");
    assert_eq!(runtime.loaded_scripts()[0].loads, 2);
}

#[test]
fn directory_roots_shadow_bundled_scripts() {
    let dir = tempdir().expect("temp dir");
    fs::create_dir_all(dir.path().join("catissue")).expect("create subdir");
    fs::write(dir.path().join("catissue/database.rhai"), "fn database() { singleton(\"site-db\", || #{ site: true }) }")
        .expect("write override");
    let mut runtime = RuntimeHandle::create(
        &RuntimeConfig::default(),
        SearchPath::new().with(DirectorySource::new(dir.path())).with(EmbeddedSource::bundled()),
    )
    .expect("runtime");
    runtime.load("catissue/database").expect("load override");
    let loaded = runtime.loaded_scripts();
    assert!(loaded[0].origin.ends_with("database.rhai"), "origin was {}", loaded[0].origin);
}

#[test]
fn undecodable_files_are_parse_errors_not_missing() {
    let dir = tempdir().expect("temp dir");
    fs::create_dir_all(dir.path().join("lab")).expect("create subdir");
    fs::write(dir.path().join("lab/bad.rhai"), [0xc3, 0x28, 0xa0, 0xa1]).expect("write bytes");
    let mut runtime = RuntimeHandle::create(
        &RuntimeConfig::default(),
        SearchPath::new().with(DirectorySource::new(dir.path())),
    )
    .expect("runtime");
    match runtime.load("lab/bad") {
        Err(BridgeError::ScriptParse { script_id, cause }) => {
            assert_eq!(script_id, "lab/bad");
            assert!(cause.contains("bad.rhai"), "cause was {cause}");
        }
        other => panic!("expected ScriptParse, got {other:?}"),
    }
    assert!(runtime.loaded_scripts().is_empty());
}

#[test]
fn missing_directory_root_prevents_startup() {
    let dir = tempdir().expect("temp dir");
    let err = RuntimeHandle::create(
        &RuntimeConfig::default(),
        SearchPath::new().with(DirectorySource::new(dir.path().join("absent"))),
    )
    .unwrap_err();
    assert!(matches!(err, BridgeError::RuntimeInit { .. }), "got {err:?}");
}

#[test]
fn load_after_release_fails() {
    let mut runtime = runtime_with(EmbeddedSource::bundled());
    runtime.release();
    let err = runtime.load("catissue/database").unwrap_err();
    assert!(matches!(err, BridgeError::UseAfterRelease { .. }), "got {err:?}");
}
