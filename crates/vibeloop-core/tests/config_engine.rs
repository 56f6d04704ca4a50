//! Configuration files driving a real engine.

use std::time::Duration;
use vibeloop_core::{CaptureSink, Engine, EngineConfig, ExtensionRegistry, Value};

#[test]
fn test_template_config_runs() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    EngineConfig::write_template(&path, false).unwrap();

    let mut config = EngineConfig::load_from(&path).unwrap();
    config.transport.bpm = 600.0;
    config.pipeline.hook_budget = Duration::from_millis(50);
    config.validate().unwrap();

    let pipeline = config.build_pipeline(&ExtensionRegistry::with_builtins()).unwrap();
    let names: Vec<&str> = pipeline.registrations().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["drop_empty", "cps"]);

    let capture = CaptureSink::new();
    let engine = Engine::start(
        config.engine_options(),
        config.build_store().unwrap(),
        pipeline,
        vec![Box::new(capture.clone())],
    )
    .unwrap();
    let handle = engine.handle().clone();
    assert_eq!(handle.extension_registrations().len(), 2);

    handle.play().unwrap();
    assert!(handle.wait_for_step(8, Duration::from_secs(5)));
    engine.shutdown();

    let messages = capture.messages();
    // Step 0 hits both the kick and the hat.
    let first: Vec<_> = messages.iter().filter(|(step, _)| *step == 0).collect();
    assert_eq!(first.len(), 2);
    for (_, message) in &messages {
        let cps = message.param("cps").and_then(Value::as_f64).unwrap();
        assert!((cps - 600.0 / 60.0 / 4.0).abs() < 1e-6);
    }
}

#[test]
fn test_saved_config_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");
    let config = EngineConfig::from_toml_str(EngineConfig::template()).unwrap();
    config.save_to(&path).unwrap();
    assert_eq!(EngineConfig::load_from(&path).unwrap(), config);
}
