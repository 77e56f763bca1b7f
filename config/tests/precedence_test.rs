use std::collections::BTreeMap;

use config::{
    ConfigError, ConfigManager, ConfigValue, Event, GetOptions, MemorySource, SetOptions, SourceInfo,
};

fn manager_with(sources: &[(&str, i32)]) -> ConfigManager {
    let manager = ConfigManager::new();
    for (name, priority) in sources {
        manager
            .add_source(*name, *priority, MemorySource::factory())
            .unwrap();
    }
    manager.load_all().unwrap();
    manager
}

fn set_on(manager: &ConfigManager, source: &str, key: &str, value: &str) {
    manager
        .set(key, value, &SetOptions::new().source(source))
        .unwrap();
}

fn delete_on(manager: &ConfigManager, source: &str, key: &str) {
    manager.delete(key, &SetOptions::new().source(source)).unwrap();
}

#[test]
fn test_higher_priority_wins_in_either_order() {
    let manager = manager_with(&[("low", 1), ("high", 2)]);

    set_on(&manager, "low", "a", "low-a");
    set_on(&manager, "high", "a", "high-a");
    set_on(&manager, "high", "b", "high-b");
    set_on(&manager, "low", "b", "low-b");

    assert_eq!(manager.get_string("a", ""), "high-a");
    assert_eq!(manager.get_string("b", ""), "high-b");
    assert_eq!(manager.source_of("b").unwrap().name(), "high");
}

#[test]
fn test_owner_overwrites_its_own_key() {
    let manager = manager_with(&[("low", 1), ("high", 2)]);

    set_on(&manager, "high", "k", "v1");
    set_on(&manager, "low", "k", "ignored");
    set_on(&manager, "high", "k", "v2");
    assert_eq!(manager.get_string("k", ""), "v2");

    set_on(&manager, "low", "other", "x1");
    set_on(&manager, "low", "other", "x2");
    assert_eq!(manager.get_string("other", ""), "x2");
}

#[test]
fn test_delete_falls_back_to_next_source() {
    let manager = manager_with(&[("low", 1), ("high", 2)]);

    set_on(&manager, "low", "k", "a");
    set_on(&manager, "high", "k", "b");
    assert_eq!(manager.get_string("k", ""), "b");

    delete_on(&manager, "high", "k");
    assert_eq!(manager.get_string("k", ""), "a");
    assert_eq!(manager.source_of("k").unwrap().name(), "low");

    delete_on(&manager, "low", "k");
    assert!(manager.get("k", &GetOptions::default()).is_none());
}

#[test]
fn test_fallback_after_low_source_arrives_last() {
    let manager = manager_with(&[("low", 1), ("high", 2)]);

    set_on(&manager, "high", "k", "b");
    set_on(&manager, "low", "k", "a");
    assert_eq!(manager.get_string("k", ""), "b");

    delete_on(&manager, "high", "k");
    assert_eq!(manager.get_string("k", ""), "a");
}

#[test]
fn test_fallback_uses_latest_value_of_lower_source() {
    let manager = manager_with(&[("low", 1), ("high", 2)]);

    set_on(&manager, "high", "k", "b");
    set_on(&manager, "low", "k", "a1");
    set_on(&manager, "low", "k", "a2");

    delete_on(&manager, "high", "k");
    assert_eq!(manager.get_string("k", ""), "a2");
}

#[test]
fn test_stale_delete_is_ignored() {
    let manager = manager_with(&[("low", 1), ("high", 2)]);

    set_on(&manager, "low", "k", "a");
    set_on(&manager, "high", "k", "b");

    delete_on(&manager, "low", "k");
    assert_eq!(manager.get_string("k", ""), "b");

    delete_on(&manager, "high", "k");
    assert!(!manager.contains("k"));
}

#[test]
fn test_three_sources_unwind_in_order() {
    let manager = manager_with(&[("a", 1), ("b", 5), ("c", 9)]);

    set_on(&manager, "b", "k", "from-b");
    set_on(&manager, "c", "k", "from-c");
    set_on(&manager, "a", "k", "from-a");

    delete_on(&manager, "c", "k");
    assert_eq!(manager.get_string("k", ""), "from-b");
    delete_on(&manager, "b", "k");
    assert_eq!(manager.get_string("k", ""), "from-a");
}

#[test]
fn test_ref_group_delete_only_touches_that_group() {
    let manager = manager_with(&[("env", 0), ("file", 2)]);
    let source = SourceInfo::new("file", 2);
    let env = SourceInfo::new("env", 0);

    manager.apply(Event::create(
        "db.host",
        config::Value::new("envhost", env.clone()),
    ));
    manager.apply(Event::create(
        "db.host",
        config::Value::new("filehost", source.clone()).with_ref("app.yaml"),
    ));
    manager.apply(Event::create(
        "db.port",
        config::Value::new("5432", source.clone()).with_ref("app.yaml"),
    ));
    manager.apply(Event::create(
        "cache.ttl",
        config::Value::new("30s", source.clone()).with_ref("cache.yaml"),
    ));

    manager.apply(Event::delete_ref(source, "app.yaml"));

    assert_eq!(manager.get_string("db.host", ""), "envhost");
    assert!(!manager.contains("db.port"));
    assert_eq!(manager.get_string("cache.ttl", ""), "30s");
}

#[test]
fn test_named_source_must_be_loaded() {
    let manager = ConfigManager::new();
    manager
        .add_source("memory", 10, MemorySource::factory())
        .unwrap();

    let err = manager
        .set("k", "v", &SetOptions::new().source("memory"))
        .unwrap_err();
    assert!(matches!(err, ConfigError::UnknownSource { .. }));

    manager.load_all().unwrap();
    manager
        .set("k", "v", &SetOptions::new().source("memory"))
        .unwrap();
    assert_eq!(manager.get_string("k", ""), "v");
}

#[test]
fn test_structured_set_flattens_and_replaces_children() {
    let manager = manager_with(&[("memory", 10)]);

    let mut db = BTreeMap::new();
    db.insert("host".to_string(), ConfigValue::from("a"));
    db.insert("replicas".to_string(), ConfigValue::from(vec!["r1", "r2", "r3"]));
    manager
        .set("db", ConfigValue::Map(db), &SetOptions::default())
        .unwrap();
    assert_eq!(manager.get_string("db.replicas[2]", ""), "r3");

    let mut db = BTreeMap::new();
    db.insert("host".to_string(), ConfigValue::from("b"));
    db.insert("replicas".to_string(), ConfigValue::from(vec!["r1"]));
    manager
        .set("db", ConfigValue::Map(db), &SetOptions::default())
        .unwrap();

    assert_eq!(manager.get_string("db.host", ""), "b");
    assert!(!manager.contains("db.replicas[2]"));
    let replicas = manager.get_with_prefix("db.replicas", &GetOptions::default());
    assert_eq!(replicas.len(), 1);
}
