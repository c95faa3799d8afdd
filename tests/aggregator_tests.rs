//! Tests for multi-file aggregation and lifecycle dispatch.

use config_sync::catalog::TypeCatalog;
use config_sync::descriptor::Describe;
use config_sync::logging::Logger;
use config_sync::registry::TypeRegistry;
use config_sync::sources::{AggregatorOptions, ConfigSourceAggregator};
use config_sync::types::{ConfigType, Configurable, Instance, read};
use config_sync::validation::predicate;
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

thread_local! {
    static REMOVED: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    static REJECT_NEXT: Cell<bool> = const { Cell::new(false) };
}

fn take_removed() -> Vec<String> {
    REMOVED.with(|removed| std::mem::take(&mut *removed.borrow_mut()))
}

#[derive(Default)]
struct Car {
    color: String,
    size: u32,
    updates: u32,
}

impl Car {
    fn updated(&mut self) -> anyhow::Result<()> {
        self.updates += 1;
        Ok(())
    }

    fn removed(&mut self) -> anyhow::Result<()> {
        REMOVED.with(|removed| removed.borrow_mut().push(format!("car:{}", self.color)));
        Ok(())
    }
}

impl Configurable for Car {
    fn describe(d: &mut Describe<Self>) {
        d.value("color", |c| &mut c.color);
        d.value("size", |c| &mut c.size);
        d.after_update("updated", Car::updated);
        d.before_remove("removed", Car::removed);
    }
}

#[derive(Default)]
struct Truck {
    load: u32,
}

impl Configurable for Truck {
    fn describe(d: &mut Describe<Self>) {
        d.value("load", |t| &mut t.load);
    }
}

/// Its seat validator rejects once after `REJECT_NEXT` is raised.
#[derive(Default)]
struct Bus {
    seats: u32,
}

impl Configurable for Bus {
    fn describe(d: &mut Describe<Self>) {
        d.value("seats", |b| &mut b.seats)
            .validate(predicate("seat_gate", |_| !REJECT_NEXT.with(|r| r.replace(false))));
    }
}

struct Fixture {
    dir: TempDir,
    catalog: Arc<TypeCatalog>,
    aggregator: ConfigSourceAggregator,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let catalog = Arc::new(TypeCatalog::new());
        catalog.register::<Car>();
        let registry = Arc::new(TypeRegistry::new(catalog.clone(), Logger::new()));
        let aggregator = ConfigSourceAggregator::new(
            registry,
            catalog.clone(),
            AggregatorOptions::default(),
            Logger::new().with_name("aggregator"),
        );
        aggregator.add_root(dir.path());
        Self {
            dir,
            catalog,
            aggregator,
        }
    }

    fn write(&self, name: &str, content: &str) {
        fs::write(self.path(name), content).expect("Failed to write config file");
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }
}

fn car_type() -> ConfigType {
    ConfigType::of::<Car>()
}

#[test]
fn late_instance_sees_merged_files() {
    let fx = Fixture::new();
    fx.write("a.yaml", "Car:\n  color: blue\n  size: 1\n");
    fx.write("b.json", r#"{"Car": {"size": 2}}"#);

    let report = fx.aggregator.rescan();
    assert_eq!(report.files_added.len(), 2);
    assert_eq!(report.types_created.len(), 1);

    let car = fx.aggregator.create::<Car>().expect("Failed to create car");
    let guard = read(&car);
    assert_eq!(guard.color, "blue");
    assert_eq!(guard.size, 2);
    assert_eq!(
        fx.aggregator.tree_of(&car_type()),
        Some(json!({"color": "blue", "size": 2}))
    );
}

#[test]
fn changed_file_reconfigures_registered_instances() {
    let fx = Fixture::new();
    fx.write("a.yaml", "Car:\n  color: blue\n  size: 1\n");
    fx.write("b.json", r#"{"Car": {"size": 2}}"#);
    fx.aggregator.rescan();
    let car = fx.aggregator.create::<Car>().unwrap();

    fx.write("b.json", r#"{"Car": {"size": 30}}"#);
    let report = fx.aggregator.rescan();

    assert_eq!(report.files_updated.len(), 1);
    assert_eq!(report.types_updated, vec![car_type().name().to_string()]);
    let guard = read(&car);
    assert_eq!((guard.color.as_str(), guard.size, guard.updates), ("blue", 30, 1));
}

#[test]
fn unchanged_rescan_does_nothing() {
    let fx = Fixture::new();
    fx.write("a.yaml", "Car:\n  size: 1\n");
    fx.aggregator.rescan();
    let car = fx.aggregator.create::<Car>().unwrap();

    let report = fx.aggregator.rescan();

    assert!(!report.has_changes());
    assert_eq!(read(&car).updates, 0);
}

#[test]
fn deleting_only_file_removes_type() {
    let fx = Fixture::new();
    fx.write("cars.properties", "Car.color=green\n");
    fx.aggregator.rescan();
    let first = fx.aggregator.create::<Car>().unwrap();
    let second = fx.aggregator.create::<Car>().unwrap();
    assert_eq!(fx.aggregator.instance_count(&car_type()), 2);

    fs::remove_file(fx.path("cars.properties")).unwrap();
    let report = fx.aggregator.rescan();

    assert_eq!(report.files_removed.len(), 1);
    assert_eq!(take_removed(), vec!["car:green", "car:green"]);
    assert!(!fx.aggregator.is_configured(&car_type()));
    assert_eq!(fx.aggregator.instance_count(&car_type()), 0);
    assert_eq!(read(&first).color, "green");
    assert_eq!(read(&second).color, "green");
}

#[test]
fn broken_file_keeps_previous_state() {
    let fx = Fixture::new();
    fx.write("a.yaml", "Car:\n  color: blue\n");
    fx.aggregator.rescan();
    let car = fx.aggregator.create::<Car>().unwrap();

    fx.write("a.yaml", "Car:\n\tcolor: red\n  size: 9\n");
    let report = fx.aggregator.rescan();

    assert_eq!(report.files_failed.len(), 1);
    assert!(report.files_updated.is_empty());
    assert!(fx.aggregator.is_configured(&car_type()));
    assert_eq!(fx.aggregator.tree_of(&car_type()), Some(json!({"color": "blue"})));
    assert_eq!(read(&car).color, "blue");
    assert!(take_removed().is_empty());
}

#[test]
fn broken_new_file_is_retried() {
    let fx = Fixture::new();
    fx.write("a.json", r#"{"Car": [1, 2]}"#);

    let report = fx.aggregator.rescan();
    assert_eq!(report.files_failed.len(), 1);
    assert!(fx.aggregator.files().is_empty());

    fx.write("a.json", r#"{"Car": {"size": 5}}"#);
    let report = fx.aggregator.rescan();
    assert_eq!(report.files_added.len(), 1);
    assert!(fx.aggregator.is_configured(&car_type()));
}

#[test]
fn unresolved_name_is_retried() {
    let fx = Fixture::new();
    fx.write("fleet.ini", "[Truck]\nload = 7\n");

    let report = fx.aggregator.rescan();
    assert_eq!(report.unresolved, vec!["Truck"]);
    assert!(fx.aggregator.configured_types().is_empty());

    fx.catalog.register::<Truck>();
    let report = fx.aggregator.rescan();
    assert!(report.unresolved.is_empty());
    assert_eq!(report.types_created.len(), 1);

    let truck = fx.aggregator.create::<Truck>().unwrap();
    assert_eq!(read(&truck).load, 7);
}

#[test]
fn mnemonic_names_resolve_to_types() {
    let fx = Fixture::new();
    fx.catalog.set_mnemonic("auto", "Car");
    fx.write("a.properties", "auto.size=4\n");
    fx.aggregator.rescan();

    let car = fx.aggregator.create::<Car>().unwrap();
    assert_eq!(read(&car).size, 4);
}

#[test]
fn instance_without_configuration_is_left_alone() {
    let fx = Fixture::new();
    let instance = Instance::new(Car {
        size: 8,
        ..Car::default()
    });

    assert!(!fx.aggregator.register_instance(instance.clone()).unwrap());
    assert!(!fx.aggregator.unregister_instance(&instance));
}

#[test]
fn unregister_runs_before_remove_once() {
    let fx = Fixture::new();
    fx.write("a.yaml", "Car:\n  color: teal\n");
    fx.aggregator.rescan();
    let instance = Instance::new(Car::default());
    assert!(fx.aggregator.register_instance(instance.clone()).unwrap());

    assert!(fx.aggregator.unregister_instance(&instance));
    assert!(!fx.aggregator.unregister_instance(&instance));
    assert_eq!(take_removed(), vec!["car:teal"]);

    fs::remove_file(fx.path("a.yaml")).unwrap();
    fx.aggregator.rescan();
    assert!(take_removed().is_empty());
}

#[test]
fn removed_root_forgets_its_files() {
    let fx = Fixture::new();
    fx.write("a.yaml", "Car:\n  color: teal\n");
    fx.aggregator.rescan();
    assert_eq!(fx.aggregator.files().len(), 1);

    assert!(fx.aggregator.remove_root(fx.dir.path()));
    let report = fx.aggregator.rescan();
    assert_eq!(report.files_removed.len(), 1);
    assert!(fx.aggregator.roots().is_empty());
    assert!(!fx.aggregator.is_configured(&car_type()));
}

#[test]
fn later_file_still_wins_when_earlier_file_changes() {
    let fx = Fixture::new();
    fx.write("a.yaml", "Car:\n  color: blue\n  size: 1\n");
    fx.aggregator.rescan();
    fx.write("b.json", r#"{"Car": {"size": 2}}"#);
    fx.aggregator.rescan();
    let old = fx.aggregator.create::<Car>().unwrap();
    assert_eq!(read(&old).size, 2);

    fx.write("a.yaml", "Car:\n  color: crimson\n  size: 1\n");
    let report = fx.aggregator.rescan();

    assert_eq!(report.files_updated.len(), 1);
    assert_eq!(
        fx.aggregator.tree_of(&car_type()),
        Some(json!({"color": "crimson", "size": 2}))
    );
    let new = fx.aggregator.create::<Car>().unwrap();
    for car in [&old, &new] {
        let guard = read(car);
        assert_eq!((guard.color.as_str(), guard.size), ("crimson", 2));
    }
}

#[test]
fn removed_override_file_restores_earlier_value() {
    let fx = Fixture::new();
    fx.write("a.yaml", "Car:\n  color: blue\n  size: 1\n");
    fx.write("b.json", r#"{"Car": {"size": 2}}"#);
    fx.aggregator.rescan();
    let car = fx.aggregator.create::<Car>().unwrap();

    fs::remove_file(fx.path("b.json")).unwrap();
    let report = fx.aggregator.rescan();

    assert_eq!(report.files_removed.len(), 1);
    assert_eq!(read(&car).size, 1);
    assert_eq!(read(&car).updates, 1);
}

#[test]
fn rejected_instance_does_not_stop_the_pass() {
    let fx = Fixture::new();
    fx.catalog.register::<Bus>();
    fx.write("fleet.yaml", "Bus:\n  seats: 10\nCar:\n  size: 1\n");
    fx.aggregator.rescan();
    let first = fx.aggregator.create::<Bus>().unwrap();
    let second = fx.aggregator.create::<Bus>().unwrap();
    let car = fx.aggregator.create::<Car>().unwrap();

    REJECT_NEXT.with(|r| r.set(true));
    fx.write("fleet.yaml", "Bus:\n  seats: 40\nCar:\n  size: 22\n");
    let report = fx.aggregator.rescan();

    assert_eq!(report.instance_failures.len(), 1);
    assert!(report.instance_failures[0].contains("seat_gate"));
    assert_eq!(report.types_updated.len(), 2);
    assert_eq!(read(&first).seats, 10);
    assert_eq!(read(&second).seats, 40);
    assert_eq!(read(&car).size, 22);
    assert_eq!(fx.aggregator.instance_count(&ConfigType::of::<Bus>()), 2);
}
