//! OffloadService: manager operations marshalled onto the worker thread.

use gg_offload::scheduler::{QueueError, TaskQueueConfig};
use gg_offload::{
    CapabilityTier, DeviceCatalog, DeviceConfig, DeviceId, ModelHandle, ModuleSpec, OffloadConfig, OffloadError,
    OffloadManager, OffloadService, OperatingMode, Residency, GIB,
};

const ACCEL: DeviceId = DeviceId::Accelerator(0);

fn service() -> OffloadService {
    let catalog = DeviceCatalog::mock(&DeviceConfig::default(), Some(8 * GIB), CapabilityTier::Discrete);
    OffloadService::from_config(&OffloadConfig::default(), catalog).unwrap()
}

fn model(service: &OffloadService, name: &str, gib: usize) -> ModelHandle {
    let modules = (0..gib).map(|i| ModuleSpec::offloadable(format!("block{i}"), GIB / 2, 0));
    service.build_model(ModelHandle::builder(name).modules(modules)).unwrap()
}

#[test]
fn load_runs_on_the_worker() {
    let service = service();
    let x = model(&service, "x", 2);

    let report = service.load(&[x.clone()], 0, 0).unwrap();

    assert_eq!(report.outcome(x.id()).unwrap().residency, Residency::Full);
    assert_eq!(x.bytes_on(ACCEL), 2 * GIB);
    let on_worker = service.execute("is_worker", |_m: &mut OffloadManager| std::thread::current().name().map(String::from));
    assert_eq!(on_worker.unwrap().as_deref(), Some("gg-offload-worker"));
}

#[test]
fn status_and_unload_all_round_trip() {
    let service = service();
    let x = model(&service, "x", 1);
    let y = model(&service, "y", 1);
    service.load(&[x.clone(), y.clone()], 0, 0).unwrap();

    let status = service.status().unwrap();
    assert_eq!(status.models.len(), 2);
    assert_eq!(status.mode, OperatingMode::NormalBudget);

    let evicted = service.unload_all().unwrap();
    assert_eq!(evicted.unloaded.len(), 2);
    assert_eq!(evicted.freed_bytes, 2 * GIB);
    assert!(service.status().unwrap().models.is_empty());
    assert_eq!(x.bytes_on(ACCEL), 0);
}

#[test]
fn dropped_handles_are_cleaned_up() {
    let service = service();
    let x = model(&service, "x", 1);
    let keep = model(&service, "keep", 1);
    service.load(&[x.clone(), keep.clone()], 0, 0).unwrap();
    drop(x);

    let report = service.cleanup_models().unwrap();

    assert_eq!(report.unloaded, vec!["x".to_string()]);
    let status = service.status().unwrap();
    assert_eq!(status.models.len(), 1);
    assert_eq!(status.models[0].name, "keep");
}

#[test]
fn submitted_work_runs_before_later_tasks() {
    let service = service();
    service
        .submit("inject", |m| {
            m.free_memory(GIB, ACCEL, &[]);
        })
        .unwrap();
    let mode = service.execute("mode", |m| m.current_mode()).unwrap();
    assert_eq!(mode, OperatingMode::NormalBudget);
    assert_eq!(service.pending_tasks(), 0);
}

#[test]
fn panicking_task_reports_failure_and_worker_survives() {
    let service = service();

    let err = service
        .execute("explode", |_m: &mut OffloadManager| -> u32 { panic!("boom") })
        .unwrap_err();

    match err {
        OffloadError::QueueTaskFailure(QueueError::TaskPanicked { task, message }) => {
            assert_eq!(task, "explode");
            assert!(message.contains("boom"));
        }
        other => panic!("expected a task panic, got {other}"),
    }
    assert!(service.status().is_ok());
}

#[test]
fn service_honours_queue_backoff_settings() {
    let catalog = DeviceCatalog::mock(&DeviceConfig::default(), Some(GIB), CapabilityTier::Discrete);
    let manager = OffloadManager::from_config(&OffloadConfig::default(), catalog);
    let config = TaskQueueConfig {
        backoff_min_ms: 5,
        backoff_max_ms: 5,
    };
    let service = OffloadService::start(manager, &config).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert!(service.status().unwrap().models.is_empty());
}

#[test]
fn async_load_completes_through_the_ticket() {
    let service = service();
    let x = model(&service, "x", 1);

    let (first, again) = tokio_test::block_on(async {
        let first = service.load_async(&[x.clone()], 0, 0).await.unwrap();
        let again = service.load_async(&[x.clone()], 0, 0).await.unwrap();
        (first, again)
    });

    assert!(!first.fast_path);
    assert!(again.fast_path);
    assert_eq!(again.models[0].residency, Residency::AlreadyLoaded);
}
