//! Tests for stream-ordered transfers, the stash and the cast cache.

use super::{TransferConfig, TransferEngine, TransferError};
use crate::device::{CapabilityTier, DType, DeviceCatalog, DeviceConfig, DeviceId, GIB, MIB};
use crate::models::{ModelHandle, ModuleSpec};
use crate::transfer::{SimulatedStream, StreamPair};

const ACCEL: DeviceId = DeviceId::Accelerator(0);

fn catalog() -> DeviceCatalog {
    DeviceCatalog::mock(&DeviceConfig::default(), Some(GIB), CapabilityTier::DiscreteAsync)
}

fn host_model(c: &DeviceCatalog) -> ModelHandle {
    ModelHandle::builder("m")
        .module(ModuleSpec::offloadable("blk", MIB, 1024))
        .build(c)
        .unwrap()
}

fn manual_streams() -> (StreamPair, SimulatedStream, SimulatedStream) {
    let mover = SimulatedStream::new("mover", false);
    let main = SimulatedStream::new("main", false);
    let pair = StreamPair::new(Box::new(mover.clone()), Box::new(main.clone()));
    (pair, mover, main)
}

#[test]
fn synchronous_copy_without_streams() {
    let c = catalog();
    let m = host_model(&c);
    let mut engine = TransferEngine::new(&TransferConfig::default(), None);
    let seen = engine
        .consume(&c, m.weights(), "blk", ACCEL, DType::F16, |b| {
            assert_eq!(b.device(), ACCEL);
            b.transient_bytes()
        })
        .unwrap();
    assert_eq!(seen, 2 * MIB + 2048);
    assert_eq!(engine.pending_len(), 0);
}

#[test]
fn stashed_buffers_live_until_signal_done() {
    let c = catalog();
    let m = host_model(&c);
    let (pair, _mover, main) = manual_streams();
    let mut engine = TransferEngine::new(&TransferConfig { cast_cache_capacity: 0 }, Some(pair));

    engine.consume(&c, m.weights(), "blk", ACCEL, DType::F16, |_| ()).unwrap();
    assert_eq!(engine.pending_len(), 1);
    let stashed = &engine.pending()[0];
    assert_eq!((stashed.source, stashed.destination), (DeviceId::Host, ACCEL));
    assert!(!stashed.signal.is_done());
    let copy_bytes = c.allocated_bytes(ACCEL);
    assert_eq!(copy_bytes, 2 * MIB + 2048);

    // Compute has not finished: a sweep must keep the buffers.
    assert_eq!(engine.sweep(), 0);
    assert_eq!(c.allocated_bytes(ACCEL), copy_bytes);

    main.retire(usize::MAX);
    assert_eq!(engine.sweep(), 1);
    assert_eq!(c.allocated_bytes(ACCEL), 0);
}

#[test]
fn cleanup_synchronizes_and_clears_stash() {
    let c = catalog();
    let m = host_model(&c);
    let (pair, mover, main) = manual_streams();
    let mut engine = TransferEngine::new(&TransferConfig { cast_cache_capacity: 0 }, Some(pair));
    for _ in 0..3 {
        engine.consume(&c, m.weights(), "blk", ACCEL, DType::F16, |_| ()).unwrap();
    }
    assert_eq!(engine.pending_len(), 3);
    engine.cleanup_cache();
    assert_eq!(engine.pending_len(), 0);
    assert_eq!(mover.outstanding(), 0);
    assert_eq!(main.outstanding(), 0);
    assert_eq!(c.allocated_bytes(ACCEL), 0);
}

#[test]
fn cast_cache_short_circuits_repeat_casts() {
    let c = catalog();
    let m = host_model(&c);
    let mut engine = TransferEngine::new(&TransferConfig::default(), None);
    engine.consume(&c, m.weights(), "blk", ACCEL, DType::F16, |_| ()).unwrap();
    engine.consume(&c, m.weights(), "blk", ACCEL, DType::F16, |_| ()).unwrap();
    assert_eq!(engine.cast_cache_hits(), 1);
    assert_eq!(engine.cast_cache_misses(), 1);
    assert_eq!(engine.cast_cache_len(), 1);
    // Cached copies stay allocated until the cache is cleared.
    assert_eq!(c.allocated_bytes(ACCEL), 2 * MIB + 2048);
    engine.clear_cast_cache();
    assert_eq!(c.allocated_bytes(ACCEL), 0);
}

#[test]
fn cleanup_releases_cached_copies() {
    let c = catalog();
    let m = host_model(&c);
    let mut engine = TransferEngine::new(&TransferConfig::default(), None);
    engine.consume(&c, m.weights(), "blk", ACCEL, DType::F16, |_| ()).unwrap();
    assert_eq!(c.allocated_bytes(ACCEL), 2 * MIB + 2048);

    engine.cleanup_cache();

    assert_eq!(engine.cast_cache_len(), 0);
    assert_eq!(c.allocated_bytes(ACCEL), 0);
}

#[test]
fn cast_cache_clears_wholesale_when_full() {
    let c = catalog();
    let m = ModelHandle::builder("m")
        .modules((0..3).map(|i| ModuleSpec::offloadable(format!("b{i}"), 16, 0)))
        .build(&c)
        .unwrap();
    let mut engine = TransferEngine::new(&TransferConfig { cast_cache_capacity: 2 }, None);
    for name in ["b0", "b1", "b2"] {
        engine.consume(&c, m.weights(), name, ACCEL, DType::F16, |_| ()).unwrap();
    }
    assert_eq!(engine.cast_cache_len(), 1);
}

#[test]
fn resident_modules_are_views() {
    let c = catalog();
    let m = ModelHandle::builder("m")
        .initial_device(ACCEL)
        .module(ModuleSpec::offloadable("blk", 64, 8))
        .build(&c)
        .unwrap();
    let before = c.allocated_bytes(ACCEL);
    let (pair, _mover, _main) = manual_streams();
    let mut engine = TransferEngine::new(&TransferConfig::default(), Some(pair));
    let resident = engine
        .consume(&c, m.weights(), "blk", ACCEL, DType::F16, |b| b.resident())
        .unwrap();
    assert!(resident);
    assert_eq!(c.allocated_bytes(ACCEL), before);
    assert_eq!(engine.pending_len(), 0);
}

#[test]
fn unknown_module_is_an_error() {
    let c = catalog();
    let m = host_model(&c);
    let mut engine = TransferEngine::new(&TransferConfig::default(), None);
    let err = engine
        .consume(&c, m.weights(), "missing", ACCEL, DType::F16, |_| ())
        .unwrap_err();
    assert!(matches!(err, TransferError::UnknownModule { .. }));
}
