// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Integration tests for arraybridge.
//!
//! These drive the public API end to end over the host backend, the Candle
//! backend, and a simulated caching-allocator device (`common::SimDevice`).

#![allow(clippy::cast_precision_loss)]

mod common;

use arraybridge::{
    describe_name, Backend, BackendId, BackendRegistry, Bridge, BridgeConfig, BridgeError, Buffer,
    DType, DeviceConfig, HostArray, HostData, RescalePolicy, ValidatableConfig,
};
use common::{ramp, Failure, SimDevice};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

fn bridge_with(sim: &Arc<SimDevice>, config: BridgeConfig) -> Bridge {
    let registry = BackendRegistry::builder()
        .with_defaults(DeviceConfig::new().with_force_cpu(true))
        .register(sim.id(), Arc::clone(sim) as Arc<dyn Backend>)
        .try_build()
        .expect("registry ids match");
    Bridge::with_registry(config.with_cpu(), registry).expect("valid config")
}

fn copying_bridge(sim: &Arc<SimDevice>) -> Bridge {
    bridge_with(sim, BridgeConfig::new().with_zero_copy(false))
}

fn two_device_bridge(source: &Arc<SimDevice>, target: &Arc<SimDevice>, config: BridgeConfig) -> Bridge {
    let registry = BackendRegistry::builder()
        .with_defaults(DeviceConfig::new().with_force_cpu(true))
        .register(source.id(), Arc::clone(source) as Arc<dyn Backend>)
        .register(target.id(), Arc::clone(target) as Arc<dyn Backend>)
        .try_build()
        .expect("registry ids match");
    Bridge::with_registry(config.with_zero_copy(false).with_cpu(), registry).expect("valid config")
}

fn host(array: HostArray) -> Buffer {
    Buffer::host(array)
}

// ============================================================================
// Round trips
// ============================================================================

#[test]
fn test_round_trip_through_every_backend() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = copying_bridge(&sim);
    let values = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];

    for dtype in DType::ALL {
        let array = HostArray::new(vec![2, 3], HostData::from_f64(dtype, &values)).unwrap();
        let input = host(array.clone());

        let on_device = bridge.convert(&input, BackendId::Cuda, Some(1)).unwrap();
        assert_eq!(on_device.device(), Some(1));
        assert_eq!(bridge.to_host(&on_device).unwrap(), array, "cuda {dtype}");

        if bridge.registry().get(BackendId::Candle).unwrap().supports_dtype(dtype) {
            // device -> candle -> device -> host
            let on_candle = bridge.convert(&on_device, BackendId::Candle, None).unwrap();
            let again = bridge.convert(&on_candle, BackendId::Cuda, None).unwrap();
            assert_eq!(bridge.to_host(&again).unwrap(), array, "candle {dtype}");
        }
    }
}

#[test]
fn test_identity_does_not_touch_backend() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = copying_bridge(&sim);
    let on_device = bridge
        .convert(&host(ramp(&[8])), BackendId::Cuda, None)
        .unwrap();
    let calls = SimDevice::count(&sim.counters.from_host);

    let same = bridge.convert(&on_device, BackendId::Cuda, Some(3)).unwrap();
    assert!(same.shares_storage_with(&on_device));
    assert_eq!(same.device(), on_device.device());
    assert_eq!(SimDevice::count(&sim.counters.from_host), calls);
    assert_eq!(SimDevice::count(&sim.counters.to_host), 0);
}

// ============================================================================
// Zero-copy and fallback
// ============================================================================

#[test]
fn test_zero_copy_shares_memory() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = bridge_with(&sim, BridgeConfig::new());
    let array = ramp(&[4, 4]);

    let on_device = bridge.convert(&host(array.clone()), BackendId::Cuda, None).unwrap();
    assert_eq!(SimDevice::count(&sim.counters.imports), 1);
    assert_eq!(SimDevice::count(&sim.counters.from_host), 0);
    let tensor = on_device.storage::<common::SimTensor>().unwrap();
    assert!(Arc::ptr_eq(&tensor.data, &array.shared_data()));

    let back = bridge.convert(&on_device, BackendId::Host, None).unwrap();
    assert_eq!(SimDevice::count(&sim.counters.exports), 1);
    let back = back.storage::<HostArray>().unwrap();
    assert!(Arc::ptr_eq(&back.shared_data(), &array.shared_data()));
}

#[test]
fn test_zero_copy_failure_falls_back_to_host_copy() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = bridge_with(&sim, BridgeConfig::new());
    let array = ramp(&[3, 5]);
    let on_device = bridge.convert(&host(array.clone()), BackendId::Cuda, None).unwrap();

    sim.refuse_export(true);
    let back = bridge.to_host(&on_device).unwrap();
    assert_eq!(back, array);
    assert_eq!(SimDevice::count(&sim.counters.exports), 1);
    assert_eq!(SimDevice::count(&sim.counters.to_host), 1);
}

#[test]
fn test_zero_copy_disabled_by_config() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = copying_bridge(&sim);
    bridge.convert(&host(ramp(&[2])), BackendId::Cuda, None).unwrap();
    assert_eq!(SimDevice::count(&sim.counters.imports), 0);
    assert_eq!(SimDevice::count(&sim.counters.from_host), 1);
}

#[test]
fn test_candle_target_uses_fallback() {
    let sim = Arc::new(SimDevice::new(BackendId::Rocm));
    let bridge = bridge_with(&sim, BridgeConfig::new());
    let on_device = bridge.convert(&host(ramp(&[6])), BackendId::Rocm, None).unwrap();

    let on_candle = bridge.convert(&on_device, BackendId::Candle, None).unwrap();
    assert_eq!(on_candle.backend(), BackendId::Candle);
    assert_eq!(SimDevice::count(&sim.counters.exports), 0);
    assert_eq!(SimDevice::count(&sim.counters.to_host), 1);
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_error_kinds() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = copying_bridge(&sim);

    let wide = host(HostArray::from_vec(vec![2], vec![1u16, 2]).unwrap());
    assert!(matches!(
        bridge.convert(&wide, BackendId::Candle, None),
        Err(BridgeError::UnsupportedConversion { .. })
    ));
    assert!(matches!(
        bridge.convert(&wide, BackendId::Metal, None),
        Err(BridgeError::BackendUnavailable {
            backend: BackendId::Metal,
            ..
        })
    ));
    assert!(matches!(
        describe_name("vulkan"),
        Err(BridgeError::UnknownBackend { .. })
    ));
    assert!(matches!(
        "tpu".parse::<BackendId>(),
        Err(BridgeError::UnknownBackend { .. })
    ));
}

// ============================================================================
// OOM recovery
// ============================================================================

#[test]
fn test_oom_exhausts_after_three_attempts_and_two_clears() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = copying_bridge(&sim);
    sim.inject(Failure::OomClass, 3);

    let err = bridge
        .convert(&host(ramp(&[16])), BackendId::Cuda, None)
        .unwrap_err();

    match &err {
        BridgeError::OutOfMemory {
            backend,
            source_backend,
            target,
            attempts,
            ..
        } => {
            assert_eq!(*backend, BackendId::Cuda);
            assert_eq!(*source_backend, BackendId::Host);
            assert_eq!(*target, BackendId::Cuda);
            assert_eq!(*attempts, 3);
        }
        other => panic!("expected OutOfMemory, got {other:?}"),
    }
    assert_eq!(SimDevice::count(&sim.counters.from_host), 3);
    assert_eq!(SimDevice::count(&sim.counters.clears), 2);
}

#[test]
fn test_source_side_oom_clears_the_source_cache() {
    let cuda = Arc::new(SimDevice::new(BackendId::Cuda));
    let rocm = Arc::new(SimDevice::new(BackendId::Rocm));
    let bridge = two_device_bridge(&cuda, &rocm, BridgeConfig::new());

    let on_cuda = bridge.convert(&host(ramp(&[8])), BackendId::Cuda, None).unwrap();
    cuda.fill_staging_until_cleared();

    let on_rocm = bridge.convert(&on_cuda, BackendId::Rocm, None).unwrap();
    assert_eq!(on_rocm.backend(), BackendId::Rocm);
    assert_eq!(SimDevice::count(&cuda.counters.clears), 1);
    assert_eq!(SimDevice::count(&rocm.counters.clears), 0);
    assert_eq!(bridge.to_host(&on_rocm).unwrap(), ramp(&[8]));
}

#[test]
fn test_source_side_oom_is_reported_against_the_source() {
    let cuda = Arc::new(SimDevice::new(BackendId::Cuda));
    let rocm = Arc::new(SimDevice::new(BackendId::Rocm));
    let bridge = two_device_bridge(&cuda, &rocm, BridgeConfig::new().with_max_oom_retries(0));

    let on_cuda = bridge.convert(&host(ramp(&[8])), BackendId::Cuda, None).unwrap();
    cuda.fill_staging_until_cleared();

    let err = bridge.convert(&on_cuda, BackendId::Rocm, None).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::OutOfMemory {
            backend: BackendId::Cuda,
            source_backend: BackendId::Cuda,
            target: BackendId::Rocm,
            attempts: 1,
            ..
        }
    ));
    assert_eq!(SimDevice::count(&rocm.counters.from_host), 0);
    assert_eq!(SimDevice::count(&rocm.counters.clears), 0);
}

#[test]
fn test_text_only_oom_is_recovered() {
    for (id, message) in [
        (BackendId::Cuda, "CUDA_ERROR_OUT_OF_MEMORY: out of memory"),
        (BackendId::OpenCl, "clEnqueueWriteBuffer: CL_MEM_OBJECT_ALLOCATION_FAILURE"),
        (BackendId::Metal, "Insufficient Memory for command buffer"),
    ] {
        let sim = Arc::new(SimDevice::new(id));
        let bridge = copying_bridge(&sim);
        sim.inject(Failure::OomText(message), 1);

        let out = bridge.convert(&host(ramp(&[4])), id, None).unwrap();
        assert_eq!(out.backend(), id);
        assert_eq!(SimDevice::count(&sim.counters.clears), 1, "{id}");
        assert_eq!(SimDevice::count(&sim.counters.from_host), 2, "{id}");
    }
}

#[test]
fn test_non_oom_error_is_not_retried() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = copying_bridge(&sim);
    sim.inject(Failure::Runtime("an illegal memory access was encountered"), 1);

    let err = bridge
        .convert(&host(ramp(&[4])), BackendId::Cuda, None)
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::ConversionFailure {
            backend: BackendId::Cuda,
            ..
        }
    ));
    assert_eq!(SimDevice::count(&sim.counters.from_host), 1);
    assert_eq!(SimDevice::count(&sim.counters.clears), 0);
}

#[test]
fn test_cache_clear_recovers_fragmented_allocator() {
    // 200 f32 = 800 bytes; a second allocation only fits once the first
    // block has been released from the cache.
    let sim = Arc::new(SimDevice::with_limit(BackendId::Cuda, 1000));
    let bridge = copying_bridge(&sim);

    let first = bridge.convert(&host(ramp(&[200])), BackendId::Cuda, None).unwrap();
    drop(first);
    assert_eq!(sim.cached_bytes(), 800);
    assert_eq!(sim.allocated_bytes(), 800);

    let second = bridge.convert(&host(ramp(&[200])), BackendId::Cuda, None).unwrap();
    assert_eq!(second.numel(), 200);
    assert_eq!(SimDevice::count(&sim.counters.clears), 1);
    assert_eq!(sim.allocated_bytes(), 800);
}

#[test]
fn test_no_device_memory_is_leaked() {
    let sim = Arc::new(SimDevice::with_limit(BackendId::Cuda, 1 << 20));
    let bridge = copying_bridge(&sim);
    sim.inject(Failure::OomClass, 1);

    let buffers: Vec<_> = (1..=8)
        .map(|n| bridge.convert(&host(ramp(&[n, 16])), BackendId::Cuda, None).unwrap())
        .collect();
    assert!(sim.allocated_bytes() > 0);
    drop(buffers);

    sim.clear_cache();
    assert_eq!(sim.allocated_bytes(), 0);
}

#[test]
fn test_run_scoped_retries_on_the_same_stream() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = copying_bridge(&sim);
    let mut seen = Vec::new();

    let value = bridge
        .run_scoped(BackendId::Cuda, 2, |stream| {
            seen.push(stream.id());
            if seen.len() < 2 {
                return Err(arraybridge::BackendError::oom("transient"));
            }
            Ok(stream.handle::<u64>().copied())
        })
        .unwrap();

    assert!(value.is_some());
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], seen[1]);
    assert_eq!(SimDevice::count(&sim.counters.clears), 1);
}

#[test]
fn test_with_oom_recovery_propagates_final_error() {
    let sim = Arc::new(SimDevice::new(BackendId::Rocm));
    let bridge = copying_bridge(&sim);
    let mut calls = 0;
    let err = bridge
        .with_oom_recovery(BackendId::Rocm, 1, || -> Result<(), arraybridge::BackendError> {
            calls += 1;
            Err(arraybridge::BackendError::runtime("hipErrorOutOfMemory"))
        })
        .unwrap_err();
    assert_eq!(calls, 2);
    assert!(err.is_oom());
    assert_eq!(err.attempts(), Some(2));
    assert!(err.backend_error().unwrap().message.contains("hipErrorOutOfMemory"));
}

// ============================================================================
// Streams
// ============================================================================

#[test]
fn test_streams_are_per_thread() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = copying_bridge(&sim);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let bridge = bridge.clone();
            thread::spawn(move || {
                let a = bridge.acquire_stream(BackendId::Cuda).unwrap();
                let b = bridge.acquire_stream(BackendId::Cuda).unwrap();
                assert_eq!(a, b);
                assert_eq!(a.owner(), Some(thread::current().id()));
                // conversions on this thread reuse the pooled stream
                bridge.convert(&host(ramp(&[4])), BackendId::Cuda, None).unwrap();
                a.id()
            })
        })
        .collect();
    let ids: HashSet<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(ids.len(), 4);
    assert_eq!(SimDevice::count(&sim.counters.streams), 4);
    assert_eq!(bridge.streams().thread_count(), 0);
}

#[test]
fn test_stream_creation_oom_is_retried() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = copying_bridge(&sim);
    sim.inject_stream_failure(Failure::OomText("cudaStreamCreate: out of memory"), 1);

    let stream = bridge.acquire_stream(BackendId::Cuda).unwrap();
    assert!(!stream.is_default());
    assert_eq!(SimDevice::count(&sim.counters.streams), 2);
    assert_eq!(SimDevice::count(&sim.counters.clears), 1);
}

#[test]
fn test_stream_creation_failure_is_unavailable() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = copying_bridge(&sim);
    sim.inject_stream_failure(Failure::Runtime("cudaErrorNoDevice"), 1);

    let err = bridge.acquire_stream(BackendId::Cuda).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::BackendUnavailable {
            backend: BackendId::Cuda,
            ..
        }
    ));
    assert_eq!(SimDevice::count(&sim.counters.clears), 0);
}

#[test]
fn test_host_has_only_the_default_stream() {
    let bridge = Bridge::new(BridgeConfig::new().with_cpu()).unwrap();
    let stream = bridge.acquire_stream(BackendId::Host).unwrap();
    assert!(stream.is_default());
}

// ============================================================================
// Rescale
// ============================================================================

#[test]
fn test_rescale_does_not_wrap_at_boundaries() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = copying_bridge(&sim);

    let wide = HostArray::from_vec(vec![3], vec![-1.0e6f32, 0.0, 1.0e6]).unwrap();
    let on_device = bridge.convert(&host(wide), BackendId::Cuda, None).unwrap();
    let as_u8 = bridge.preserve_dtype(&on_device, DType::U8).unwrap();
    assert_eq!(as_u8.backend(), BackendId::Cuda);
    assert_eq!(as_u8.dtype(), DType::U8);
    assert_eq!(bridge.to_host(&as_u8).unwrap().to_vec::<u8>().unwrap(), vec![0, 128, 255]);

    let unit = HostArray::from_vec(vec![2], vec![-1.0f64, 1.0]).unwrap();
    let on_device = bridge.convert(&host(unit), BackendId::Cuda, None).unwrap();
    let as_i16 = bridge.preserve_dtype(&on_device, DType::I16).unwrap();
    assert_eq!(
        bridge.to_host(&as_i16).unwrap().to_vec::<i16>().unwrap(),
        vec![i16::MIN, i16::MAX]
    );
}

#[test]
fn test_saturate_policy_clamps() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = bridge_with(
        &sim,
        BridgeConfig::new()
            .with_zero_copy(false)
            .with_rescale_policy(RescalePolicy::Saturate),
    );
    let values = HostArray::from_vec(vec![4], vec![-5.0f32, 12.4, 254.6, 300.0]).unwrap();
    let on_device = bridge.convert(&host(values), BackendId::Cuda, None).unwrap();
    let out = bridge.preserve_dtype(&on_device, DType::U8).unwrap();
    assert_eq!(
        bridge.to_host(&out).unwrap().to_vec::<u8>().unwrap(),
        vec![0, 12, 255, 255]
    );
}

#[test]
fn test_integer_to_float_is_left_alone() {
    let bridge = Bridge::new(BridgeConfig::new().with_cpu()).unwrap();
    let floats = host(HostArray::from_vec(vec![2], vec![0.5f32, 1.5]).unwrap());
    let same = bridge.preserve_dtype(&floats, DType::F64).unwrap();
    assert!(same.shares_storage_with(&floats));
}

#[test]
fn test_call_on_restores_integer_dtype() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = copying_bridge(&sim);
    let input = host(HostArray::from_vec(vec![3], vec![0u8, 51, 255]).unwrap());
    let device = Arc::clone(&sim);

    let out = bridge
        .call_on(&input, BackendId::Cuda, |buffer, stream| {
            let values = device.to_host(buffer, stream)?.to_f64();
            let normalized: Vec<f32> = values.iter().map(|v| (*v / 255.0) as f32).collect();
            let array = HostArray::from_vec(buffer.shape().to_vec(), normalized)
                .map_err(|e| arraybridge::BackendError::runtime(e.to_string()))?;
            device.from_host(&array, buffer.device(), stream)
        })
        .unwrap();

    assert_eq!(out.backend(), BackendId::Cuda);
    assert_eq!(out.dtype(), DType::U8);
    assert_eq!(bridge.to_host(&out).unwrap().to_vec::<u8>().unwrap(), vec![0, 51, 255]);
}

// ============================================================================
// Batch helpers
// ============================================================================

#[test]
fn test_stack_unstack_single_slice() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = copying_bridge(&sim);
    let slice = ramp(&[2, 3]);

    let stacked = bridge
        .stack(&[host(slice.clone())], BackendId::Cuda, Some(0))
        .unwrap();
    assert_eq!(stacked.shape(), &[1, 2, 3]);

    let parts = bridge.unstack(&stacked, BackendId::Host, None).unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].storage::<HostArray>().unwrap(), &slice);
}

#[test]
fn test_stack_unstack_thousand_slices() {
    let sim = Arc::new(SimDevice::new(BackendId::Cuda));
    let bridge = copying_bridge(&sim);
    let slices: Vec<HostArray> = (0..1000)
        .map(|i| HostArray::from_vec(vec![4], vec![i as f32; 4]).unwrap())
        .collect();
    let buffers: Vec<Buffer> = slices.iter().cloned().map(host).collect();

    let stacked = bridge.stack(&buffers, BackendId::Cuda, None).unwrap();
    assert_eq!(stacked.shape(), &[1000, 4]);

    let parts = bridge.unstack(&stacked, BackendId::Candle, None).unwrap();
    assert_eq!(parts.len(), 1000);
    for (part, expected) in parts.iter().zip(&slices) {
        assert_eq!(part.backend(), BackendId::Candle);
        assert_eq!(&bridge.to_host(part).unwrap(), expected);
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_from_env() {
    std::env::set_var("ARRAYBRIDGE_MAX_OOM_RETRIES", "5");
    std::env::set_var("ARRAYBRIDGE_ZERO_COPY", "false");
    std::env::set_var("ARRAYBRIDGE_RESCALE", "saturate");

    let config = BridgeConfig::from_env();
    assert_eq!(config.max_oom_retries, 5);
    assert!(!config.zero_copy);
    assert_eq!(config.rescale_policy, RescalePolicy::Saturate);
    assert!(config.validate().is_ok());

    std::env::remove_var("ARRAYBRIDGE_MAX_OOM_RETRIES");
    std::env::remove_var("ARRAYBRIDGE_ZERO_COPY");
    std::env::remove_var("ARRAYBRIDGE_RESCALE");
}

#[test]
fn test_mismatched_registration_is_rejected() {
    let sim = Arc::new(SimDevice::new(BackendId::Rocm));
    let err = BackendRegistry::builder()
        .register(BackendId::Cuda, sim as Arc<dyn Backend>)
        .try_build()
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidConfig(_)));
}
