//! Integration tests for the SBT container: record-style write, full
//! round-trip fidelity and header consistency.

use tracesmith::events::{
    CallStack, DeviceInfo, EventKind, FlowInfo, KernelParams, MemoryParams, StackFrame,
    TraceEvent, TraceMetadata, TraceRecord, FLOW_TYPE_KERNEL,
};
use tracesmith::sbt::{SbtHeader, SbtReader, SbtWriter, SBT_HEADER_SIZE};
use tempfile::TempDir;

/// 1,000 alternating launch/complete events on two streams, 50 us apart,
/// starting at 1 ms.
fn synthetic_events() -> Vec<TraceEvent> {
    let mut events = Vec::with_capacity(1000);
    for i in 0u64..1000 {
        let kind = if i % 2 == 0 {
            EventKind::KernelLaunch
        } else {
            EventKind::KernelComplete
        };
        let mut event = TraceEvent::new(kind);
        event.timestamp = 1_000_000 + i * 50_000;
        event.stream_id = (i / 2 % 2) as u32;
        event.correlation_id = i / 2 + 1;
        event.thread_id = 7;
        event.name = format!("kernel_{}", i / 2 % 5);
        events.push(event);
    }
    events
}

#[test]
fn test_record_one_thousand_events() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("record.sbt");

    let mut writer = SbtWriter::open(&path).unwrap();
    writer
        .write_metadata(&TraceMetadata {
            application: "synthetic".to_string(),
            command_line: "record".to_string(),
            start_timestamp: 1_000_000,
            end_timestamp: 50_950_000,
            extra: Vec::new(),
        })
        .unwrap();
    let events = synthetic_events();
    writer.write_events(events.iter()).unwrap();
    writer.finalize().unwrap();

    let reader = SbtReader::open(&path).unwrap();
    assert!(reader.is_valid());
    assert_eq!(reader.event_count(), 1000);

    let mut record = TraceRecord::new();
    reader.read_all(&mut record).unwrap();
    assert_eq!(record.event_count(), 1000);
    assert_eq!(record.events()[0].timestamp, 1_000_000);
    assert_eq!(record.events()[999].timestamp, 50_950_000);
}

#[test]
fn test_full_payload_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("payloads.sbt");

    let mut launch = TraceEvent::new(EventKind::KernelLaunch);
    launch.timestamp = 10;
    launch.duration = 0;
    launch.device_id = 1;
    launch.stream_id = 2;
    launch.correlation_id = 99;
    launch.thread_id = 4242;
    launch.name = "fused_attention".to_string();
    launch.kernel_params = Some(KernelParams {
        grid: (16, 8, 1),
        block: (128, 1, 1),
        shared_mem_bytes: 49152,
        registers_per_thread: 255,
        warp_size: 32,
    });
    launch.flow_info = Some(FlowInfo {
        id: 99,
        flow_type: FLOW_TYPE_KERNEL,
        is_start: true,
    });
    launch.call_stack = Some(CallStack {
        frames: vec![
            StackFrame {
                address: 0x7fff_dead_beef,
                function: Some("launch_kernel".to_string()),
                file: Some("runtime.rs".to_string()),
                line: Some(42),
            },
            StackFrame {
                address: 0x401000,
                function: None,
                file: None,
                line: None,
            },
        ],
    });
    launch.set_metadata("framework", "torch");
    launch.set_metadata("step", "12");

    let mut copy = TraceEvent::new(EventKind::MemcpyD2H);
    copy.timestamp = 20;
    copy.duration = 5;
    copy.memory_params = Some(MemoryParams {
        src_addr: 0xd000_0000,
        dst_addr: 0x7000_0000,
        bytes: 1 << 20,
        is_async: true,
    });

    let devices = vec![DeviceInfo {
        device_id: 0,
        vendor: "NVIDIA".to_string(),
        name: "H100".to_string(),
        compute_major: 9,
        compute_minor: 0,
        total_memory: 80 << 30,
        multiprocessor_count: 132,
        clock_rate_khz: 1_980_000,
        metadata: vec![("pcie".to_string(), "gen5".to_string())],
    }];

    let mut writer = SbtWriter::open(&path).unwrap();
    writer.write_device_info(&devices).unwrap();
    writer.write_event(&launch).unwrap();
    writer.write_event(&copy).unwrap();
    writer.finalize().unwrap();

    let reader = SbtReader::open(&path).unwrap();
    let mut record = TraceRecord::new();
    reader.read_all(&mut record).unwrap();

    assert_eq!(record.devices, devices);
    assert_eq!(record.events().len(), 2);
    assert_eq!(record.events()[0], launch);
    assert_eq!(record.events()[1], copy);
}

#[test]
fn test_header_sections_strictly_increasing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("layout.sbt");

    let mut writer = SbtWriter::open(&path).unwrap();
    writer
        .write_metadata(&TraceMetadata {
            application: "layout".to_string(),
            ..Default::default()
        })
        .unwrap();
    for event in synthetic_events().iter().take(10) {
        writer.write_event(event).unwrap();
    }
    writer.finalize().unwrap();
    let file_size = writer.file_size().unwrap();

    let data = std::fs::read(&path).unwrap();
    let header = SbtHeader::decode(&data).unwrap();
    assert_eq!(header.event_count, 10);

    let offsets = [
        SBT_HEADER_SIZE as u64,
        header.metadata_offset,
        header.string_table_offset,
        header.device_info_offset,
        header.events_offset,
    ];
    assert_eq!(offsets[0], header.metadata_offset);
    for pair in offsets.windows(2).skip(1) {
        assert!(pair[0] < pair[1], "sections overlap: {offsets:?}");
    }
    assert!(header.events_offset < file_size);
}

#[test]
fn test_empty_trace_round_trips() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.sbt");

    let mut writer = SbtWriter::open(&path).unwrap();
    writer.finalize().unwrap();

    let reader = SbtReader::open(&path).unwrap();
    assert_eq!(reader.event_count(), 0);
    let mut record = TraceRecord::new();
    reader.read_all(&mut record).unwrap();
    assert_eq!(record.event_count(), 0);
}

#[test]
fn test_writer_refuses_after_finalize() {
    let dir = TempDir::new().unwrap();
    let mut writer = SbtWriter::open(dir.path().join("sealed.sbt")).unwrap();
    writer.finalize().unwrap();
    let event = TraceEvent::new(EventKind::Marker);
    assert!(writer.write_event(&event).is_err());
    assert!(writer.finalize().is_err());
}

#[test]
fn test_garbage_file_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("garbage.sbt");
    std::fs::write(&path, vec![0xABu8; 256]).unwrap();
    assert!(SbtReader::open(&path).is_err());
}
