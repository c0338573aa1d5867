//! End-to-end flows through the public facade: write containers, mount
//! them, and read through the dispatcher.

use iostore::prelude::*;
use iostore::{CodecRegistry, ContainerWriterSettings};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn chunk(package: u64) -> ChunkId {
    ChunkId::new(package, 0, ChunkType::BulkData)
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_store_and_fetch_small_chunk() {
    init_tracing();
    let dir = tempdir().unwrap();

    let mut writer =
        ContainerWriter::new("hello", ContainerWriterSettings::default()).unwrap();
    writer
        .append(chunk(1), IoBuffer::from_vec(b"HELLO".to_vec()), WriteOptions::default())
        .unwrap();
    writer.finish(dir.path()).unwrap();

    let dispatcher = IoDispatcher::new(DispatcherConfig::default()).unwrap();
    dispatcher.mount(dir.path(), "hello", 0).unwrap();

    let buffer = dispatcher.read_chunk(chunk(1), IoPriority::MEDIUM).unwrap();
    assert_eq!(buffer.as_slice(), b"HELLO");

    let info = dispatcher.chunk_info(chunk(1)).unwrap();
    assert_eq!(info.size, 5);
    assert_eq!(info.hash, ChunkHash::from_data(b"HELLO"));
}

#[test]
fn test_sub_range_read_across_block_boundary() {
    init_tracing();
    let dir = tempdir().unwrap();

    let settings = ContainerWriterSettings {
        compression_block_size: 4096,
        compression_method: Some("Zlib".to_string()),
        ..ContainerWriterSettings::default()
    };
    let mut writer = ContainerWriter::new("ranged", settings).unwrap();
    let payload = patterned(12_000);
    writer
        .append(chunk(1), IoBuffer::from_vec(payload.clone()), WriteOptions::default())
        .unwrap();
    writer.finish(dir.path()).unwrap();

    let dispatcher = IoDispatcher::new(DispatcherConfig::default()).unwrap();
    dispatcher.mount(dir.path(), "ranged", 0).unwrap();

    // Spans the first block boundary at 4096
    let buffer = dispatcher
        .read(chunk(1), 4000, 200, IoPriority::HIGH)
        .unwrap();
    assert_eq!(buffer.as_slice(), &payload[4000..4200]);

    // Clamped and zero-size reads succeed
    let tail = dispatcher
        .read(chunk(1), 11_990, 500, IoPriority::MEDIUM)
        .unwrap();
    assert_eq!(tail.as_slice(), &payload[11_990..]);
    assert!(dispatcher
        .read(chunk(1), 5, 0, IoPriority::MEDIUM)
        .unwrap()
        .is_empty());
}

#[test]
fn test_callbacks_fire_exactly_once_under_cancellation() {
    init_tracing();
    let dir = tempdir().unwrap();

    let settings = ContainerWriterSettings {
        compression_block_size: 1024,
        build_directory_index: false,
        ..ContainerWriterSettings::default()
    };
    let mut writer = ContainerWriter::new("cancel", settings).unwrap();
    for package in 1..=16u64 {
        writer
            .append(chunk(package), IoBuffer::from_vec(patterned(8_000)), WriteOptions::default())
            .unwrap();
    }
    writer.finish(dir.path()).unwrap();

    let dispatcher = IoDispatcher::new(DispatcherConfig {
        worker_count: 1,
        ..DispatcherConfig::default()
    })
    .unwrap();
    dispatcher.mount(dir.path(), "cancel", 0).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let mut batch = dispatcher.new_batch();
    let requests: Vec<IoRequest> = (1..=16u64)
        .map(|package| {
            let count = Arc::clone(&fired);
            batch.read_with_callback(
                chunk(package),
                0,
                u64::MAX,
                IoPriority::MEDIUM,
                move |request| {
                    assert!(request.status().is_terminal());
                    count.fetch_add(1, Ordering::SeqCst);
                },
            )
        })
        .collect();

    let event = IoEvent::new();
    batch.issue_and_trigger_event(&event);
    // Race cancellation against the worker; whichever side wins, each
    // request must complete exactly once
    for request in &requests {
        request.cancel();
    }
    event.wait();

    assert_eq!(fired.load(Ordering::SeqCst), 16);
    for request in &requests {
        let status = request.status();
        assert!(status.is_ok() || status.is_cancelled(), "status {:?}", status);
    }
}

#[test]
fn test_tampered_block_raises_signature_event() {
    init_tracing();
    let dir = tempdir().unwrap();
    let guid = Uuid::from_u128(0xFEED);
    let key = [0x21u8; 32];
    let private_key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let public_key = private_key.to_public_key();

    let settings = ContainerWriterSettings {
        compression_block_size: 1024,
        encryption: Some((guid, key)),
        signing_key: Some(private_key),
        build_directory_index: false,
        ..ContainerWriterSettings::default()
    };
    let mut writer = ContainerWriter::new("secure", settings).unwrap();
    writer
        .append(chunk(1), IoBuffer::from_vec(patterned(6_000)), WriteOptions::default())
        .unwrap();
    writer.finish(dir.path()).unwrap();

    // Flip one ciphertext byte inside block 3
    let cas = dir.path().join("secure.cas");
    let mut bytes = std::fs::read(&cas).unwrap();
    bytes[3 * 1024 + 7] ^= 0x80;
    std::fs::write(&cas, &bytes).unwrap();

    let dispatcher = IoDispatcher::new(DispatcherConfig {
        signature_key: Some(public_key),
        ..DispatcherConfig::default()
    })
    .unwrap();
    dispatcher.register_encryption_key(guid, key);

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    dispatcher.subscribe_signature_errors(move |event| {
        sink.lock().unwrap().push((event.container.clone(), event.block_index));
    });
    dispatcher.mount(dir.path(), "secure", 0).unwrap();

    // The undamaged prefix still reads
    assert!(dispatcher.read(chunk(1), 0, 2048, IoPriority::MEDIUM).is_ok());

    let err = dispatcher
        .read_chunk(chunk(1), IoPriority::MEDIUM)
        .unwrap_err();
    assert!(err.is_signature_error());
    assert_eq!(err.code(), IoErrorCode::SignatureError);

    let events = seen.lock().unwrap();
    assert_eq!(events.as_slice(), &[("secure".to_string(), 3u32)]);
}

#[test]
fn test_patch_container_shadows_base() {
    init_tracing();
    let dir_base = tempdir().unwrap();
    let dir_patch = tempdir().unwrap();

    let settings = || ContainerWriterSettings {
        build_directory_index: false,
        ..ContainerWriterSettings::default()
    };
    let mut writer = ContainerWriter::new("base", settings()).unwrap();
    writer
        .append(chunk(1), IoBuffer::from_vec(b"base v1".to_vec()), WriteOptions::default())
        .unwrap();
    writer
        .append(chunk(2), IoBuffer::from_vec(b"only in base".to_vec()), WriteOptions::default())
        .unwrap();
    writer.finish(dir_base.path()).unwrap();

    let mut writer = ContainerWriter::new("patch", settings()).unwrap();
    writer
        .append(chunk(1), IoBuffer::from_vec(b"patched".to_vec()), WriteOptions::default())
        .unwrap();
    writer.finish(dir_patch.path()).unwrap();

    let dispatcher = IoDispatcher::new(DispatcherConfig::default()).unwrap();
    dispatcher.mount(dir_base.path(), "base", 0).unwrap();
    let patch_id = dispatcher.mount(dir_patch.path(), "patch", 10).unwrap();

    assert_eq!(
        dispatcher.read_chunk(chunk(1), IoPriority::MEDIUM).unwrap().as_slice(),
        b"patched"
    );
    // Ids only in the base still resolve there
    assert_eq!(
        dispatcher.read_chunk(chunk(2), IoPriority::MEDIUM).unwrap().as_slice(),
        b"only in base"
    );

    dispatcher.unmount(patch_id).unwrap();
    assert_eq!(
        dispatcher.read_chunk(chunk(1), IoPriority::MEDIUM).unwrap().as_slice(),
        b"base v1"
    );
}

#[test]
fn test_writer_output_is_deterministic() {
    init_tracing();
    let build = |dir: &std::path::Path| {
        let settings = ContainerWriterSettings {
            compression_block_size: 2048,
            compression_method: Some("Zstd".to_string()),
            mount_point: "/pkg".to_string(),
            ..ContainerWriterSettings::default()
        };
        let mut writer = ContainerWriter::new("repro", settings).unwrap();
        for package in 1..=5u64 {
            writer
                .append(
                    chunk(package),
                    IoBuffer::from_vec(patterned(3_000 * package as usize)),
                    WriteOptions {
                        file_name: Some(format!("data/{}.bin", package)),
                        ..WriteOptions::default()
                    },
                )
                .unwrap();
        }
        writer.finish(dir).unwrap();
    };

    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    build(dir_a.path());
    build(dir_b.path());

    for file in ["repro.toc", "repro.cas"] {
        assert_eq!(
            std::fs::read(dir_a.path().join(file)).unwrap(),
            std::fs::read(dir_b.path().join(file)).unwrap(),
            "{} differs between identical runs",
            file
        );
    }
}

#[test]
fn test_boundary_conditions() {
    init_tracing();
    let dir = tempdir().unwrap();
    let guid = Uuid::from_u128(0xD00F);

    let settings = ContainerWriterSettings {
        compression_block_size: 1024,
        compression_method: Some("Zlib".to_string()),
        ..ContainerWriterSettings::default()
    };
    let mut writer = ContainerWriter::new("edges", settings).unwrap();
    writer
        .append(chunk(1), IoBuffer::empty(), WriteOptions::default())
        .unwrap();
    writer
        .append(chunk(2), IoBuffer::from_vec(patterned(5_000)), WriteOptions::default())
        .unwrap();
    writer.finish(dir.path()).unwrap();

    let dispatcher = IoDispatcher::new(DispatcherConfig::default()).unwrap();
    dispatcher.mount(dir.path(), "edges", 0).unwrap();

    // Empty chunk reads back empty
    assert!(dispatcher
        .read_chunk(chunk(1), IoPriority::MEDIUM)
        .unwrap()
        .is_empty());

    // Mapping a compressed chunk is refused, not silently degraded
    assert!(matches!(
        dispatcher.open_mapped(chunk(2), 0),
        Err(Error::InvalidParameter(_))
    ));

    // Encrypted container without its key never mounts
    let dir_locked = tempdir().unwrap();
    let mut writer = ContainerWriter::new(
        "locked",
        ContainerWriterSettings {
            encryption: Some((guid, [9u8; 32])),
            build_directory_index: false,
            ..ContainerWriterSettings::default()
        },
    )
    .unwrap();
    writer
        .append(chunk(1), IoBuffer::from_vec(vec![1u8; 64]), WriteOptions::default())
        .unwrap();
    writer.finish(dir_locked.path()).unwrap();

    let err = dispatcher.mount(dir_locked.path(), "locked", 5).unwrap_err();
    assert!(matches!(err, Error::InvalidEncryptionKey { .. }));
    assert_eq!(dispatcher.mounted_containers().len(), 1);
}

#[test]
fn test_custom_codec_registry_round_trip() {
    init_tracing();
    let dir = tempdir().unwrap();
    let codecs = Arc::new(CodecRegistry::default());

    let settings = ContainerWriterSettings {
        compression_block_size: 2048,
        compression_method: Some("Zstd".to_string()),
        codecs: Arc::clone(&codecs),
        build_directory_index: false,
        ..ContainerWriterSettings::default()
    };
    let mut writer = ContainerWriter::new("codec", settings).unwrap();
    let payload = patterned(20_000);
    writer
        .append(chunk(1), IoBuffer::from_vec(payload.clone()), WriteOptions::default())
        .unwrap();
    let result = writer.finish(dir.path()).unwrap();
    assert!(result.compression_ratio() < 1.0);

    let dispatcher = IoDispatcher::new(DispatcherConfig {
        codecs,
        ..DispatcherConfig::default()
    })
    .unwrap();
    dispatcher.mount(dir.path(), "codec", 0).unwrap();
    assert_eq!(
        dispatcher.read_chunk(chunk(1), IoPriority::MEDIUM).unwrap().as_slice(),
        payload.as_slice()
    );
}
