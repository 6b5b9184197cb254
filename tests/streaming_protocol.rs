//! Integration tests for the frame lifetime protocol.
//!
//! These tests verify that:
//! 1. Frames arrive in order with strictly increasing sequence numbers
//! 2. A frame reads as retired once its successor is published
//! 3. The newest unextracted frame is never reported stale
//! 4. Cancelling the governing scope ends iteration promptly
//! 5. A fast consumer sees every frame fresh; a slow one sees every frame stale
//! 6. The file device streams stub, still and directory sources

use anyhow::Result;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use lipovision::{
    frame_pipe, open_device, Device, DeviceKind, DropletConfig, FileConfig, FileDevice,
    FrameProcessor, Sinks, StreamScope, StreamSession, ViewerConfig, DEFAULT_QUEUE_DEPTH,
};

fn red_of(image: &DynamicImage) -> u8 {
    image.to_rgb8().get_pixel(0, 0)[0]
}

fn write_still(path: &Path, shade: u8) {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 6, Rgb([shade, 0, 0])));
    image
        .save_with_format(path, ImageFormat::Png)
        .expect("write still");
}

fn file_config(path: &str, target_fps: u32) -> FileConfig {
    FileConfig {
        path: path.to_string(),
        target_fps,
        ..FileConfig::default()
    }
}

// ----------------------------------------------------------------------------
// Pipe-level properties
// ----------------------------------------------------------------------------

#[test]
fn frames_are_delivered_in_publication_order() -> Result<()> {
    let scope = StreamScope::new();
    let (mut publisher, stream) = frame_pipe::<u32>(&scope, 32);
    for value in 1..=20 {
        publisher.publish(value)?;
    }
    publisher.close();

    let frames: Vec<_> = stream.collect();
    let sequences: Vec<u64> = frames.iter().map(|frame| frame.sequence()).collect();
    assert_eq!(sequences, (1..=20).collect::<Vec<u64>>());
    let values: Vec<u32> = frames.into_iter().map(|frame| frame.into_image()).collect();
    assert_eq!(values, (1..=20).collect::<Vec<u32>>());
    Ok(())
}

#[test]
fn predecessor_reads_retired_and_newest_stays_live() -> Result<()> {
    let scope = StreamScope::new();
    let (mut publisher, mut stream) = frame_pipe::<u32>(&scope, 4);

    publisher.publish(1)?;
    let first = stream.next().expect("first frame");
    assert!(!first.is_retired());

    publisher.publish(2)?;
    assert!(first.is_retired());
    let second = stream.next().expect("second frame");
    assert!(!second.is_retired());

    // Checking does not consume or retire.
    assert!(!second.is_retired());
    let lifetime = second.lifetime();
    assert_eq!(second.into_image(), 2);
    assert!(lifetime.is_retired());
    Ok(())
}

#[test]
fn cancellation_retires_outstanding_frames() -> Result<()> {
    let root = StreamScope::new();
    let scope = root.child();
    let (mut publisher, stream) = frame_pipe::<u32>(&scope, 4);
    publisher.publish(7)?;

    root.cancel();
    root.cancel();
    assert!(publisher.publish(8).is_err());
    publisher.close();

    let frames: Vec<_> = stream.collect();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is_retired());
    Ok(())
}

#[test]
fn cancellation_ends_iteration_within_queue_bound() -> Result<()> {
    let depth = 4;
    let device = FileDevice::new(FileConfig {
        queue_depth: depth,
        ..file_config("stub://bounded", 1000)
    })?;
    let scope = StreamScope::new();
    let mut stream = device.stream(&scope)?;
    for _ in 0..5 {
        stream.next().expect("frame before cancel");
    }

    scope.cancel();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut after_cancel = 0;
    loop {
        assert!(Instant::now() < deadline, "stream did not close after cancel");
        match stream.next_timeout(Duration::from_millis(100)) {
            Ok(Some(frame)) => {
                assert!(frame.is_retired());
                after_cancel += 1;
            }
            Ok(None) => continue,
            Err(_) => break,
        }
    }
    assert!(after_cancel <= depth + 1, "got {} frames", after_cancel);
    Ok(())
}

// ----------------------------------------------------------------------------
// Consumer timing scenarios
// ----------------------------------------------------------------------------

#[test]
fn fast_consumer_sees_every_frame_fresh() -> Result<()> {
    let scope = StreamScope::new();
    let (mut publisher, stream) = frame_pipe::<u32>(&scope, 10);

    let timeout_scope = scope.clone();
    thread::spawn(move || {
        timeout_scope.sleep(Duration::from_millis(200));
        timeout_scope.cancel();
    });

    let producer = thread::spawn(move || {
        for value in 1..=20u32 {
            if publisher.publish(value).is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        publisher.close();
    });

    let mut last = 0u32;
    let mut received = 0u32;
    for frame in stream {
        assert!(!frame.is_retired(), "frame {} was stale", frame.sequence());
        let value = frame.into_image();
        assert_eq!(value, last + 1);
        last = value;
        received += 1;
    }
    producer.join().expect("producer thread");
    assert_eq!(received, 20);
    Ok(())
}

#[test]
fn slow_consumer_sees_every_frame_stale() -> Result<()> {
    let scope = StreamScope::new();
    let (mut publisher, stream) = frame_pipe::<u32>(&scope, 10);

    let timeout_scope = scope.clone();
    thread::spawn(move || {
        timeout_scope.sleep(Duration::from_millis(300));
        timeout_scope.cancel();
    });

    let producer = thread::spawn(move || {
        for value in 1..=20u32 {
            if publisher.publish(value).is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
            publisher.retire_current();
        }
        publisher.close();
    });

    let mut received = 0u32;
    let mut skipped = 0u32;
    for frame in stream {
        received += 1;
        thread::sleep(Duration::from_millis(10));
        if frame.is_retired() {
            skipped += 1;
        }
    }
    producer.join().expect("producer thread");
    assert!(received > 0);
    assert_eq!(skipped, received);
    Ok(())
}

#[test]
fn processor_skips_what_a_slow_consumer_missed() -> Result<()> {
    let scope = StreamScope::new();
    let (mut publisher, stream) = frame_pipe::<u32>(&scope, 32);
    for value in 1..=10 {
        publisher.publish(value)?;
    }
    publisher.close();

    let stats = FrameProcessor::new().run(stream, Sinks::new().with("noop", |_: &u32| {}));
    assert_eq!(stats.processed + stats.skipped, 10);
    assert_eq!(stats.processed, 1);
    Ok(())
}

// ----------------------------------------------------------------------------
// File device
// ----------------------------------------------------------------------------

#[test]
fn stub_source_streams_in_order() -> Result<()> {
    let device = FileDevice::new(file_config("stub://ordered", 200))?;
    assert!(device.available());

    let scope = StreamScope::new();
    let stream = device.stream(&scope)?;
    let mut seen = Vec::new();
    for frame in stream.take(10) {
        let sequence = frame.sequence();
        let image = frame.into_image();
        seen.push((sequence, red_of(&image)));
    }
    scope.cancel();

    for (index, (sequence, red)) in seen.iter().enumerate() {
        assert_eq!(*sequence, index as u64 + 1);
        assert_eq!(u64::from(*red), *sequence % 256);
    }
    Ok(())
}

#[test]
fn stub_source_respects_target_fps() -> Result<()> {
    let device = FileDevice::new(file_config("stub://paced", 50))?;
    let scope = StreamScope::new();
    let stream = device.stream(&scope)?;

    let started = Instant::now();
    let count = stream.take(6).count();
    let elapsed = started.elapsed();
    scope.cancel();

    assert_eq!(count, 6);
    // Six frames at 50 fps need at least five 20 ms intervals.
    assert!(elapsed >= Duration::from_millis(95), "elapsed {:?}", elapsed);
    Ok(())
}

#[test]
fn image_directory_plays_once_and_closes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_still(&dir.path().join("00.png"), 10);
    write_still(&dir.path().join("01.png"), 20);
    write_still(&dir.path().join("02.png"), 30);
    std::fs::write(dir.path().join("03-broken.png"), b"not a png")?;
    std::fs::write(dir.path().join("notes.txt"), b"ignored")?;

    let path = dir.path().to_string_lossy().to_string();
    let device = FileDevice::new(file_config(&path, 100))?;
    let scope = StreamScope::new();
    let shades: Vec<u8> = device
        .stream(&scope)?
        .map(|frame| red_of(&frame.into_image()))
        .collect();

    assert_eq!(shades, vec![10, 20, 30]);
    Ok(())
}

#[test]
fn looping_directory_restarts_from_first_still() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_still(&dir.path().join("a.png"), 1);
    write_still(&dir.path().join("b.png"), 2);

    let path = dir.path().to_string_lossy().to_string();
    let device = FileDevice::new(FileConfig {
        looping: true,
        ..file_config(&path, 200)
    })?;
    let scope = StreamScope::new();
    let shades: Vec<u8> = device
        .stream(&scope)?
        .take(5)
        .map(|frame| red_of(&frame.into_image()))
        .collect();
    scope.cancel();

    assert_eq!(shades, vec![1, 2, 1, 2, 1]);
    Ok(())
}

#[test]
fn single_still_is_one_frame() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let still = dir.path().join("snapshot.png");
    write_still(&still, 77);

    let device = FileDevice::new(file_config(&still.to_string_lossy(), 30))?;
    let scope = StreamScope::new();
    let frames: Vec<_> = device.stream(&scope)?.collect();
    assert_eq!(frames.len(), 1);
    assert!(!frames[0].is_retired());
    Ok(())
}

#[test]
fn file_device_rejects_bad_sources() -> Result<()> {
    let empty = tempfile::tempdir()?;
    let empty_path = empty.path().to_string_lossy().to_string();

    assert!(FileDevice::new(file_config(&empty_path, 30)).is_err());
    assert!(FileDevice::new(file_config("/definitely/not/here.png", 30)).is_err());
    assert!(FileDevice::new(file_config("http://example.com/run.mp4", 30)).is_err());
    assert!(FileDevice::new(file_config("", 30)).is_err());
    assert!(FileDevice::new(file_config("stub://zero", 0)).is_err());
    Ok(())
}

// ----------------------------------------------------------------------------
// Sessions
// ----------------------------------------------------------------------------

#[test]
fn switching_devices_cancels_previous_stream() -> Result<()> {
    let mut config = ViewerConfig {
        device: DeviceKind::File,
        queue_depth: DEFAULT_QUEUE_DEPTH,
        file: file_config("stub://first", 200),
        droplet: DropletConfig::default(),
    };
    config.validate()?;

    let mut session = StreamSession::new(StreamScope::new());
    session.switch_to(open_device(&config)?, Sinks::new())?;
    thread::sleep(Duration::from_millis(50));
    assert!(!session.is_finished());

    config.file.path = "stub://second".to_string();
    session.switch_to(open_device(&config)?, Sinks::new())?;
    assert_eq!(
        session.device().map(|device| device.name().to_string()),
        Some("stub://second".to_string())
    );
    thread::sleep(Duration::from_millis(50));

    let stats = session.shutdown().expect("active stream");
    assert!(stats.processed + stats.skipped > 0);
    Ok(())
}
