mod common;

use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use common::{mjpeg_bytes, params, pattern, reader, resized};
use vreader::{
    DeviceSelector, FourCC, FrameBuffer, FrameParameters, FrameRateMode, PipelineState,
    SessionState, Status, VReaderError, VideoReader,
};

#[test]
fn blocking_consumer_sees_every_index_once() {
    let (mut reader, _registry) = reader();
    let status = reader.init_pipeline(&pattern(16, 8, 200, 40), 64, 0, 2, FrameRateMode::Blocking);
    assert_eq!(status, Status::Ok);

    thread::scope(|s| {
        s.spawn(|| reader.start_processing());
        let served: Vec<u64> = (0..40)
            .map(|_| {
                reader
                    .get_frame("main", Duration::ZERO, &params(FourCC::Rgb24))
                    .unwrap()
                    .1
            })
            .collect();
        assert_eq!(served, (0..40).collect::<Vec<u64>>());
        assert!(matches!(
            reader.get_frame("main", Duration::ZERO, &params(FourCC::Rgb24)),
            Err(VReaderError::EndOfStream)
        ));
    });
    assert_eq!(reader.state(), Some(PipelineState::Closed));
}

#[test]
fn fast_consumer_indices_strictly_increase() {
    let (mut reader, _registry) = reader();
    let uri = format!("{}&live", pattern(16, 8, 200, 60));
    assert!(reader.init_pipeline(&uri, 4, 0, 2, FrameRateMode::Fast).is_ok());

    let served = thread::scope(|s| {
        s.spawn(|| reader.start_processing());
        let mut served = Vec::new();
        loop {
            match reader.get_frame("fast", Duration::from_millis(12), &params(FourCC::Y800)) {
                Ok((buffer, index)) => {
                    assert_eq!(buffer.data.len(), 16 * 8);
                    served.push(index);
                }
                Err(VReaderError::EndOfStream) => break,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        served
    });

    assert!(!served.is_empty());
    assert!(served.windows(2).all(|w| w[1] > w[0]), "{served:?}");
    assert!(*served.last().unwrap() <= 59);
    // A consumer slower than the source skips frames
    assert!(served.len() < 60);
}

fn pull(reader: &VideoReader, name: &str, p: &FrameParameters) -> Vec<(FrameBuffer, u64)> {
    (0..20)
        .map(|_| reader.get_frame(name, Duration::ZERO, p).unwrap())
        .collect()
}

#[test]
fn consumers_with_different_formats_are_deterministic() {
    let (mut reader, _registry) = reader();
    reader.init_pipeline(&pattern(32, 16, 500, 20), 32, 0, 2, FrameRateMode::Blocking);
    let rgb = resized(16, 8, FourCC::Rgb24);
    let gray = params(FourCC::Y800);

    let (rgb_frames, gray_frames) = thread::scope(|s| {
        s.spawn(|| reader.start_processing());
        let shared = &reader;
        let a = s.spawn(move || pull(shared, "rgb", &rgb));
        let b = s.spawn(move || pull(shared, "gray", &gray));
        (a.join().unwrap(), b.join().unwrap())
    });

    for (buffer, index) in &rgb_frames {
        assert_eq!((buffer.width, buffer.height, buffer.fourcc), (16, 8, FourCC::Rgb24));
        let again = reader.get_frame_absolute(&[*index], &rgb).unwrap();
        assert_eq!(&again[0], buffer);
    }
    for (buffer, index) in &gray_frames {
        assert_eq!(buffer.data.len(), 32 * 16);
        let again = reader.get_frame_absolute(&[*index], &gray).unwrap();
        assert_eq!(&again[0], buffer);
    }
}

#[test]
fn independent_instances_run_concurrently() {
    let (mut first, registry) = reader();
    let mut second = VideoReader::builder()
        .registry(std::sync::Arc::clone(&registry))
        .build();
    first.init_pipeline(&pattern(8, 8, 300, 15), 16, DeviceSelector::Any, 2, FrameRateMode::Blocking);
    second.init_pipeline(&pattern(12, 6, 300, 15), 16, DeviceSelector::Any, 2, FrameRateMode::Blocking);

    thread::scope(|s| {
        for reader in [&first, &second] {
            s.spawn(move || reader.start_processing());
            s.spawn(move || {
                let served: Vec<u64> = (0..15)
                    .map(|_| {
                        reader
                            .get_frame("c", Duration::ZERO, &params(FourCC::Nv12))
                            .unwrap()
                            .1
                    })
                    .collect();
                assert_eq!(served, (0..15).collect::<Vec<u64>>());
            });
        }
    });
    assert!(registry.total_reserved() > 0);
    drop(first);
    drop(second);
    assert_eq!(registry.total_reserved(), 0);
}

#[test]
fn shutdown_releases_blocked_consumer_promptly() {
    let (mut reader, _registry) = reader();
    // One frame per second keeps the consumer waiting on frame 1
    reader.init_pipeline(&pattern(8, 8, 1, 10), 2, 0, 10, FrameRateMode::Blocking);

    thread::scope(|s| {
        let decoder = s.spawn(|| reader.start_processing());
        let consumer = s.spawn(|| {
            let first = reader.get_frame("slow", Duration::ZERO, &params(FourCC::Rgb24));
            let second = reader.get_frame("slow", Duration::ZERO, &params(FourCC::Rgb24));
            (first.map(|f| f.1), second.map(|f| f.1), Instant::now())
        });

        thread::sleep(Duration::from_millis(150));
        let stopped = Instant::now();
        reader.end_processing();
        reader.end_processing();

        let (first, second, returned) = consumer.join().unwrap();
        assert_eq!(first.unwrap(), 0);
        assert!(matches!(second, Err(VReaderError::Closed)));
        assert!(returned.duration_since(stopped) < Duration::from_millis(200));
        decoder.join().unwrap();
    });

    assert_eq!(reader.state(), Some(PipelineState::Closed));
    assert_eq!(reader.session_state("slow"), None);
    assert!(matches!(
        reader.get_frame("other", Duration::ZERO, &params(FourCC::Rgb24)),
        Err(VReaderError::Closed)
    ));
    reader.end_processing();
}

#[test]
fn delay_sets_delivery_cadence() {
    let (mut reader, _registry) = reader();
    reader.init_pipeline(&pattern(8, 8, 200, 200), 64, 0, 2, FrameRateMode::Blocking);
    let delay = Duration::from_millis(40);

    let stamps = thread::scope(|s| {
        s.spawn(|| reader.start_processing());
        let stamps: Vec<Instant> = (0..6)
            .map(|_| {
                reader
                    .get_frame("paced", delay, &params(FourCC::Rgb24))
                    .unwrap();
                Instant::now()
            })
            .collect();
        reader.end_processing();
        stamps
    });

    for gap in stamps.windows(2).map(|w| w[1] - w[0]) {
        assert!(gap >= Duration::from_millis(38), "{gap:?}");
        assert!(gap <= Duration::from_millis(80), "{gap:?}");
    }
}

#[test]
fn slow_blocking_consumer_misses_nothing_with_a_small_store() {
    let (mut reader, _registry) = reader();
    // One frame every 20 ms, one request every 60 ms, five frames of room
    reader.init_pipeline(&pattern(8, 8, 50, 40), 5, 0, 1, FrameRateMode::Blocking);

    let served = thread::scope(|s| {
        s.spawn(|| reader.start_processing());
        let served: Vec<u64> = (0..12)
            .map(|_| {
                reader
                    .get_frame("slow", Duration::from_millis(60), &params(FourCC::Y800))
                    .unwrap()
                    .1
            })
            .collect();
        reader.end_processing();
        served
    });
    assert_eq!(served, (0..12).collect::<Vec<u64>>());
}

fn indices(reader: &VideoReader, name: &str, delay: Duration, count: usize) -> Vec<u64> {
    (0..count)
        .map(|_| reader.get_frame(name, delay, &params(FourCC::Y800)).unwrap().1)
        .collect()
}

#[test]
fn blocking_consumers_at_different_speeds_each_see_every_frame() {
    let (mut reader, _registry) = reader();
    reader.init_pipeline(&pattern(8, 8, 100, 24), 5, 0, 2, FrameRateMode::Blocking);

    let (quick, slow) = thread::scope(|s| {
        s.spawn(|| reader.start_processing());
        let quick = s.spawn(|| indices(&reader, "quick", Duration::ZERO, 24));
        let slow = s.spawn(|| indices(&reader, "slow", Duration::from_millis(15), 24));
        (quick.join().unwrap(), slow.join().unwrap())
    });
    let all: Vec<u64> = (0..24).collect();
    assert_eq!(quick, all);
    assert_eq!(slow, all);
}

#[test]
fn idle_blocking_consumer_stops_holding_the_decoder_after_a_timeout() {
    let (mut reader, _registry) = reader();
    reader.init_pipeline(&pattern(8, 8, 100, 60), 5, 0, 2, FrameRateMode::Blocking);
    reader.set_timeout(200);

    thread::scope(|s| {
        s.spawn(|| reader.start_processing());
        let p = params(FourCC::Y800);
        assert_eq!(reader.get_frame("idle", Duration::ZERO, &p).unwrap().1, 0);

        let mut steady = Vec::new();
        while steady.len() < 15 {
            match reader.get_frame("steady", Duration::ZERO, &p) {
                Ok((_, index)) => steady.push(index),
                Err(e) if e.is_recoverable() => continue,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert!(steady.windows(2).all(|w| w[1] == w[0] + 1), "{steady:?}");
        assert!(*steady.last().unwrap() > 5);

        // The idle consumer lost frames while away and resumes past them
        assert!(matches!(
            reader.get_frame("idle", Duration::ZERO, &p),
            Err(VReaderError::FrameExpired { requested: 1, .. })
        ));
        assert!(reader.get_frame("idle", Duration::ZERO, &p).unwrap().1 > 1);
        reader.end_processing();
    });
}

#[test]
fn blocking_delivery_tracks_native_interval() {
    let (mut reader, _registry) = reader();
    reader.init_pipeline(&pattern(8, 8, 50, 30), 32, 0, 2, FrameRateMode::Blocking);
    assert_eq!(reader.frame_interval(), Some(Duration::from_millis(20)));

    let stamps = thread::scope(|s| {
        s.spawn(|| reader.start_processing());
        let stamps: Vec<Instant> = (0..16)
            .map(|_| {
                reader
                    .get_frame("native", Duration::ZERO, &params(FourCC::Y800))
                    .unwrap();
                Instant::now()
            })
            .collect();
        reader.end_processing();
        stamps
    });

    // Average over ten intervals after warm-up
    let average = (stamps[15] - stamps[5]) / 10;
    assert!(average >= Duration::from_millis(15), "{average:?}");
    assert!(average <= Duration::from_millis(30), "{average:?}");
    let metrics = reader.metrics();
    assert_eq!(metrics.frames_delivered, 16);
    assert!(metrics.max_latency_ms >= metrics.avg_latency_ms);
}

#[test]
fn timeout_is_recoverable() {
    let (mut reader, _registry) = reader();
    reader.init_pipeline(&pattern(8, 8, 4, 3), 4, 0, 2, FrameRateMode::Blocking);

    thread::scope(|s| {
        s.spawn(|| reader.start_processing());
        assert_eq!(
            reader
                .get_frame("t", Duration::ZERO, &params(FourCC::Rgb24))
                .unwrap()
                .1,
            0
        );
        reader.set_timeout(100);
        let start = Instant::now();
        let err = reader
            .get_frame("t", Duration::ZERO, &params(FourCC::Rgb24))
            .unwrap_err();
        assert!(matches!(err, VReaderError::Timeout(_)));
        assert!(err.is_recoverable());
        assert!(start.elapsed() < Duration::from_millis(240));
        assert_eq!(reader.session_state("t"), Some(SessionState::Idle));

        reader.set_timeout(2_000);
        assert_eq!(
            reader
                .get_frame("t", Duration::ZERO, &params(FourCC::Rgb24))
                .unwrap()
                .1,
            1
        );
        reader.end_processing();
    });
    assert!(reader.metrics().read_timeouts >= 1);
}

#[test]
fn decoder_fault_only_ends_its_own_instance() {
    let (mut faulty, registry) = reader();
    let mut healthy = VideoReader::builder()
        .registry(std::sync::Arc::clone(&registry))
        .build();
    let broken = format!("{}&fail_at=5", pattern(8, 8, 400, 20));
    faulty.init_pipeline(&broken, 32, 0, 2, FrameRateMode::Blocking);
    healthy.init_pipeline(&pattern(8, 8, 400, 20), 32, 0, 2, FrameRateMode::Blocking);

    thread::scope(|s| {
        s.spawn(|| faulty.start_processing());
        s.spawn(|| healthy.start_processing());

        for expected in 0..5 {
            let (_, index) = faulty
                .get_frame("c", Duration::ZERO, &params(FourCC::Rgb24))
                .unwrap();
            assert_eq!(index, expected);
        }
        assert!(matches!(
            faulty.get_frame("c", Duration::ZERO, &params(FourCC::Rgb24)),
            Err(VReaderError::Decode(_))
        ));

        for expected in 0..20 {
            let (_, index) = healthy
                .get_frame("c", Duration::ZERO, &params(FourCC::Rgb24))
                .unwrap();
            assert_eq!(index, expected);
        }
    });
}

#[test]
fn mjpeg_file_streams_and_dumps() {
    let mut file = tempfile::Builder::new().suffix(".mjpeg").tempfile().unwrap();
    file.write_all(&mjpeg_bytes(16, 8, 3)).unwrap();
    let uri = file.path().to_str().unwrap().to_owned();

    let (mut reader, _registry) = reader();
    assert!(reader.init_pipeline(&uri, 4, 0, 2, FrameRateMode::Blocking).is_ok());
    assert_eq!(reader.total_frames(), Some(3));

    let dir = tempfile::tempdir().unwrap();
    let p = params(FourCC::Nv12);
    thread::scope(|s| {
        s.spawn(|| reader.start_processing());
        for expected in 0..3u64 {
            let (buffer, index) = reader.get_frame("dump", Duration::ZERO, &p).unwrap();
            assert_eq!(index, expected);
            let path = dir.path().join(format!("frame_{index}.raw"));
            let mut out = std::fs::File::create(&path).unwrap();
            assert_eq!(reader.dump_frame(&buffer, &p, &mut out), Status::Ok);
            drop(out);
            assert_eq!(std::fs::metadata(&path).unwrap().len(), 16 * 8 * 3 / 2);
        }
    });
}

#[test]
fn init_failures_report_error_status() {
    let (mut reader, registry) = reader();
    assert_eq!(
        reader.init_pipeline("/no/such/video.mjpeg", 4, 0, 1, FrameRateMode::Blocking),
        Status::Error
    );
    // Only one device is configured
    assert_eq!(
        reader.init_pipeline(&pattern(8, 8, 30, 5), 4, 3, 1, FrameRateMode::Blocking),
        Status::Error
    );
    assert_eq!(registry.total_reserved(), 0);
    assert_eq!(
        reader.init_pipeline(&pattern(8, 8, 30, 5), 4, -1, 1, FrameRateMode::Blocking),
        Status::Ok
    );
}
