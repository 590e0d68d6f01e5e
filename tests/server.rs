mod common;

use common::{
    content_type, det, gif_bytes, multipart, png_bytes, AlternatingDetector, FailingDetector,
    FixedDetector, TrackedSource,
};
use detect_relay::annotate::Annotator;
use detect_relay::detect::{self, Detector};
use detect_relay::server::{annotated_name, Server, ServerConfig, ServerHandle, SourceOpener};
use detect_relay::source::FrameSource;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn no_camera() -> SourceOpener {
    Arc::new(|| -> detect_relay::Result<Box<dyn FrameSource>> {
        Err(detect_relay::Error::source_unavailable(
            "camera 0",
            "no device in tests",
        ))
    })
}

fn start(
    upload_dir: &Path,
    detector: impl Detector + 'static,
    open_camera: SourceOpener,
) -> ServerHandle {
    start_with(upload_dir, detector, open_camera, ServerConfig::default().write_timeout)
}

fn start_with(
    upload_dir: &Path,
    detector: impl Detector + 'static,
    open_camera: SourceOpener,
    write_timeout: Duration,
) -> ServerHandle {
    Server::new(
        ServerConfig {
            addr: "127.0.0.1:0".into(),
            upload_dir: upload_dir.to_path_buf(),
            max_upload_bytes: 4 * 1024 * 1024,
            write_timeout,
        },
        detect::share(detector),
        Annotator::new(),
        open_camera,
    )
    .spawn()
    .unwrap()
}

fn url(handle: &ServerHandle, path: &str) -> String {
    format!("http://{}{}", handle.addr, path)
}

/// Status and JSON body, treating 4xx/5xx as ordinary responses.
fn post_form(handle: &ServerHandle, path: &str, body: &[u8]) -> (u16, Value) {
    let result = ureq::post(&url(handle, path))
        .set("Content-Type", &content_type())
        .send_bytes(body);
    json_of(result)
}

fn json_of(result: Result<ureq::Response, ureq::Error>) -> (u16, Value) {
    let resp = match result {
        Ok(r) => r,
        Err(ureq::Error::Status(_, r)) => r,
        Err(e) => panic!("transport error: {e}"),
    };
    let status = resp.status();
    let text = resp.into_string().unwrap();
    (status, serde_json::from_str(&text).unwrap())
}

fn status_of(result: Result<ureq::Response, ureq::Error>) -> u16 {
    match result {
        Ok(r) => r.status(),
        Err(ureq::Error::Status(code, _)) => code,
        Err(e) => panic!("transport error: {e}"),
    }
}

#[test]
fn health_and_index_are_served() {
    let dir = tempdir().unwrap();
    let server = start(dir.path(), FixedDetector::new(vec![]), no_camera());

    let (status, body) = json_of(ureq::get(&url(&server, "/health")).call());
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    let index = ureq::get(&url(&server, "/")).call().unwrap();
    assert!(index.content_type().starts_with("text/html"));
    assert!(index.into_string().unwrap().contains("camera_feed"));

    assert_eq!(status_of(ureq::get(&url(&server, "/upload")).call()), 405);
    assert_eq!(status_of(ureq::get(&url(&server, "/missing")).call()), 404);
    server.stop().unwrap();
}

#[test]
fn upload_reports_predictions_and_counts() {
    let dir = tempdir().unwrap();
    let detector = FixedDetector::new(vec![
        det("person", 0, 0.91),
        det("person", 0, 0.55),
        det("bicycle", 1, 0.42),
    ]);
    let server = start(dir.path(), detector, no_camera());

    let body = multipart("file", "street.png", &png_bytes(40, 30));
    let (status, json) = post_form(&server, "/upload", &body);
    assert_eq!(status, 200);
    assert_eq!(json["original_image"], "/uploads/street.png");
    assert_eq!(json["detected_image"], "/uploads/detected_street.png");
    assert_eq!(json["label_counts"], serde_json::json!({ "person": 2, "bicycle": 1 }));
    let predictions = json["predictions"].as_array().unwrap();
    assert_eq!(predictions.len(), 3);
    assert_eq!(predictions[2]["label"], "bicycle");
    assert!(json["processing_time"].as_str().unwrap().ends_with(" s"));

    assert!(dir.path().join("street.png").exists());
    assert!(dir.path().join("detected_street.png").exists());
    let served = ureq::get(&url(&server, "/uploads/detected_street.png"))
        .call()
        .unwrap();
    assert_eq!(served.content_type(), "image/png");
    server.stop().unwrap();
}

#[test]
fn upload_without_detections_has_empty_counts() {
    let dir = tempdir().unwrap();
    let server = start(dir.path(), FixedDetector::new(vec![]), no_camera());

    let body = multipart("file", "empty.png", &png_bytes(16, 16));
    let (status, json) = post_form(&server, "/upload", &body);
    assert_eq!(status, 200);
    assert_eq!(json["label_counts"], serde_json::json!({}));
    assert_eq!(json["predictions"], serde_json::json!([]));
    server.stop().unwrap();
}

#[test]
fn upload_rejects_bad_requests() {
    let dir = tempdir().unwrap();
    let server = start(dir.path(), FixedDetector::new(vec![]), no_camera());

    let (status, json) = post_form(&server, "/upload", &multipart("other", "a.png", b"x"));
    assert_eq!(status, 400);
    assert_eq!(json["error"], "No file uploaded");

    let (status, json) = post_form(&server, "/upload", &multipart("file", "", b"x"));
    assert_eq!(status, 400);
    assert_eq!(json["error"], "No file selected");

    let (status, json) = post_form(
        &server,
        "/upload",
        &multipart("file", "junk.png", b"definitely not an image"),
    );
    assert_eq!(status, 400);
    assert_eq!(json["error"], "Invalid image file");
    server.stop().unwrap();
}

#[test]
fn detector_failure_is_a_server_error() {
    let dir = tempdir().unwrap();
    let server = start(dir.path(), FailingDetector, no_camera());

    let body = multipart("file", "a.png", &png_bytes(8, 8));
    let (status, json) = post_form(&server, "/upload", &body);
    assert_eq!(status, 500);
    assert!(json["error"].as_str().unwrap().contains("model exploded"));
    server.stop().unwrap();
}

#[test]
fn video_counts_accumulate_across_frames() {
    let dir = tempdir().unwrap();
    let server = start(
        dir.path(),
        FixedDetector::new(vec![det("cat", 15, 0.8)]),
        no_camera(),
    );

    let body = multipart("file", "clip.gif", &gif_bytes(3));
    let (status, json) = post_form(&server, "/video", &body);
    assert_eq!(status, 200);
    assert_eq!(json["video_path"], "/uploads/clip.gif");
    assert_eq!(json["frames_processed"], 3);
    assert_eq!(json["label_counts"], serde_json::json!({ "cat": 3 }));
    assert_eq!(json["predictions"].as_array().unwrap().len(), 3);
    server.stop().unwrap();
}

#[test]
fn unreadable_video_is_rejected() {
    let dir = tempdir().unwrap();
    let server = start(dir.path(), FixedDetector::new(vec![]), no_camera());

    let body = multipart("file", "clip.mp4", b"\x00\x01 not a container");
    let (status, json) = post_form(&server, "/video", &body);
    assert_eq!(status, 400);
    assert!(json["error"]
        .as_str()
        .unwrap()
        .starts_with("Invalid video file"));
    server.stop().unwrap();
}

#[test]
fn uploads_stay_inside_upload_dir() {
    let root = tempdir().unwrap();
    let uploads = root.path().join("uploads");
    std::fs::write(root.path().join("secret.txt"), b"hidden").unwrap();
    let server = start(&uploads, FixedDetector::new(vec![]), no_camera());

    for path in ["/uploads/..%2Fsecret.txt", "/uploads/..\\secret.txt", "/uploads/nope.png"] {
        assert_eq!(status_of(ureq::get(&url(&server, path)).call()), 404, "{path}");
    }
    server.stop().unwrap();
}

#[test]
fn stop_camera_without_stream_is_ok() {
    let dir = tempdir().unwrap();
    let server = start(dir.path(), FixedDetector::new(vec![]), no_camera());
    for _ in 0..2 {
        let (status, json) = json_of(ureq::post(&url(&server, "/stop_camera")).call());
        assert_eq!(status, 200);
        assert_eq!(json["message"], "Camera stopped successfully");
    }
    server.stop().unwrap();
}

#[test]
fn camera_unavailable_is_reported() {
    let dir = tempdir().unwrap();
    let server = start(dir.path(), FixedDetector::new(vec![]), no_camera());
    let (status, json) = json_of(ureq::get(&url(&server, "/camera_feed")).call());
    assert_eq!(status, 400);
    assert!(json["error"].as_str().unwrap().contains("no device in tests"));
    server.stop().unwrap();
}

/// Reads the feed until the first JPEG part has arrived, then keeps
/// draining it on a background thread until the server closes it.
fn open_feed(server: &ServerHandle) -> std::thread::JoinHandle<usize> {
    open_feed_parts(server, 1)
}

/// Like [`open_feed`], but waits for `parts` JPEG parts first.
fn open_feed_parts(server: &ServerHandle, parts: usize) -> std::thread::JoinHandle<usize> {
    let resp = ureq::get(&url(server, "/camera_feed")).call().unwrap();
    assert!(resp
        .content_type()
        .starts_with("multipart/x-mixed-replace"));
    let mut reader = resp.into_reader();
    let mut seen = Vec::new();
    let mut buf = [0u8; 4096];
    while seen.windows(10).filter(|w| *w == b"image/jpeg").count() < parts {
        let n = reader.read(&mut buf).unwrap();
        assert!(n > 0, "feed closed before first frame");
        seen.extend_from_slice(&buf[..n]);
    }
    std::thread::spawn(move || {
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap_or(0) + seen.len()
    })
}

fn wait_until(done: impl FnMut() -> bool) -> bool {
    wait_for(Duration::from_secs(5), done)
}

fn wait_for(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while !done() {
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    true
}

#[test]
fn camera_feed_releases_device_and_restarts() {
    let dir = tempdir().unwrap();
    let live = Arc::new(AtomicUsize::new(0));
    let opened = Arc::new(AtomicUsize::new(0));
    let (live_c, opened_c) = (live.clone(), opened.clone());
    let opener: SourceOpener = Arc::new(move || {
        opened_c.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TrackedSource::new(
            live_c.clone(),
            None,
            Duration::from_millis(10),
        )) as Box<dyn FrameSource>)
    });
    let server = start(
        dir.path(),
        FixedDetector::new(vec![det("person", 0, 0.7)]),
        opener,
    );

    let feed = open_feed(&server);
    assert_eq!(live.load(Ordering::SeqCst), 1);
    let (status, _) = json_of(ureq::post(&url(&server, "/stop_camera")).call());
    assert_eq!(status, 200);
    assert!(feed.join().unwrap() > 0);
    assert!(wait_until(|| live.load(Ordering::SeqCst) == 0));

    let feed = open_feed(&server);
    assert_eq!(opened.load(Ordering::SeqCst), 2);
    assert_eq!(live.load(Ordering::SeqCst), 1);
    json_of(ureq::post(&url(&server, "/stop_camera")).call());
    feed.join().unwrap();
    assert!(wait_until(|| live.load(Ordering::SeqCst) == 0));
    server.stop().unwrap();
}

#[test]
fn newer_feed_preempts_older_one() {
    let dir = tempdir().unwrap();
    let live = Arc::new(AtomicUsize::new(0));
    let live_c = live.clone();
    let opener: SourceOpener = Arc::new(move || {
        Ok(Box::new(TrackedSource::new(
            live_c.clone(),
            None,
            Duration::from_millis(10),
        )) as Box<dyn FrameSource>)
    });
    let server = start(dir.path(), FixedDetector::new(vec![]), opener);

    let first = open_feed(&server);
    let second = open_feed(&server);
    // The older stream ends on its own once the newer one takes the device.
    first.join().unwrap();
    assert_eq!(live.load(Ordering::SeqCst), 1);

    json_of(ureq::post(&url(&server, "/stop_camera")).call());
    second.join().unwrap();
    assert!(wait_until(|| live.load(Ordering::SeqCst) == 0));
    server.stop().unwrap();
}

#[test]
fn annotated_name_keeps_writable_formats() {
    assert_eq!(annotated_name("a.png"), "detected_a.png");
    assert_eq!(annotated_name("b.jpeg"), "detected_b.jpeg");
    assert_eq!(annotated_name("c.unknown"), "detected_c.unknown.jpg");
}

#[test]
fn annotated_copy_falls_back_to_jpeg_when_format_cannot_hold_it() {
    let dir = tempdir().unwrap();
    let server = start(dir.path(), FixedDetector::new(vec![]), no_camera());

    // ICO caps sides at 256 pixels.
    let body = multipart("file", "big.ico", &png_bytes(300, 300));
    let (status, json) = post_form(&server, "/upload", &body);
    assert_eq!(status, 200);
    assert_eq!(json["detected_image"], "/uploads/detected_big.ico.jpg");
    assert!(dir.path().join("detected_big.ico.jpg").exists());
    let served = ureq::get(&url(&server, "/uploads/detected_big.ico.jpg"))
        .call()
        .unwrap();
    assert_eq!(served.content_type(), "image/jpeg");
    server.stop().unwrap();
}

#[test]
fn file_names_with_spaces_round_trip_through_urls() {
    let dir = tempdir().unwrap();
    let server = start(dir.path(), FixedDetector::new(vec![]), no_camera());

    let body = multipart("file", "my photo.png", &png_bytes(20, 20));
    let (status, json) = post_form(&server, "/upload", &body);
    assert_eq!(status, 200);
    assert_eq!(json["original_image"], "/uploads/my%20photo.png");
    assert_eq!(json["detected_image"], "/uploads/detected_my%20photo.png");
    assert!(dir.path().join("detected_my photo.png").exists());

    for key in ["original_image", "detected_image"] {
        let path = json[key].as_str().unwrap();
        assert_eq!(status_of(ureq::get(&url(&server, path)).call()), 200);
    }
    assert_eq!(
        status_of(ureq::get(&url(&server, "/uploads/%2e%2e%2fsecret")).call()),
        404
    );
    assert_eq!(status_of(ureq::get(&url(&server, "/uploads/%ff")).call()), 404);
    server.stop().unwrap();
}

#[test]
fn video_skips_frames_the_detector_fails_on() {
    let dir = tempdir().unwrap();
    let detector = AlternatingDetector::new(vec![det("cat", 15, 0.8)]);
    let calls = detector.calls.clone();
    let server = start(dir.path(), detector, no_camera());

    let body = multipart("file", "clip.gif", &gif_bytes(4));
    let (status, json) = post_form(&server, "/video", &body);
    assert_eq!(status, 200);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(json["frames_processed"], 4);
    assert_eq!(json["frames_skipped"], 2);
    assert_eq!(json["predictions"].as_array().unwrap().len(), 2);
    assert_eq!(json["label_counts"], serde_json::json!({ "cat": 2 }));
    server.stop().unwrap();
}

#[test]
fn camera_feed_keeps_streaming_past_detector_failures() {
    let dir = tempdir().unwrap();
    let live = Arc::new(AtomicUsize::new(0));
    let live_c = live.clone();
    let opener: SourceOpener = Arc::new(move || {
        Ok(Box::new(TrackedSource::new(
            live_c.clone(),
            None,
            Duration::from_millis(5),
        )) as Box<dyn FrameSource>)
    });
    let detector = AlternatingDetector::new(vec![det("dog", 16, 0.6)]);
    let calls = detector.calls.clone();
    let server = start(dir.path(), detector, opener);

    let feed = open_feed_parts(&server, 3);
    // Three delivered parts mean at least three failed detections in between.
    assert!(calls.load(Ordering::SeqCst) >= 5);
    assert_eq!(live.load(Ordering::SeqCst), 1);

    json_of(ureq::post(&url(&server, "/stop_camera")).call());
    feed.join().unwrap();
    assert!(wait_until(|| live.load(Ordering::SeqCst) == 0));
    server.stop().unwrap();
}

#[test]
fn stalled_feed_client_gives_the_camera_back() {
    let dir = tempdir().unwrap();
    let live = Arc::new(AtomicUsize::new(0));
    let opened = Arc::new(AtomicUsize::new(0));
    let (live_c, opened_c) = (live.clone(), opened.clone());
    let opener: SourceOpener = Arc::new(move || {
        opened_c.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(
            TrackedSource::new(live_c.clone(), None, Duration::ZERO).noisy(320, 240),
        ) as Box<dyn FrameSource>)
    });
    let server = start_with(
        dir.path(),
        FixedDetector::new(vec![]),
        opener,
        Duration::from_millis(200),
    );

    // Asks for the feed and never reads a byte of it.
    let mut stalled = TcpStream::connect(server.addr).unwrap();
    stalled
        .write_all(b"GET /camera_feed HTTP/1.1\r\nHost: test\r\n\r\n")
        .unwrap();
    assert!(wait_until(|| opened.load(Ordering::SeqCst) == 1));
    assert!(
        wait_for(Duration::from_secs(30), || live.load(Ordering::SeqCst) == 0),
        "blocked writer kept the camera"
    );

    let (status, _) = json_of(ureq::post(&url(&server, "/stop_camera")).call());
    assert_eq!(status, 200);
    let feed = open_feed(&server);
    assert_eq!(opened.load(Ordering::SeqCst), 2);
    json_of(ureq::post(&url(&server, "/stop_camera")).call());
    feed.join().unwrap();
    assert!(wait_until(|| live.load(Ordering::SeqCst) == 0));
    drop(stalled);
    server.stop().unwrap();
}
