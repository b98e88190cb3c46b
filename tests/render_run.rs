//! Whole-run orchestration through `RenderRun`, with the encoder replaced
//! by `/bin/true` so the pipeline (parse → probe → resolve → rasterize →
//! graph → encode → reap) runs for real without producing media.

mod common;

use std::path::PathBuf;

use common::{fake_encoder, write_project, FakeBrowser, StubProber};
use reelscript::{CancelToken, EncoderConfig, ReelError, RenderOptions, RenderRun};

const PROJECT: &str = r#"<project>
  <outputs>
    <output data-name="main" data-path="output/main.mp4"
            data-fps="30" data-resolution="1280x720"></output>
  </outputs>
  <assets>
    <asset data-name="clip" data-path="input/a.mp4"></asset>
  </assets>
  <container id="badge"><p>LIVE</p></container>
  <sequence>
    <fragment data-asset="clip"></fragment>
    <fragment data-container="badge"
              style="-offset-start: 0s; -duration: 1s; -overlay-start-z-index: 1"></fragment>
  </sequence>
</project>"#;

fn options() -> RenderOptions {
    RenderOptions {
        outputs: Vec::new(),
        dev: false,
        encoder: EncoderConfig {
            binary: PathBuf::from("true"),
            ..EncoderConfig::default()
        },
    }
}

#[test]
fn a_full_run_renders_and_reaps() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), PROJECT);

    // plant a stale overlay so the reaper has something to do
    let containers = dir.path().join(".cache/containers");
    std::fs::create_dir_all(&containers).unwrap();
    std::fs::write(containers.join("feedfacefeedface.png"), b"old").unwrap();

    let prober = StubProber::new().with_video("a", 5000.0);
    let mut browser = FakeBrowser::new();
    let mut run = RenderRun {
        prober: &prober,
        browser: &mut browser,
        options: options(),
        cancel: CancelToken::new(),
    };

    run.render(dir.path(), &mut |_| {}).unwrap();

    assert!(!containers.join("feedfacefeedface.png").exists());
    // exactly one fresh container PNG survives
    let kept = std::fs::read_dir(&containers).unwrap().count();
    assert_eq!(kept, 1);
    // the output directory was created for the encoder
    assert!(dir.path().join("output").is_dir());
}

#[test]
fn a_failing_encoder_leaves_the_cache_alone() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), PROJECT);

    let containers = dir.path().join(".cache/containers");
    std::fs::create_dir_all(&containers).unwrap();
    std::fs::write(containers.join("feedfacefeedface.png"), b"old").unwrap();

    let prober = StubProber::new().with_video("a", 5000.0);
    let mut browser = FakeBrowser::new();
    let mut run = RenderRun {
        prober: &prober,
        browser: &mut browser,
        options: RenderOptions {
            encoder: EncoderConfig {
                binary: fake_encoder(dir.path(), 1),
                ..EncoderConfig::default()
            },
            ..options()
        },
        cancel: CancelToken::new(),
    };

    let err = run.render(dir.path(), &mut |_| {}).unwrap_err();
    assert!(matches!(err, ReelError::EncoderFailed { .. }));
    // stale entries survive a failed run so a retry can reuse them
    assert!(containers.join("feedfacefeedface.png").exists());
}

#[test]
fn a_missing_encoder_fails_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), PROJECT);

    let prober = StubProber::new();
    let mut browser = FakeBrowser::new();
    let mut run = RenderRun {
        prober: &prober,
        browser: &mut browser,
        options: RenderOptions {
            encoder: EncoderConfig {
                binary: PathBuf::from("definitely-not-an-encoder"),
                ..EncoderConfig::default()
            },
            ..options()
        },
        cancel: CancelToken::new(),
    };

    let err = run.render(dir.path(), &mut |_| {}).unwrap_err();
    assert!(matches!(err, ReelError::EncoderNotFound));
    // the preflight trips before parsing or rasterizing anything
    assert_eq!(browser.containers_rendered, 0);
}

#[test]
fn cancellation_short_circuits_the_run() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), PROJECT);

    let prober = StubProber::new();
    let mut browser = FakeBrowser::new();
    let cancel = CancelToken::new();
    cancel.cancel();

    let mut run = RenderRun {
        prober: &prober,
        browser: &mut browser,
        options: options(),
        cancel,
    };
    let err = run.render(dir.path(), &mut |_| {}).unwrap_err();
    assert!(matches!(err, ReelError::Cancelled));
    assert_eq!(browser.containers_rendered, 0);
}
