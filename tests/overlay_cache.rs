//! Container/app rasterization scenarios: content-addressed PNGs, enable
//! windows, looped still inputs, readiness timeouts, and cache reuse.

mod common;

use std::collections::BTreeSet;

use common::{write_project, FakeBrowser, StubProber};
use reelscript::{
    build_encoder_args, compile_output, container_key, load_project, preset_args,
    rasterize_overlays, reap_cache, EncoderConfig, ReelError, DEFAULT_PRESET,
};

const OVERLAY_PROJECT: &str = r#"<project>
  <style>
    h1 { color: white; }
  </style>
  <outputs>
    <output data-name="main" data-path="output/main.mp4"
            data-fps="30" data-resolution="1080x1920"></output>
  </outputs>
  <assets>
    <asset data-name="clip" data-path="input/a.mp4"></asset>
  </assets>
  <container id="title"><h1>Hello</h1></container>
  <sequence>
    <fragment data-asset="clip"></fragment>
    <fragment data-container="title"
              style="-offset-start: 1s; -duration: 2s; -overlay-start-z-index: 10"></fragment>
  </sequence>
</project>"#;

#[test]
fn container_overlay_writes_a_keyed_png_and_loops_it() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), OVERLAY_PROJECT);

    let prober = StubProber::new().with_video("a", 5000.0);
    let project = load_project(dir.path(), &prober).unwrap();
    let output = project.outputs.get("main").unwrap();

    let mut browser = FakeBrowser::new();
    let mut touched = BTreeSet::new();
    let pngs = rasterize_overlays(&project, output, &mut browser, &mut touched).unwrap();

    // the PNG lands at the content-addressed path
    let key = container_key(&project.containers["title"].html, &project.css, 1080, 1920);
    let expected = dir.path().join(".cache/containers").join(format!("{key}.png"));
    assert_eq!(pngs["title"], expected);
    assert!(expected.exists());
    assert!(touched.contains(&key));

    let compiled = compile_output(&project, output, &pngs).unwrap();
    assert!(compiled
        .filter_graph
        .contains("overlay=x=0:y=0:enable='between(t,1,3)'"));

    // the still input loops for the overlay's duration
    let args = build_encoder_args(
        &compiled,
        &dir.path().join("output/main.mp4"),
        &preset_args(DEFAULT_PRESET, false),
        &EncoderConfig::default(),
    );
    let joined = args.join(" ");
    assert!(joined.contains(&format!("-loop 1 -t 2 -i {}", expected.display())));
}

#[test]
fn second_render_reuses_the_cached_png() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), OVERLAY_PROJECT);

    let prober = StubProber::new().with_video("a", 5000.0);
    let project = load_project(dir.path(), &prober).unwrap();
    let output = project.outputs.get("main").unwrap();

    let mut browser = FakeBrowser::new();
    let mut touched = BTreeSet::new();
    let first = rasterize_overlays(&project, output, &mut browser, &mut touched).unwrap();
    assert_eq!(browser.containers_rendered, 1);
    let bytes_before = std::fs::read(&first["title"]).unwrap();

    let second = rasterize_overlays(&project, output, &mut browser, &mut touched).unwrap();
    assert_eq!(browser.containers_rendered, 1, "cache hit must not re-render");
    assert_eq!(first, second);
    assert_eq!(std::fs::read(&second["title"]).unwrap(), bytes_before);
}

#[test]
fn stale_cache_entries_are_reaped_and_touched_ones_survive() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), OVERLAY_PROJECT);

    let prober = StubProber::new().with_video("a", 5000.0);
    let project = load_project(dir.path(), &prober).unwrap();
    let output = project.outputs.get("main").unwrap();

    let mut browser = FakeBrowser::new();
    let mut touched = BTreeSet::new();
    let pngs = rasterize_overlays(&project, output, &mut browser, &mut touched).unwrap();

    // a leftover from some earlier edit of the project
    let stale = dir.path().join(".cache/containers/0123456789abcdef.png");
    std::fs::write(&stale, b"old").unwrap();

    let removed = reap_cache(dir.path(), &touched);
    assert_eq!(removed, 1);
    assert!(!stale.exists());
    assert!(pngs["title"].exists());
}

#[test]
fn app_that_never_signals_readiness_times_out_without_a_png() {
    let dir = tempfile::tempdir().unwrap();
    let app_dir = dir.path().join("apps/scores");
    std::fs::create_dir_all(&app_dir).unwrap();
    std::fs::write(app_dir.join("index.html"), "<html></html>").unwrap();

    write_project(
        dir.path(),
        r#"<project data-title="Finals">
          <outputs>
            <output data-name="main" data-path="output/main.mp4"
                    data-fps="30" data-resolution="1280x720"></output>
          </outputs>
          <assets>
            <asset data-name="clip" data-path="input/a.mp4"></asset>
          </assets>
          <app id="scores" data-src="apps/scores" data-params='{"round": 3}'></app>
          <sequence>
            <fragment data-asset="clip"></fragment>
            <fragment data-app="scores"
                      style="-offset-start: 0s; -duration: 3s; -overlay-start-z-index: 5"></fragment>
          </sequence>
        </project>"#,
    );

    let prober = StubProber::new().with_video("a", 5000.0);
    let project = load_project(dir.path(), &prober).unwrap();
    let output = project.outputs.get("main").unwrap();

    let mut browser = FakeBrowser::stuck();
    let mut touched = BTreeSet::new();
    let err = rasterize_overlays(&project, output, &mut browser, &mut touched).unwrap_err();

    match err {
        ReelError::AppRenderTimeout { app_id } => assert_eq!(app_id, "scores"),
        other => panic!("expected AppRenderTimeout, got {other:?}"),
    }

    // no PNG was written for the failed app
    let apps_dir = dir.path().join("cache/apps");
    let leftover = std::fs::read_dir(&apps_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}
