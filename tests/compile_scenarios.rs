//! End-to-end compiles of small projects: parse, build, resolve, and
//! compare the emitted filter graph and input list against known-good
//! shapes. External tools are stubbed; nothing here spawns ffmpeg.

mod common;

use std::collections::BTreeMap;

use common::{write_project, StubProber};
use reelscript::{compile_output, load_project, resolve_timing, ReelError};

#[test]
fn single_full_clip_compiles_to_the_minimal_graph() {
    let dir = tempfile::tempdir().unwrap();
    write_project(
        dir.path(),
        r#"<project>
          <outputs>
            <output data-name="main" data-path="output/main.mp4"
                    data-fps="30" data-resolution="1920x1080"></output>
          </outputs>
          <assets>
            <asset data-name="clip" data-path="input/a.mp4"></asset>
          </assets>
          <sequence>
            <fragment data-asset="clip"></fragment>
          </sequence>
        </project>"#,
    );

    let prober = StubProber::new().with_video("a", 5000.0);
    let project = load_project(dir.path(), &prober).unwrap();
    let compiled = compile_output(
        &project,
        project.outputs.get("main").unwrap(),
        &BTreeMap::new(),
    )
    .unwrap();

    assert_eq!(
        compiled.filter_graph,
        "[0:v]fps=30[L0];\
         [L0]scale=1920:1080:force_original_aspect_ratio=increase,crop=1920:1080[L1];\
         [L1]null[outv];\
         [0:a]anull[outa]"
    );
    assert_eq!(compiled.inputs.len(), 1);
    assert!(compiled.inputs[0].path.ends_with("input/a.mp4"));
    assert_eq!(compiled.inputs[0].still_duration_ms, None);
    assert_eq!(compiled.total_duration_ms, 5000.0);
}

#[test]
fn two_clips_join_through_a_single_concat() {
    let dir = tempfile::tempdir().unwrap();
    write_project(
        dir.path(),
        r#"<project>
          <outputs>
            <output data-name="main" data-path="output/main.mp4"
                    data-fps="30" data-resolution="1280x720"></output>
          </outputs>
          <assets>
            <asset data-name="a" data-path="input/a.mp4"></asset>
            <asset data-name="b" data-path="input/b.mp4"></asset>
          </assets>
          <sequence>
            <fragment data-asset="a"></fragment>
            <fragment data-asset="b"></fragment>
          </sequence>
        </project>"#,
    );

    let prober = StubProber::new()
        .with_video("a", 3000.0)
        .with_video("b", 4000.0);
    let project = load_project(dir.path(), &prober).unwrap();
    let compiled = compile_output(
        &project,
        project.outputs.get("main").unwrap(),
        &BTreeMap::new(),
    )
    .unwrap();

    assert!(compiled.filter_graph.contains("concat=n=2:v=1:a=1"));
    assert!(compiled.inputs[0].path.ends_with("input/a.mp4"));
    assert!(compiled.inputs[1].path.ends_with("input/b.mp4"));
    assert_eq!(compiled.total_duration_ms, 7000.0);
}

#[test]
fn negative_overlap_cross_fades_video_and_audio() {
    let dir = tempfile::tempdir().unwrap();
    write_project(
        dir.path(),
        r#"<project>
          <outputs>
            <output data-name="main" data-path="output/main.mp4"
                    data-fps="30" data-resolution="1280x720"></output>
          </outputs>
          <assets>
            <asset data-name="a" data-path="input/a.mp4"></asset>
            <asset data-name="b" data-path="input/b.mp4"></asset>
          </assets>
          <sequence>
            <fragment data-asset="a"></fragment>
            <fragment data-asset="b" style="-overlay-left: -1000ms"></fragment>
          </sequence>
        </project>"#,
    );

    let prober = StubProber::new()
        .with_video("a", 3000.0)
        .with_video("b", 3000.0);
    let project = load_project(dir.path(), &prober).unwrap();
    let compiled = compile_output(
        &project,
        project.outputs.get("main").unwrap(),
        &BTreeMap::new(),
    )
    .unwrap();

    assert!(compiled
        .filter_graph
        .contains("xfade=transition=fade:duration=1:offset=2"));
    assert!(compiled.filter_graph.contains("acrossfade=d=1"));
    assert_eq!(compiled.total_duration_ms, 5000.0);
}

#[test]
fn forward_references_resolve_in_a_later_pass() {
    let dir = tempfile::tempdir().unwrap();
    write_project(
        dir.path(),
        r#"<project>
          <outputs>
            <output data-name="main" data-path="output/main.mp4"
                    data-fps="30" data-resolution="1280x720"></output>
          </outputs>
          <assets>
            <asset data-name="a" data-path="input/a.mp4"></asset>
            <asset data-name="b" data-path="input/b.mp4"></asset>
          </assets>
          <sequence>
            <fragment id="intro" data-asset="a"
                      style="-duration: calc(url(#ending.time.start))"></fragment>
            <fragment id="ending" data-asset="b"
                      style="-offset-start: 8s; -duration: 2s"></fragment>
          </sequence>
        </project>"#,
    );

    let prober = StubProber::new()
        .with_video("a", 10000.0)
        .with_video("b", 4000.0);
    let project = load_project(dir.path(), &prober).unwrap();
    let resolved = resolve_timing(&project).unwrap();

    let frags = &resolved[0].fragments;
    assert_eq!(frags[0].duration_ms, 8000.0);
    assert_eq!(frags[1].start_ms, 8000.0);
    assert_eq!(frags[1].duration_ms, 2000.0);
}

#[test]
fn input_indices_follow_first_use_across_repeats() {
    let dir = tempfile::tempdir().unwrap();
    write_project(
        dir.path(),
        r#"<project>
          <outputs>
            <output data-name="main" data-path="output/main.mp4"
                    data-fps="30" data-resolution="1280x720"></output>
          </outputs>
          <assets>
            <asset data-name="a" data-path="input/a.mp4"></asset>
            <asset data-name="b" data-path="input/b.mp4"></asset>
            <asset data-name="c" data-path="input/c.mp4"></asset>
          </assets>
          <sequence>
            <fragment data-asset="a" style="-duration: 1s"></fragment>
            <fragment data-asset="b" style="-duration: 1s"></fragment>
            <fragment data-asset="a" style="-duration: 1s; -trim-start: 1s"></fragment>
            <fragment data-asset="c" style="-duration: 1s"></fragment>
          </sequence>
        </project>"#,
    );

    let project = load_project(dir.path(), &StubProber::new()).unwrap();
    assert_eq!(project.assets["a"].input_index, Some(0));
    assert_eq!(project.assets["b"].input_index, Some(1));
    assert_eq!(project.assets["c"].input_index, Some(2));

    let compiled = compile_output(
        &project,
        project.outputs.get("main").unwrap(),
        &BTreeMap::new(),
    )
    .unwrap();
    // a used twice, three inputs total
    assert_eq!(compiled.inputs.len(), 3);
    let indices: Vec<usize> = compiled.inputs.iter().map(|i| i.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[test]
fn compiles_are_byte_identical_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    write_project(
        dir.path(),
        r#"<project>
          <style>
            .faded { -transition-start: fade 500ms; -transition-end: fade 500ms; }
          </style>
          <outputs>
            <output data-name="main" data-path="output/main.mp4"
                    data-fps="25" data-resolution="1920x1080"></output>
          </outputs>
          <assets>
            <asset data-name="a" data-path="input/a.mp4"></asset>
            <asset data-name="b" data-path="input/b.mp4"></asset>
          </assets>
          <sequence>
            <fragment data-asset="a" class="faded"></fragment>
            <fragment data-asset="b" style="-overlay-left: -500ms"></fragment>
          </sequence>
        </project>"#,
    );

    let compile_once = || {
        let prober = StubProber::new()
            .with_video("a", 4000.0)
            .with_video("b", 4000.0);
        let project = load_project(dir.path(), &prober).unwrap();
        let compiled = compile_output(
            &project,
            project.outputs.get("main").unwrap(),
            &BTreeMap::new(),
        )
        .unwrap();
        (compiled.filter_graph, compiled.inputs)
    };

    assert_eq!(compile_once(), compile_once());
}

#[test]
fn duration_beyond_the_source_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_project(
        dir.path(),
        r#"<project>
          <outputs>
            <output data-name="main" data-path="output/main.mp4"
                    data-fps="30" data-resolution="1280x720"></output>
          </outputs>
          <assets>
            <asset data-name="a" data-path="input/a.mp4"></asset>
          </assets>
          <sequence>
            <fragment data-asset="a" style="-trim-start: 2s; -duration: 4s"></fragment>
          </sequence>
        </project>"#,
    );

    let prober = StubProber::new().with_video("a", 5000.0);
    let project = load_project(dir.path(), &prober).unwrap();
    let err = resolve_timing(&project).unwrap_err();
    assert!(matches!(err, ReelError::DurationOverflow { .. }));
}
