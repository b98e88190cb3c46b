#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use reelscript::{MediaProbe, MediaProber, OverlayBrowser, ReelError, ReelResult};

/// Canned probe results keyed by file stem; unknown files get a generic
/// 5-second 1080p clip with audio.
pub struct StubProber {
    probes: HashMap<String, MediaProbe>,
}

impl StubProber {
    pub fn new() -> StubProber {
        StubProber {
            probes: HashMap::new(),
        }
    }

    pub fn with(mut self, stem: &str, probe: MediaProbe) -> StubProber {
        self.probes.insert(stem.to_string(), probe);
        self
    }

    pub fn with_video(self, stem: &str, duration_ms: f64) -> StubProber {
        self.with(
            stem,
            MediaProbe {
                duration_ms,
                width: 1920,
                height: 1080,
                rotation: 0,
                has_video: true,
                has_audio: true,
            },
        )
    }
}

impl MediaProber for StubProber {
    fn probe(&self, path: &Path) -> ReelResult<MediaProbe> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(self.probes.get(&stem).copied().unwrap_or(MediaProbe {
            duration_ms: 5000.0,
            width: 1920,
            height: 1080,
            rotation: 0,
            has_video: true,
            has_audio: true,
        }))
    }
}

/// Writes placeholder PNG bytes instead of launching a browser. Apps can be
/// configured to never become ready, mirroring a stuck SPA.
pub struct FakeBrowser {
    pub containers_rendered: usize,
    pub apps_rendered: usize,
    pub app_becomes_ready: bool,
}

impl FakeBrowser {
    pub fn new() -> FakeBrowser {
        FakeBrowser {
            containers_rendered: 0,
            apps_rendered: 0,
            app_becomes_ready: true,
        }
    }

    pub fn stuck() -> FakeBrowser {
        FakeBrowser {
            app_becomes_ready: false,
            ..FakeBrowser::new()
        }
    }
}

impl OverlayBrowser for FakeBrowser {
    fn render_container(
        &mut self,
        _container_id: &str,
        _html_doc: &str,
        _width: u32,
        _height: u32,
        dest: &Path,
    ) -> ReelResult<()> {
        std::fs::write(dest, b"\x89PNG fake container").unwrap();
        self.containers_rendered += 1;
        Ok(())
    }

    fn render_app(
        &mut self,
        app_id: &str,
        _url: &str,
        _width: u32,
        _height: u32,
        dest: &Path,
    ) -> ReelResult<()> {
        if !self.app_becomes_ready {
            return Err(ReelError::AppRenderTimeout {
                app_id: app_id.to_string(),
            });
        }
        std::fs::write(dest, b"\x89PNG fake app").unwrap();
        self.apps_rendered += 1;
        Ok(())
    }
}

pub fn write_project(dir: &Path, body: &str) {
    std::fs::write(dir.join("project.html"), body).unwrap();
}

/// A stand-in encoder binary: answers `-version` so the preflight passes,
/// then exits with the given code on the real invocation.
pub fn fake_encoder(dir: &Path, exit_code: i32) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt as _;

    let path = dir.join("ffmpeg-stub");
    std::fs::write(
        &path,
        format!("#!/bin/sh\n[ \"$1\" = \"-version\" ] && exit 0\nexit {exit_code}\n"),
    )
    .unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}
