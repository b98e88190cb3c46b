//! Rasterizes HTML containers and embedded apps to transparent PNGs via a
//! headless browser. PNGs are content-addressed: the cache key hashes every
//! input that affects the rendered pixels, so a repeated render reuses the
//! file and the reaper can drop anything no longer reachable.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use sha2::{Digest as _, Sha256};
use tracing::{debug, info};

use crate::{
    error::{ReelError, ReelResult},
    model::{App, Container, FragmentSource, Output, Project, ProjectMeta},
};

/// How long an app gets to set `window.__stsRenderComplete`.
const APP_RENDER_DEADLINE: Duration = Duration::from_millis(5000);
const APP_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const CONTAINER_CACHE_DIR: &str = ".cache/containers";
pub const APP_CACHE_DIR: &str = "cache/apps";

/// 16-hex-digit prefix of the SHA-256 over the pixel-affecting inputs.
pub fn container_key(html: &str, css: &str, width: u32, height: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(html.as_bytes());
    hasher.update([0]);
    hasher.update(css.as_bytes());
    hasher.update([0]);
    hasher.update(width.to_le_bytes());
    hasher.update(height.to_le_bytes());
    hex16(hasher)
}

pub fn app_key(
    app: &App,
    meta: &ProjectMeta,
    output_name: &str,
    width: u32,
    height: u32,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(app.source_dir.to_string_lossy().as_bytes());
    hasher.update([0]);
    // params are a sorted map, so this serialization is canonical
    hasher.update(serde_json::to_string(&app.params).unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update(meta.title.as_deref().unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update(meta.date.as_deref().unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update(meta.tags.join(",").as_bytes());
    hasher.update([0]);
    hasher.update(output_name.as_bytes());
    hasher.update([0]);
    hasher.update(width.to_le_bytes());
    hasher.update(height.to_le_bytes());
    hex16(hasher)
}

fn hex16(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

pub fn container_png_path(project_dir: &Path, key: &str) -> PathBuf {
    project_dir.join(CONTAINER_CACHE_DIR).join(format!("{key}.png"))
}

pub fn app_png_path(project_dir: &Path, key: &str) -> PathBuf {
    project_dir.join(APP_CACHE_DIR).join(format!("{key}.png"))
}

/// The seam to the headless browser, so compiles can run against a stub.
pub trait OverlayBrowser {
    /// Render a complete HTML document and capture `(0,0,w,h)` with a
    /// transparent background.
    fn render_container(
        &mut self,
        container_id: &str,
        html_doc: &str,
        width: u32,
        height: u32,
        dest: &Path,
    ) -> ReelResult<()>;

    /// Navigate an app URL, wait for the readiness flag, then capture.
    fn render_app(
        &mut self,
        app_id: &str,
        url: &str,
        width: u32,
        height: u32,
        dest: &Path,
    ) -> ReelResult<()>;
}

/// Rasterize every container/app referenced by an enabled fragment for this
/// output. Every considered key (hit or miss) is recorded in `touched` for
/// the cache reaper.
pub fn rasterize_overlays(
    project: &Project,
    output: &Output,
    browser: &mut dyn OverlayBrowser,
    touched: &mut BTreeSet<String>,
) -> ReelResult<BTreeMap<String, PathBuf>> {
    let mut pngs = BTreeMap::new();

    for seq in &project.sequences {
        for frag in &seq.fragments {
            if !frag.enabled {
                continue;
            }
            match &frag.source {
                FragmentSource::Container(id) => {
                    if !pngs.contains_key(id) {
                        let container = project.containers.get(id).ok_or_else(|| {
                            ReelError::UnknownReference {
                                fragment_id: frag.id.clone(),
                                target: id.clone(),
                            }
                        })?;
                        let path =
                            rasterize_container(project, output, container, browser, touched)?;
                        pngs.insert(id.clone(), path);
                    }
                }
                FragmentSource::App(id) => {
                    if !pngs.contains_key(id) {
                        let app = project.apps.get(id).ok_or_else(|| {
                            ReelError::UnknownReference {
                                fragment_id: frag.id.clone(),
                                target: id.clone(),
                            }
                        })?;
                        let path = rasterize_app(project, output, app, browser, touched)?;
                        pngs.insert(id.clone(), path);
                    }
                }
                FragmentSource::Asset(_) => {}
            }
        }
    }

    Ok(pngs)
}

fn rasterize_container(
    project: &Project,
    output: &Output,
    container: &Container,
    browser: &mut dyn OverlayBrowser,
    touched: &mut BTreeSet<String>,
) -> ReelResult<PathBuf> {
    let key = container_key(&container.html, &project.css, output.width, output.height);
    touched.insert(key.clone());
    let path = container_png_path(&project.dir, &key);

    if path.exists() {
        debug!(container = %container.id, %key, "container cache hit");
        return Ok(path);
    }

    ensure_parent(&path)?;
    let doc = container_document(&container.html, &project.css, output.width, output.height);
    info!(container = %container.id, %key, "rasterizing container");
    browser.render_container(&container.id, &doc, output.width, output.height, &path)?;
    Ok(path)
}

fn rasterize_app(
    project: &Project,
    output: &Output,
    app: &App,
    browser: &mut dyn OverlayBrowser,
    touched: &mut BTreeSet<String>,
) -> ReelResult<PathBuf> {
    let key = app_key(app, &project.meta, &output.name, output.width, output.height);
    touched.insert(key.clone());
    let path = app_png_path(&project.dir, &key);

    if path.exists() {
        debug!(app = %app.id, %key, "app cache hit");
        return Ok(path);
    }

    ensure_parent(&path)?;
    let url = app_url(app, &project.meta)?;
    info!(app = %app.id, %key, "rasterizing app");
    browser.render_app(&app.id, &url, output.width, output.height, &path)?;
    Ok(path)
}

fn ensure_parent(path: &Path) -> ReelResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create cache directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// Wrap a container subtree in a document with a reset stylesheet and the
/// project CSS, sized to the output and transparent.
pub fn container_document(inner_html: &str, css: &str, width: u32, height: u32) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><style>\n\
         html,body{{margin:0;padding:0;width:{width}px;height:{height}px;\
         background:transparent;overflow:hidden}}\n\
         *,*::before,*::after{{box-sizing:border-box}}\n\
         {css}\n\
         </style></head><body>{inner_html}</body></html>"
    )
}

/// `file://<dir>/index.html?<query>` with title/date/tags injected and
/// explicit params overriding them.
pub fn app_url(app: &App, meta: &ProjectMeta) -> ReelResult<String> {
    let index = app.source_dir.join("index.html");
    if !index.exists() {
        return Err(ReelError::AssetMissing { path: index });
    }

    let mut query: BTreeMap<String, String> = BTreeMap::new();
    if let Some(title) = &meta.title {
        query.insert("title".to_string(), title.clone());
    }
    if let Some(date) = &meta.date {
        query.insert("date".to_string(), date.clone());
    }
    if !meta.tags.is_empty() {
        query.insert("tags".to_string(), meta.tags.join(","));
    }
    for (k, v) in &app.params {
        let value = match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        query.insert(k.clone(), value);
    }

    let abs = index
        .canonicalize()
        .with_context(|| format!("resolve app index '{}'", index.display()))?;
    let mut url = format!("file://{}", abs.display());
    if !query.is_empty() {
        let encoded: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect();
        url.push('?');
        url.push_str(&encoded.join("&"));
    }
    Ok(url)
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Drives a real Chromium instance. One browser serves a whole run; each
/// overlay gets its own page, closed after its screenshot.
pub struct ChromeBrowser {
    browser: Option<(headless_chrome::Browser, (u32, u32))>,
}

impl ChromeBrowser {
    pub fn new() -> ChromeBrowser {
        ChromeBrowser { browser: None }
    }

    fn tab(&mut self, width: u32, height: u32) -> ReelResult<Arc<headless_chrome::Tab>> {
        let needs_launch = match &self.browser {
            Some((_, size)) => *size != (width, height),
            None => true,
        };
        if needs_launch {
            let options = headless_chrome::LaunchOptions::default_builder()
                .headless(true)
                .sandbox(false)
                .window_size(Some((width, height)))
                .args(vec![
                    std::ffi::OsStr::new("--allow-file-access-from-files"),
                    std::ffi::OsStr::new("--default-background-color=00000000"),
                    std::ffi::OsStr::new("--hide-scrollbars"),
                ])
                .build()
                .map_err(|e| anyhow::anyhow!("browser launch options: {e}"))?;
            let browser = headless_chrome::Browser::new(options)
                .context("launch headless browser")?;
            self.browser = Some((browser, (width, height)));
        }
        let Some((browser, _)) = self.browser.as_ref() else {
            return Err(ReelError::Other(anyhow::anyhow!("browser failed to launch")));
        };
        browser.new_tab().context("open browser tab").map_err(ReelError::from)
    }

    fn screenshot(
        tab: &headless_chrome::Tab,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Vec<u8>> {
        use headless_chrome::protocol::cdp::Page;
        tab.capture_screenshot(
            Page::CaptureScreenshotFormatOption::Png,
            None,
            Some(Page::Viewport {
                x: 0.0,
                y: 0.0,
                width: width as f64,
                height: height as f64,
                scale: 1.0,
            }),
            true,
        )
    }
}

impl Default for ChromeBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayBrowser for ChromeBrowser {
    fn render_container(
        &mut self,
        container_id: &str,
        html_doc: &str,
        width: u32,
        height: u32,
        dest: &Path,
    ) -> ReelResult<()> {
        let fail = |message: String| ReelError::ContainerRenderFailed {
            container_id: container_id.to_string(),
            message,
        };

        // the browser loads from a file URL so relative asset paths resolve
        let html_path = dest.with_extension("html");
        std::fs::write(&html_path, html_doc).map_err(|e| fail(e.to_string()))?;
        let abs = html_path.canonicalize().map_err(|e| fail(e.to_string()))?;

        let tab = self.tab(width, height)?;
        let result = (|| {
            tab.navigate_to(&format!("file://{}", abs.display()))
                .map_err(|e| fail(e.to_string()))?;
            tab.wait_until_navigated().map_err(|e| fail(e.to_string()))?;
            let png = Self::screenshot(&tab, width, height).map_err(|e| fail(e.to_string()))?;
            std::fs::write(dest, png).map_err(|e| fail(e.to_string()))?;
            Ok(())
        })();

        let _ = tab.close(true);
        let _ = std::fs::remove_file(&html_path);
        result
    }

    fn render_app(
        &mut self,
        app_id: &str,
        url: &str,
        width: u32,
        height: u32,
        dest: &Path,
    ) -> ReelResult<()> {
        let tab = self.tab(width, height)?;
        let result = (|| {
            tab.navigate_to(url)
                .with_context(|| format!("navigate to '{url}'"))?;
            tab.wait_until_navigated().context("app navigation")?;

            // the flag is absent until the app sets it; undefined counts
            // as not ready
            let deadline = Instant::now() + APP_RENDER_DEADLINE;
            loop {
                let ready = tab
                    .evaluate("window.__stsRenderComplete === true", false)
                    .ok()
                    .and_then(|r| r.value)
                    .map(|v| v == serde_json::Value::Bool(true))
                    .unwrap_or(false);
                if ready {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(ReelError::AppRenderTimeout {
                        app_id: app_id.to_string(),
                    });
                }
                std::thread::sleep(APP_POLL_INTERVAL);
            }

            let png = Self::screenshot(&tab, width, height).context("app screenshot")?;
            std::fs::write(dest, png)
                .with_context(|| format!("write '{}'", dest.display()))?;
            Ok(())
        })();

        let _ = tab.close(true);
        result
    }
}
