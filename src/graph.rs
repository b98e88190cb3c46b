//! Typed filter-graph construction.
//!
//! A [`FilterGraph`] owns an append-only list of filters and mints fresh
//! labels (`L0`, `L1`, …). [`Stream`] values are lightweight handles around
//! the current loose-end label of a subgraph; every chainable operation
//! mints a new output label, appends one filter, and returns the new handle.
//! Rendering joins filters with `;` in insertion order, so a fixed build
//! sequence always produces a byte-identical graph.

use std::{cell::RefCell, rc::Rc};

use crate::error::{ReelError, ReelResult};

/// A labeled endpoint in the graph, e.g. `[0:v]`, `[L3]`, `[outa]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Label {
    pub tag: String,
    pub is_audio: bool,
}

impl Label {
    pub fn video(tag: impl Into<String>) -> Label {
        Label {
            tag: tag.into(),
            is_audio: false,
        }
    }

    pub fn audio(tag: impl Into<String>) -> Label {
        Label {
            tag: tag.into(),
            is_audio: true,
        }
    }

    fn render(&self) -> String {
        format!("[{}]", self.tag)
    }
}

/// One named filter with its parameters; several steps chained with commas
/// form a single filter-graph entry (`scale=…,crop=…`).
#[derive(Clone, Debug)]
pub struct FilterStep {
    pub name: String,
    /// `("", v)` renders positionally, `(k, v)` as `k=v`.
    pub params: Vec<(String, String)>,
}

impl FilterStep {
    pub fn new(name: impl Into<String>) -> FilterStep {
        FilterStep {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> FilterStep {
        self.params.push((String::new(), value.into()));
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> FilterStep {
        self.params.push((key.into(), value.into()));
        self
    }

    fn render(&self) -> String {
        if self.params.is_empty() {
            return self.name.clone();
        }
        let params = self
            .params
            .iter()
            .map(|(k, v)| {
                if k.is_empty() {
                    v.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join(":");
        format!("{}={params}", self.name)
    }
}

#[derive(Clone, Debug)]
pub struct Filter {
    pub inputs: Vec<Label>,
    pub steps: Vec<FilterStep>,
    pub outputs: Vec<Label>,
}

impl Filter {
    fn render(&self) -> String {
        let mut out = String::new();
        for l in &self.inputs {
            out.push_str(&l.render());
        }
        out.push_str(
            &self
                .steps
                .iter()
                .map(FilterStep::render)
                .collect::<Vec<_>>()
                .join(","),
        );
        for l in &self.outputs {
            out.push_str(&l.render());
        }
        out
    }
}

#[derive(Debug, Default)]
struct GraphInner {
    filters: Vec<Filter>,
    next_label: u64,
}

/// The append-only DAG. Cheap to clone; all clones share the same filters.
#[derive(Clone, Debug, Default)]
pub struct FilterGraph {
    inner: Rc<RefCell<GraphInner>>,
}

impl FilterGraph {
    pub fn new() -> FilterGraph {
        FilterGraph::default()
    }

    fn mint(&self, is_audio: bool) -> Label {
        let mut inner = self.inner.borrow_mut();
        let tag = format!("L{}", inner.next_label);
        inner.next_label += 1;
        Label { tag, is_audio }
    }

    pub fn push(&self, filter: Filter) {
        self.inner.borrow_mut().filters.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().filters.is_empty()
    }

    pub fn render(&self) -> String {
        self.inner
            .borrow()
            .filters
            .iter()
            .map(Filter::render)
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Stream over an existing label (typically an input specifier).
    pub fn stream(&self, label: Label) -> Stream {
        Stream {
            graph: self.clone(),
            label,
        }
    }

    pub fn video_input(&self, index: usize) -> Stream {
        self.stream(Label::video(format!("{index}:v")))
    }

    pub fn audio_input(&self, index: usize) -> Stream {
        self.stream(Label::audio(format!("{index}:a")))
    }

    /// Silent stereo audio of the given length, for segments whose source
    /// carries no audio stream.
    pub fn silence(&self, duration_ms: f64) -> Stream {
        let out = self.mint(true);
        self.push(Filter {
            inputs: vec![],
            steps: vec![
                FilterStep::new("anullsrc")
                    .param("channel_layout", "stereo")
                    .param("sample_rate", "44100"),
                FilterStep::new("atrim").param("duration", fmt_secs(duration_ms)),
            ],
            outputs: vec![out.clone()],
        });
        self.stream(out)
    }

    /// `concat` over an ordered label list. Chooses the factorization
    /// (n, v, a) maximizing the segment count n such that every segment is
    /// `v` video labels followed by `a` audio labels.
    pub fn make_concat(&self, inputs: &[Label]) -> ReelResult<Vec<Label>> {
        if inputs.is_empty() {
            return Err(ReelError::invalid_filter_inputs("concat", "no inputs"));
        }
        let len = inputs.len();
        let mut chosen = None;
        for n in (1..=len).rev() {
            if len % n != 0 {
                continue;
            }
            let seg = len / n;
            let v = inputs[..seg].iter().take_while(|l| !l.is_audio).count();
            let a = seg - v;
            let ok = inputs.chunks(seg).all(|chunk| {
                chunk.iter().take(v).all(|l| !l.is_audio)
                    && chunk.iter().skip(v).all(|l| l.is_audio)
            });
            if ok {
                chosen = Some((n, v, a));
                break;
            }
        }
        let Some((n, v, a)) = chosen else {
            return Err(ReelError::invalid_filter_inputs(
                "concat",
                "inputs do not interleave into uniform segments",
            ));
        };

        let mut outputs = Vec::with_capacity(v + a);
        for _ in 0..v {
            outputs.push(self.mint(false));
        }
        for _ in 0..a {
            outputs.push(self.mint(true));
        }
        self.push(Filter {
            inputs: inputs.to_vec(),
            steps: vec![
                FilterStep::new("concat")
                    .param("n", n.to_string())
                    .param("v", v.to_string())
                    .param("a", a.to_string()),
            ],
            outputs: outputs.clone(),
        });
        Ok(outputs)
    }

    /// Video cross-fade. Rejects audio labels.
    pub fn make_xfade(
        &self,
        a: &Label,
        b: &Label,
        duration_ms: f64,
        offset_ms: f64,
        transition: &str,
    ) -> ReelResult<Label> {
        for l in [a, b] {
            if l.is_audio {
                return Err(ReelError::invalid_filter_inputs(
                    "xfade",
                    format!("audio label '{}'", l.tag),
                ));
            }
        }
        let out = self.mint(false);
        self.push(Filter {
            inputs: vec![a.clone(), b.clone()],
            steps: vec![
                FilterStep::new("xfade")
                    .param("transition", transition)
                    .param("duration", fmt_secs(duration_ms))
                    .param("offset", fmt_secs(offset_ms)),
            ],
            outputs: vec![out.clone()],
        });
        Ok(out)
    }

    /// The audio companion to `make_xfade`.
    pub fn make_acrossfade(&self, a: &Label, b: &Label, duration_ms: f64) -> ReelResult<Label> {
        for l in [a, b] {
            if !l.is_audio {
                return Err(ReelError::invalid_filter_inputs(
                    "acrossfade",
                    format!("video label '{}'", l.tag),
                ));
            }
        }
        let out = self.mint(true);
        self.push(Filter {
            inputs: vec![a.clone(), b.clone()],
            steps: vec![FilterStep::new("acrossfade").param("d", fmt_secs(duration_ms))],
            outputs: vec![out.clone()],
        });
        Ok(out)
    }

    pub fn make_amix(&self, inputs: &[Label]) -> ReelResult<Label> {
        if inputs.len() < 2 {
            return Err(ReelError::invalid_filter_inputs(
                "amix",
                "needs at least two inputs",
            ));
        }
        if let Some(l) = inputs.iter().find(|l| !l.is_audio) {
            return Err(ReelError::invalid_filter_inputs(
                "amix",
                format!("video label '{}'", l.tag),
            ));
        }
        let out = self.mint(true);
        self.push(Filter {
            inputs: inputs.to_vec(),
            steps: vec![
                FilterStep::new("amix")
                    .param("inputs", inputs.len().to_string())
                    .param("duration", "longest")
                    .param("dropout_transition", "0"),
            ],
            outputs: vec![out.clone()],
        });
        Ok(out)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FadeDirection {
    In,
    Out,
}

/// The loose end of a partial graph. Operations append to the shared DAG
/// and hand back a new handle; the handle itself is immutable.
#[derive(Clone, Debug)]
pub struct Stream {
    graph: FilterGraph,
    label: Label,
}

impl Stream {
    pub fn label(&self) -> &Label {
        &self.label
    }

    pub fn is_audio(&self) -> bool {
        self.label.is_audio
    }

    fn chain(self, steps: Vec<FilterStep>) -> Stream {
        let out = self.graph.mint(self.label.is_audio);
        self.graph.push(Filter {
            inputs: vec![self.label],
            steps,
            outputs: vec![out.clone()],
        });
        Stream {
            graph: self.graph,
            label: out,
        }
    }

    pub fn scale(self, w: u32, h: u32) -> Stream {
        self.chain(vec![FilterStep::new("scale")
            .arg(w.to_string())
            .arg(h.to_string())])
    }

    pub fn fps(self, fps: u32) -> Stream {
        self.chain(vec![FilterStep::new("fps").arg(fps.to_string())])
    }

    /// ffmpeg transpose: 1 = clockwise quarter turn, 2 = counter-clockwise.
    pub fn transpose(self, mode: u8) -> Stream {
        self.chain(vec![FilterStep::new("transpose").arg(mode.to_string())])
    }

    /// Cut `[start, start+duration)` out of the source and reset timestamps
    /// to zero. Dispatches to the audio forms on audio streams.
    pub fn trim(self, start_ms: f64, duration_ms: f64) -> Stream {
        let (trim, setpts, reset) = if self.label.is_audio {
            ("atrim", "asetpts", "PTS-STARTPTS")
        } else {
            ("trim", "setpts", "PTS-STARTPTS")
        };
        self.chain(vec![
            FilterStep::new(trim)
                .param("start", fmt_secs(start_ms))
                .param("duration", fmt_secs(duration_ms)),
            FilterStep::new(setpts).arg(reset),
        ])
    }

    /// Scale to fill the frame, then center-crop the excess.
    pub fn fit_cover(self, w: u32, h: u32) -> Stream {
        self.chain(vec![
            FilterStep::new("scale")
                .arg(w.to_string())
                .arg(h.to_string())
                .param("force_original_aspect_ratio", "increase"),
            FilterStep::new("crop").arg(w.to_string()).arg(h.to_string()),
        ])
    }

    /// Scale to fit inside the frame without padding; used as the
    /// foreground branch of the ambient fit.
    pub fn scale_to_fit(self, w: u32, h: u32) -> Stream {
        self.chain(vec![FilterStep::new("scale")
            .arg(w.to_string())
            .arg(h.to_string())
            .param("force_original_aspect_ratio", "decrease")])
    }

    /// Scale to fit and pad the remainder with bars of the given color.
    pub fn fit_pad(self, w: u32, h: u32, color: Option<&str>) -> Stream {
        let mut pad = FilterStep::new("pad")
            .arg(w.to_string())
            .arg(h.to_string())
            .arg("(ow-iw)/2")
            .arg("(oh-ih)/2");
        if let Some(color) = color {
            pad = pad.arg(color);
        }
        self.chain(vec![
            FilterStep::new("scale")
                .arg(w.to_string())
                .arg(h.to_string())
                .param("force_original_aspect_ratio", "decrease"),
            pad,
        ])
    }

    /// Fill the frame with a blurred, dimmed copy of the source and center
    /// the fit copy on top.
    pub fn fit_ambient(
        self,
        w: u32,
        h: u32,
        blur: f64,
        brightness: f64,
        saturation: f64,
    ) -> ReelResult<Stream> {
        let mut halves = self.split(2).into_iter();
        let bg = halves
            .next()
            .expect("split(2) yields two streams")
            .fit_cover(w, h)
            .gblur(blur)
            .eq(&[("brightness", brightness), ("saturation", saturation)]);
        let fg = halves
            .next()
            .expect("split(2) yields two streams")
            .scale_to_fit(w, h);
        bg.overlay(&fg, "(W-w)/2", "(H-h)/2", None)
    }

    pub fn gblur(self, sigma: f64) -> Stream {
        self.chain(vec![FilterStep::new("gblur").param("sigma", fmt_num(sigma))])
    }

    /// `eq` with the given named settings, e.g. brightness/saturation for
    /// the ambient backdrop.
    pub fn eq(self, settings: &[(&str, f64)]) -> Stream {
        let mut step = FilterStep::new("eq");
        for (k, v) in settings {
            step = step.param(*k, fmt_num(*v));
        }
        self.chain(vec![step])
    }

    pub fn crop(self, w: u32, h: u32) -> Stream {
        self.chain(vec![FilterStep::new("crop").arg(w.to_string()).arg(h.to_string())])
    }

    pub fn format(self, pixfmt: &str) -> Stream {
        self.chain(vec![FilterStep::new("format").arg(pixfmt)])
    }

    pub fn fade(self, direction: FadeDirection, start_ms: f64, duration_ms: f64) -> Stream {
        let name = if self.label.is_audio { "afade" } else { "fade" };
        let t = match direction {
            FadeDirection::In => "in",
            FadeDirection::Out => "out",
        };
        self.chain(vec![FilterStep::new(name)
            .param("t", t)
            .param("st", fmt_secs(start_ms))
            .param("d", fmt_secs(duration_ms))])
    }

    /// Fade that dissolves the alpha channel instead of dipping to black;
    /// used for transparent overlay sources.
    pub fn fade_alpha(self, direction: FadeDirection, start_ms: f64, duration_ms: f64) -> Stream {
        let t = match direction {
            FadeDirection::In => "in",
            FadeDirection::Out => "out",
        };
        self.chain(vec![FilterStep::new("fade")
            .param("t", t)
            .param("st", fmt_secs(start_ms))
            .param("d", fmt_secs(duration_ms))
            .param("alpha", "1")])
    }

    /// Delay an audio stream to its timeline position.
    pub fn adelay(self, delay_ms: f64) -> Stream {
        let ms = delay_ms.round() as i64;
        self.chain(vec![FilterStep::new("adelay").arg(format!("{ms}|{ms}"))])
    }

    pub fn colorkey(self, color: &str, similarity: f64, blend: f64) -> Stream {
        self.chain(vec![FilterStep::new("colorkey")
            .arg(color)
            .arg(fmt_num(similarity))
            .arg(fmt_num(blend))])
    }

    pub fn setpts(self, expr: &str) -> Stream {
        let name = if self.label.is_audio {
            "asetpts"
        } else {
            "setpts"
        };
        self.chain(vec![FilterStep::new(name).arg(expr)])
    }

    pub fn drawtext(
        self,
        text: &str,
        fontsize: u32,
        fontcolor: &str,
        x: &str,
        y: &str,
        window_ms: Option<(f64, f64)>,
    ) -> Stream {
        let escaped = text.replace('\'', "'\\''");
        let mut step = FilterStep::new("drawtext")
            .param("text", format!("'{escaped}'"))
            .param("fontsize", fontsize.to_string())
            .param("fontcolor", fontcolor)
            .param("x", x)
            .param("y", y);
        if let Some((from_ms, to_ms)) = window_ms {
            step = step.param("enable", enable_between(from_ms, to_ms));
        }
        self.chain(vec![step])
    }

    pub fn split(self, n: usize) -> Vec<Stream> {
        let name = if self.label.is_audio { "asplit" } else { "split" };
        let outputs: Vec<Label> = (0..n)
            .map(|_| self.graph.mint(self.label.is_audio))
            .collect();
        self.graph.push(Filter {
            inputs: vec![self.label.clone()],
            steps: vec![FilterStep::new(name).arg(n.to_string())],
            outputs: outputs.clone(),
        });
        outputs
            .into_iter()
            .map(|label| Stream {
                graph: self.graph.clone(),
                label,
            })
            .collect()
    }

    /// Composite `other` on top of `self`, optionally only inside a
    /// timeline window.
    pub fn overlay(
        self,
        other: &Stream,
        x: &str,
        y: &str,
        window_ms: Option<(f64, f64)>,
    ) -> ReelResult<Stream> {
        if self.label.is_audio || other.label.is_audio {
            return Err(ReelError::invalid_filter_inputs(
                "overlay",
                "overlay requires two video labels",
            ));
        }
        let mut step = FilterStep::new("overlay").param("x", x).param("y", y);
        if let Some((from_ms, to_ms)) = window_ms {
            step = step.param("enable", enable_between(from_ms, to_ms));
        }
        let out = self.graph.mint(false);
        self.graph.push(Filter {
            inputs: vec![self.label, other.label.clone()],
            steps: vec![step],
            outputs: vec![out.clone()],
        });
        Ok(Stream {
            graph: self.graph,
            label: out,
        })
    }

    /// Terminate the graph at a fixed output name via a passthrough filter.
    pub fn end_to(self, tag: &str) {
        let name = if self.label.is_audio { "anull" } else { "null" };
        let out = Label {
            tag: tag.to_string(),
            is_audio: self.label.is_audio,
        };
        self.graph.push(Filter {
            inputs: vec![self.label],
            steps: vec![FilterStep::new(name)],
            outputs: vec![out],
        });
    }
}

fn enable_between(from_ms: f64, to_ms: f64) -> String {
    format!(
        "'between(t,{},{})'",
        fmt_secs(from_ms),
        fmt_secs(to_ms)
    )
}

/// Minimal-decimal rendering so graphs stay byte-stable: `2`, `1.5`,
/// `0.25` — never trailing zeros.
pub fn fmt_num(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        let s = format!("{v:.6}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Milliseconds rendered as seconds for filter parameters.
pub fn fmt_secs(ms: f64) -> String {
    fmt_num(ms / 1000.0)
}
