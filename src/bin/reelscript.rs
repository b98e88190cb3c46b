use std::path::PathBuf;

use clap::{Parser, Subcommand};

use reelscript::{
    CancelToken, ChromeBrowser, EncoderConfig, FfprobeProber, ReelError, RenderOptions, RenderRun,
};

#[derive(Parser, Debug)]
#[command(name = "reelscript", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,

    /// Full error chains and the complete encoder command line.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a project's outputs through the external encoder.
    Render(RenderArgs),
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Project directory containing project.html.
    #[arg(default_value = ".")]
    project: PathBuf,

    /// Output name to render; repeat for several. Default: all outputs.
    #[arg(long = "output")]
    outputs: Vec<String>,

    /// Fast low-quality encode for iteration.
    #[arg(long)]
    dev: bool,

    /// Encoder binary.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// Probe binary.
    #[arg(long, default_value = "ffprobe")]
    ffprobe: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match &cli.cmd {
        Command::Render(args) => match cmd_render(args) {
            Ok(()) => 0,
            Err(err) => {
                report(&err, cli.debug);
                err.exit_code()
            }
        },
    };
    std::process::exit(code);
}

fn cmd_render(args: &RenderArgs) -> Result<(), ReelError> {
    let prober = FfprobeProber::new(&args.ffprobe);
    let mut browser = ChromeBrowser::new();

    let mut run = RenderRun {
        prober: &prober,
        browser: &mut browser,
        options: RenderOptions {
            outputs: args.outputs.clone(),
            dev: args.dev,
            encoder: EncoderConfig {
                binary: args.ffmpeg.clone(),
                ..EncoderConfig::default()
            },
        },
        cancel: CancelToken::new(),
    };

    run.render(&args.project, &mut |line| eprintln!("{line}"))
}

fn report(err: &ReelError, debug: bool) {
    eprintln!("error: {err}");
    if debug {
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
    } else if let Some(hint) = hint(err) {
        eprintln!("hint: {hint}");
    }
}

fn hint(err: &ReelError) -> Option<&'static str> {
    match err {
        ReelError::AssetMissing { .. } => {
            Some("check the asset's data-path against the project directory layout")
        }
        ReelError::UnresolvableExpression { .. } => {
            Some("these fragments reference each other in a cycle, or reference timing that is never set")
        }
        ReelError::EncoderNotFound => Some("install ffmpeg or pass --ffmpeg /path/to/ffmpeg"),
        ReelError::AppRenderTimeout { .. } => {
            Some("the app must set window.__stsRenderComplete = true when it finishes drawing")
        }
        ReelError::EncoderFailed { .. } => Some("re-run with --debug to see the full encoder command"),
        _ => None,
    }
}
