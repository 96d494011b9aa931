use facet::Facet;
use figue as args;
use stackshot_capture::{CaptureOptions, DebugInfo, FormatOptions, StackFrame, WalkStrategy};
use std::hint::black_box;
use std::num::NonZeroUsize;

type AnyResult<T> = Result<T, String>;

const DEFAULT_DEPTH: usize = 9;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// Recursion depth before the stack is reported.
    #[facet(args::named, default)]
    depth: Option<usize>,
    /// Innermost frames to leave out of the report.
    #[facet(args::named, default)]
    skip: Option<usize>,
    #[facet(args::named, default)]
    max_frames: Option<usize>,
    #[facet(args::named, default)]
    json: bool,
    #[facet(args::named, default)]
    frame_pointers: bool,
    #[facet(args::named, default)]
    no_debug_info: bool,
    #[facet(args::named, default)]
    show_module: bool,
}

struct Config {
    depth: usize,
    skip: usize,
    json: bool,
    options: CaptureOptions,
    format: FormatOptions,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> AnyResult<()> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cfg = config_from_cli(&cli);
    tracing::debug!(depth = cfg.depth, skip = cfg.skip, "starting demo");
    black_box(countdown(1, &cfg))
}

fn parse_cli() -> AnyResult<Cli> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("stackshot-demo")
                .description("Recurse a few levels deep, then print the call stack")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();

    args::Driver::new(figue_config)
        .run()
        .into_result()
        .map(|v| v.value)
        .map_err(|e| e.to_string())
}

fn config_from_cli(cli: &Cli) -> Config {
    let walk = if cli.frame_pointers {
        WalkStrategy::FramePointers
    } else {
        WalkStrategy::Unwind
    };
    let debug_info = if cli.no_debug_info {
        DebugInfo::Off
    } else {
        DebugInfo::Load
    };
    let skip = cli.skip.unwrap_or(0);
    let max_frames = cli
        .max_frames
        .and_then(NonZeroUsize::new)
        .unwrap_or(CaptureOptions::default().max_frames);

    Config {
        depth: cli.depth.unwrap_or(DEFAULT_DEPTH).max(1),
        skip,
        json: cli.json,
        options: CaptureOptions {
            max_frames,
            skip_frames: skip,
            walk,
            debug_info,
            ..CaptureOptions::default()
        },
        format: FormatOptions {
            show_module: cli.show_module,
        },
    }
}

#[inline(never)]
fn countdown(level: usize, cfg: &Config) -> AnyResult<()> {
    println!("{level}");
    if level >= cfg.depth {
        return black_box(pipeline::stage_one::stage_two::report_here(cfg));
    }
    black_box(countdown(level + 1, cfg))
}

mod pipeline {
    pub mod stage_one {
        pub mod stage_two {
            use crate::{AnyResult, Config};

            #[inline(never)]
            pub fn report_here(cfg: &Config) -> AnyResult<()> {
                std::hint::black_box(crate::report(cfg))
            }
        }
    }
}

#[inline(never)]
fn report(cfg: &Config) -> AnyResult<()> {
    let plain = !cfg.json
        && cfg.format == FormatOptions::default()
        && cfg.options.walk == WalkStrategy::Unwind
        && cfg.options.debug_info == DebugInfo::Load
        && cfg.options.max_frames.get() == stackshot_capture::DEFAULT_MAX_FRAMES;
    if plain {
        stackshot_capture::print(cfg.skip);
        return Ok(());
    }

    let frames = stackshot_capture::capture_with(&cfg.options);
    if cfg.json {
        return print_json(frames);
    }

    let mut stderr = std::io::stderr().lock();
    stackshot_capture::write_frames(&mut stderr, &frames, &cfg.format)
        .map_err(|e| format!("failed to write stack trace: {e}"))
}

fn print_json(frames: Vec<StackFrame>) -> AnyResult<()> {
    let json =
        facet_json::to_string(&frames).map_err(|e| format!("failed to encode frames: {e}"))?;
    println!("{json}");
    Ok(())
}
